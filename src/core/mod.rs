pub mod engine;
pub mod host;
pub mod persistence;
pub mod state;
pub mod talk_control;
pub mod triggers;
