//! Data types shared by the engine and its hosts.

pub mod chat;
pub mod runtime;
pub mod story;
pub mod talk_control;
