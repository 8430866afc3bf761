//! Story Orchestrator: checkpoint-driven story runs for multi-character chats.
//!
//! A story is a graph of checkpoints joined by transitions. The engine keeps
//! per-chat progress through that graph, persists it in host settings,
//! matches chat text against transition triggers, and lets characters speak
//! on their own when scripted story moments happen.

pub mod config;
pub mod core;
pub mod logging;
pub mod schema;
