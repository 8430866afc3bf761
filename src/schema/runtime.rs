//! Runtime progress through a story and its persisted form.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Progress marker for one checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Pending,
    Current,
    Complete,
    /// Sticky: survives advancement until explicitly overridden.
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Current => "current",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// Lenient parse used when migrating stored snapshots.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "current" => Some(Self::Current),
            "complete" | "completed" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Live progress for the active chat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStoryState {
    pub checkpoint_index: usize,
    pub active_checkpoint_key: Option<String>,
    pub turns_since_eval: u32,
    pub checkpoint_turn_count: u32,
    pub checkpoint_status_map: HashMap<String, CheckpointStatus>,
}

impl RuntimeStoryState {
    pub fn status_of(&self, checkpoint_id: &str) -> Option<CheckpointStatus> {
        self.checkpoint_status_map.get(checkpoint_id).copied()
    }
}

/// The snapshot written to host settings, keyed by chat id.
///
/// Numeric fields are signed and every field is optional on input so a
/// hand-edited or older snapshot still deserialises; sanitising happens
/// afterwards against the live story.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedChatState {
    #[serde(default)]
    pub story_signature: String,
    #[serde(default)]
    pub story_key: Option<String>,
    #[serde(default)]
    pub checkpoint_index: i64,
    #[serde(default)]
    pub active_checkpoint_key: Option<String>,
    #[serde(default)]
    pub turns_since_eval: i64,
    #[serde(default)]
    pub checkpoint_turn_count: i64,
    #[serde(default)]
    pub checkpoint_statuses: HashMap<String, String>,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub updated_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse_is_lenient() {
        assert_eq!(CheckpointStatus::parse(" Failed "), Some(CheckpointStatus::Failed));
        assert_eq!(CheckpointStatus::parse("completed"), Some(CheckpointStatus::Complete));
        assert_eq!(CheckpointStatus::parse("bogus"), None);
    }

    #[test]
    fn persisted_state_reads_partial_json() {
        let state: PersistedChatState =
            serde_json::from_str(r#"{"storySignature": "abc", "checkpointIndex": -4}"#).unwrap();
        assert_eq!(state.story_signature, "abc");
        assert_eq!(state.checkpoint_index, -4);
        assert_eq!(state.turns_since_eval, 0);
        assert!(state.checkpoint_statuses.is_empty());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&CheckpointStatus::Current).unwrap();
        assert_eq!(json, "\"current\"");
    }
}
