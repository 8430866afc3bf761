//! Records exchanged with the host chat runtime.
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Key under `ChatMessage::extra` marking messages this engine produced.
pub const PROVENANCE_KEY: &str = "story_orchestrator";

/// A member of the host's character roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl Character {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            avatar: None,
        }
    }
}

/// One chat transcript entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub name: String,
    #[serde(default)]
    pub is_user: bool,
    #[serde(default)]
    pub is_system: bool,
    #[serde(rename = "mes")]
    pub content: String,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

/// Where an injected message came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub checkpoint_id: String,
    pub reply_index: usize,
    pub trigger: &'static str,
}

impl ChatMessage {
    /// A character message stamped with orchestrator provenance.
    pub fn injected(speaker: &Character, content: String, provenance: &Provenance) -> Self {
        let mut extra = Map::new();
        extra.insert(
            PROVENANCE_KEY.to_string(),
            json!({
                "source": "talk_control",
                "checkpointId": provenance.checkpoint_id,
                "replyIndex": provenance.reply_index,
                "trigger": provenance.trigger,
            }),
        );
        Self {
            name: speaker.name.clone(),
            is_user: false,
            is_system: false,
            content,
            extra,
        }
    }

    pub fn is_injected(&self) -> bool {
        self.extra.contains_key(PROVENANCE_KEY)
    }

    /// True for messages a character (not the user, not the system) wrote.
    pub fn is_character_message(&self) -> bool {
        !self.is_user && !self.is_system
    }
}
