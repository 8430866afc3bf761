//! Talk control configuration: scripted or generated replies attached to
//! checkpoints.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The narrative moment a reply is attached to. Doubles as the event kind
/// the scheduler queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TalkTrigger {
    /// A non-user, non-system message was received.
    AfterSpeak,
    BeforeArbiter,
    AfterArbiter,
    /// The checkpoint became active.
    OnEnter,
    /// The checkpoint stopped being active.
    OnExit,
}

impl TalkTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AfterSpeak => "afterSpeak",
            Self::BeforeArbiter => "beforeArbiter",
            Self::AfterArbiter => "afterArbiter",
            Self::OnEnter => "onEnter",
            Self::OnExit => "onExit",
        }
    }
}

/// What a reply says.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyContent {
    /// Fixed text, macro-expanded by the host before posting.
    Static { text: String },
    /// An instruction handed to a quiet generation as the speaker.
    Llm { instruction: String },
}

fn default_true() -> bool {
    true
}

fn default_probability() -> u8 {
    100
}

/// One autonomous reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TalkControlReply {
    /// Only react when this member spoke (afterSpeak). Falls back to
    /// `speaker_id` when unset.
    #[serde(default)]
    pub member_id: Option<String>,
    /// The character who replies: a character name or a story role key.
    pub speaker_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub trigger: TalkTrigger,
    /// Chance in percent, 0..=100.
    #[serde(default = "default_probability")]
    pub probability: u8,
    pub content: ReplyContent,
    #[serde(default)]
    pub max_chars: Option<usize>,
}

impl TalkControlReply {
    pub fn probability(&self) -> u8 {
        self.probability.min(100)
    }

    /// The member whose speech gates an afterSpeak reply.
    pub fn gate_id(&self) -> &str {
        self.member_id.as_deref().unwrap_or(&self.speaker_id)
    }
}

/// Per-checkpoint reply lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TalkControlConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Length cap for replies that don't set their own.
    #[serde(default)]
    pub default_max_chars: Option<usize>,
    #[serde(default)]
    pub checkpoints: HashMap<String, Vec<TalkControlReply>>,
}

impl Default for TalkControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_max_chars: None,
            checkpoints: HashMap::new(),
        }
    }
}

impl TalkControlConfig {
    /// Replies registered on a checkpoint for one trigger, with their
    /// position in the checkpoint's list.
    pub fn replies_for(
        &self,
        checkpoint_id: &str,
        trigger: TalkTrigger,
    ) -> Vec<(usize, &TalkControlReply)> {
        self.checkpoints
            .get(checkpoint_id)
            .map(|replies| {
                replies
                    .iter()
                    .enumerate()
                    .filter(|(_, reply)| reply.trigger == trigger)
                    .collect()
            })
            .unwrap_or_default()
    }
}
