//! Story graph: checkpoints, transitions, roles and their ingestion boundary.
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use super::talk_control::TalkControlConfig;

#[derive(Debug, Error)]
pub enum StoryError {
    #[error("duplicate checkpoint id: {0}")]
    DuplicateCheckpoint(String),
    #[error("duplicate transition id: {0}")]
    DuplicateTransition(String),
    #[error("transition '{transition}' references unknown checkpoint '{checkpoint}'")]
    UnknownEndpoint {
        transition: String,
        checkpoint: String,
    },
    #[error("start checkpoint '{0}' does not exist")]
    UnknownStart(String),
    #[error("talk control references unknown checkpoint '{0}'")]
    UnknownTalkControlCheckpoint(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Lore entries switched on or off when a checkpoint activates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldInfoEffects {
    #[serde(default)]
    pub activate: Vec<String>,
    #[serde(default)]
    pub deactivate: Vec<String>,
}

/// Effects applied by the host when a checkpoint becomes active.
///
/// The engine carries these through untouched; interpreting them is the
/// host's job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEffects {
    /// Author note text keyed by role.
    #[serde(default)]
    pub author_notes: HashMap<String, String>,
    #[serde(default)]
    pub world_info: WorldInfoEffects,
    /// Per-role generation parameter overrides, opaque to the engine.
    #[serde(default)]
    pub preset_overrides: HashMap<String, serde_json::Value>,
    /// Host automation commands run on activation.
    #[serde(default)]
    pub automations: Vec<String>,
}

/// A narrative beat with an objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub on_activate: Option<CheckpointEffects>,
}

/// A single regex pattern with JavaScript-style flags.
///
/// Accepts either a bare string (`"hello"` or the literal form `"/hello/i"`)
/// or a `{ pattern, flags }` record on input. Always serialises as a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawPattern")]
pub struct TriggerPattern {
    pub pattern: String,
    pub flags: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPattern {
    Literal(String),
    Record {
        pattern: String,
        #[serde(default)]
        flags: String,
    },
}

impl From<RawPattern> for TriggerPattern {
    fn from(raw: RawPattern) -> Self {
        match raw {
            RawPattern::Literal(text) => TriggerPattern::parse_literal(&text),
            RawPattern::Record { pattern, flags } => TriggerPattern { pattern, flags },
        }
    }
}

const KNOWN_FLAGS: &str = "dgimsuvxy";

impl TriggerPattern {
    pub fn new(pattern: &str, flags: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            flags: flags.to_string(),
        }
    }

    /// Parse `/body/flags` into its parts. Anything else is taken verbatim
    /// as a pattern with no flags.
    pub fn parse_literal(text: &str) -> Self {
        let trimmed = text.trim();
        if let Some(rest) = trimmed.strip_prefix('/') {
            if let Some(close) = rest.rfind('/') {
                let (body, flags) = (&rest[..close], &rest[close + 1..]);
                if !body.is_empty() && flags.chars().all(|c| KNOWN_FLAGS.contains(c)) {
                    return Self::new(body, flags);
                }
            }
        }
        Self::new(text, "")
    }
}

/// What has to happen for a transition to be taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionTrigger {
    /// Matched against chat text. `condition` is free text for the arbiter.
    Regex {
        patterns: Vec<TriggerPattern>,
        #[serde(default)]
        condition: String,
    },
    /// Matched against the number of turns spent in the source checkpoint.
    Timed { within_turns: u32 },
}

impl TransitionTrigger {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Regex { .. } => "regex",
            Self::Timed { .. } => "timed",
        }
    }
}

/// A directed edge between two checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub id: String,
    pub from: String,
    pub to: String,
    pub trigger: TransitionTrigger,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A normalized story graph. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub lorebook: Option<String>,
    /// Role key to character name.
    #[serde(default)]
    pub roles: HashMap<String, String>,
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub start_checkpoint: Option<String>,
    #[serde(default)]
    pub talk_control: Option<TalkControlConfig>,
}

impl Story {
    /// Load and validate a story from a RON file.
    pub fn load_from_ron(path: &Path) -> Result<Story, StoryError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents)
    }

    /// Parse and validate a story from a RON string.
    pub fn parse_ron(input: &str) -> Result<Story, StoryError> {
        let story: Story = ron::from_str(input)?;
        story.validate()?;
        Ok(story)
    }

    /// Parse and validate a story from normalized JSON.
    pub fn from_json(input: &str) -> Result<Story, StoryError> {
        let story: Story = serde_json::from_str(input)?;
        story.validate()?;
        Ok(story)
    }

    /// Check the graph invariants: unique ids and resolvable references.
    pub fn validate(&self) -> Result<(), StoryError> {
        let mut checkpoint_ids = FxHashSet::default();
        for checkpoint in &self.checkpoints {
            if !checkpoint_ids.insert(checkpoint.id.as_str()) {
                return Err(StoryError::DuplicateCheckpoint(checkpoint.id.clone()));
            }
        }

        let mut transition_ids = FxHashSet::default();
        for transition in &self.transitions {
            if !transition_ids.insert(transition.id.as_str()) {
                return Err(StoryError::DuplicateTransition(transition.id.clone()));
            }
            for endpoint in [&transition.from, &transition.to] {
                if !checkpoint_ids.contains(endpoint.as_str()) {
                    return Err(StoryError::UnknownEndpoint {
                        transition: transition.id.clone(),
                        checkpoint: endpoint.clone(),
                    });
                }
            }
        }

        if let Some(start) = &self.start_checkpoint {
            if !checkpoint_ids.contains(start.as_str()) {
                return Err(StoryError::UnknownStart(start.clone()));
            }
        }

        if let Some(talk_control) = &self.talk_control {
            for checkpoint_id in talk_control.checkpoints.keys() {
                if !checkpoint_ids.contains(checkpoint_id.as_str()) {
                    return Err(StoryError::UnknownTalkControlCheckpoint(
                        checkpoint_id.clone(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Index of the checkpoint a fresh run starts at.
    pub fn start_index(&self) -> usize {
        self.start_checkpoint
            .as_deref()
            .and_then(|id| self.index_of(id))
            .unwrap_or(0)
    }

    pub fn index_of(&self, checkpoint_id: &str) -> Option<usize> {
        self.checkpoints.iter().position(|c| c.id == checkpoint_id)
    }

    pub fn checkpoint(&self, checkpoint_id: &str) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|c| c.id == checkpoint_id)
    }

    /// Transitions leaving the given checkpoint, in declaration order.
    pub fn outgoing<'a>(&'a self, from: &'a str) -> impl Iterator<Item = &'a Transition> + 'a {
        self.transitions.iter().filter(move |t| t.from == from)
    }

    /// Character name bound to a role key, matched case-insensitively.
    pub fn role_alias(&self, role: &str) -> Option<&str> {
        let wanted = normalize_name(role);
        self.roles
            .iter()
            .find(|(key, _)| normalize_name(key) == wanted)
            .map(|(_, name)| name.as_str())
    }
}

/// Normalise a character or role name for comparison: trimmed, lowercased,
/// inner whitespace collapsed.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(id: &str) -> Checkpoint {
        Checkpoint {
            id: id.to_string(),
            name: id.to_uppercase(),
            objective: format!("reach {id}"),
            on_activate: None,
        }
    }

    fn transition(id: &str, from: &str, to: &str) -> Transition {
        Transition {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            trigger: TransitionTrigger::Timed { within_turns: 3 },
            label: None,
            description: None,
        }
    }

    fn story() -> Story {
        Story {
            title: "Test".to_string(),
            description: None,
            lorebook: None,
            roles: HashMap::from([("Bard".to_string(), "Finn the Bard".to_string())]),
            checkpoints: vec![checkpoint("a"), checkpoint("b")],
            transitions: vec![transition("t1", "a", "b")],
            start_checkpoint: None,
            talk_control: None,
        }
    }

    #[test]
    fn valid_story_passes() {
        assert!(story().validate().is_ok());
    }

    #[test]
    fn duplicate_checkpoint_rejected() {
        let mut s = story();
        s.checkpoints.push(checkpoint("a"));
        assert!(matches!(s.validate(), Err(StoryError::DuplicateCheckpoint(id)) if id == "a"));
    }

    #[test]
    fn duplicate_transition_rejected() {
        let mut s = story();
        s.transitions.push(transition("t1", "b", "a"));
        assert!(matches!(s.validate(), Err(StoryError::DuplicateTransition(_))));
    }

    #[test]
    fn dangling_transition_rejected() {
        let mut s = story();
        s.transitions.push(transition("t2", "b", "nowhere"));
        assert!(matches!(
            s.validate(),
            Err(StoryError::UnknownEndpoint { checkpoint, .. }) if checkpoint == "nowhere"
        ));
    }

    #[test]
    fn unknown_start_rejected() {
        let mut s = story();
        s.start_checkpoint = Some("zzz".to_string());
        assert!(matches!(s.validate(), Err(StoryError::UnknownStart(_))));
    }

    #[test]
    fn start_index_uses_explicit_start() {
        let mut s = story();
        assert_eq!(s.start_index(), 0);
        s.start_checkpoint = Some("b".to_string());
        assert_eq!(s.start_index(), 1);
    }

    #[test]
    fn outgoing_filters_by_source() {
        let mut s = story();
        s.transitions.push(transition("t2", "b", "a"));
        let ids: Vec<_> = s.outgoing("b").map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t2"]);
    }

    #[test]
    fn role_alias_is_case_insensitive() {
        let s = story();
        assert_eq!(s.role_alias("  bard "), Some("Finn the Bard"));
        assert_eq!(s.role_alias("guard"), None);
    }

    #[test]
    fn literal_pattern_splits_flags() {
        assert_eq!(TriggerPattern::parse_literal("/hello/i"), TriggerPattern::new("hello", "i"));
        assert_eq!(TriggerPattern::parse_literal("plain"), TriggerPattern::new("plain", ""));
        // Not a valid flag set, kept verbatim.
        assert_eq!(
            TriggerPattern::parse_literal("/a/b/c"),
            TriggerPattern::new("/a/b/c", "")
        );
        assert_eq!(TriggerPattern::parse_literal("/a/b/gi"), TriggerPattern::new("a/b", "gi"));
    }

    #[test]
    fn json_patterns_accept_both_shapes() {
        let json = r#"{
            "title": "Shapes",
            "checkpoints": [{"id": "a", "name": "A"}, {"id": "b", "name": "B"}],
            "transitions": [{
                "id": "t1", "from": "a", "to": "b",
                "trigger": {"regex": {"patterns": ["/door/i", {"pattern": "gate", "flags": "i"}]}}
            }]
        }"#;
        let s = Story::from_json(json).unwrap();
        match &s.transitions[0].trigger {
            TransitionTrigger::Regex { patterns, condition } => {
                assert_eq!(patterns[0], TriggerPattern::new("door", "i"));
                assert_eq!(patterns[1], TriggerPattern::new("gate", "i"));
                assert!(condition.is_empty());
            }
            other => panic!("unexpected trigger {other:?}"),
        }
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize_name("  Finn   the BARD "), "finn the bard");
    }
}
