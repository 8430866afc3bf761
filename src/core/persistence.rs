//! Per-chat persistence of story progress.
//!
//! Snapshots are stored as JSON in host settings, keyed by chat id, and
//! tagged with a structural signature of the story they were taken from.
//! Any structural edit to the story invalidates saved progress.
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::state::{default_runtime, migrate_persisted};
use crate::schema::runtime::{PersistedChatState, RuntimeStoryState};
use crate::schema::story::Story;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("settings store unavailable: {0}")]
    Unavailable(String),
}

/// Host settings storage, one JSON record per chat.
#[cfg_attr(test, mockall::automock)]
pub trait SettingsStore {
    fn read(&self, chat_id: &str) -> Result<Option<Value>, StoreError>;
    fn write(&mut self, chat_id: &str, record: Value) -> Result<(), StoreError>;
}

/// In-process store, used by tests and embedders without durable settings.
#[derive(Debug, Clone, Default)]
pub struct MemorySettingsStore {
    records: HashMap<String, Value>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, chat_id: &str) -> Option<&Value> {
        self.records.get(chat_id)
    }

    /// Overwrite a record directly, bypassing the engine.
    pub fn insert(&mut self, chat_id: &str, record: Value) {
        self.records.insert(chat_id.to_string(), record);
    }
}

impl SettingsStore for MemorySettingsStore {
    fn read(&self, chat_id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.records.get(chat_id).cloned())
    }

    fn write(&mut self, chat_id: &str, record: Value) -> Result<(), StoreError> {
        self.records.insert(chat_id.to_string(), record);
        Ok(())
    }
}

/// A single JSON document on disk mapping chat id to snapshot.
#[derive(Debug, Clone)]
pub struct JsonFileSettingsStore {
    path: PathBuf,
}

impl JsonFileSettingsStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn load_all(&self) -> Result<serde_json::Map<String, Value>, StoreError> {
        if !self.path.exists() {
            return Ok(serde_json::Map::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(serde_json::Map::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }
}

impl SettingsStore for JsonFileSettingsStore {
    fn read(&self, chat_id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.load_all()?.remove(chat_id))
    }

    fn write(&mut self, chat_id: &str, record: Value) -> Result<(), StoreError> {
        let mut all = self.load_all()?;
        all.insert(chat_id.to_string(), record);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&all)?)?;
        Ok(())
    }
}

/// Where a hydrated runtime came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationSource {
    Stored,
    Default,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedState {
    pub state: RuntimeStoryState,
    pub source: HydrationSource,
}

impl LoadedState {
    fn fallback(story: &Story) -> Self {
        Self {
            state: default_runtime(Some(story)),
            source: HydrationSource::Default,
        }
    }
}

const FIELD_SEP: &[u8] = b"\x1f";
const RECORD_SEP: &[u8] = b"\x1e";
const GROUP_SEP: &[u8] = b"\x1d";

/// Structural fingerprint of a story.
///
/// Covers checkpoint ids, names and objectives plus each transition's id,
/// endpoints and trigger kind. Titles, descriptions, labels, patterns and
/// talk control are deliberately left out.
pub fn story_signature(story: &Story) -> String {
    let mut hasher = Sha256::new();
    for checkpoint in &story.checkpoints {
        for part in [&checkpoint.id, &checkpoint.name, &checkpoint.objective] {
            hasher.update(part.as_bytes());
            hasher.update(FIELD_SEP);
        }
        hasher.update(RECORD_SEP);
    }
    hasher.update(GROUP_SEP);
    for transition in &story.transitions {
        for part in [
            transition.id.as_str(),
            transition.from.as_str(),
            transition.to.as_str(),
            transition.trigger.kind(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update(FIELD_SEP);
        }
        hasher.update(RECORD_SEP);
    }
    hex::encode(hasher.finalize())
}

#[cfg(not(target_arch = "wasm32"))]
fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// No system clock on wasm32; the embedding host stamps snapshots.
#[cfg(target_arch = "wasm32")]
fn now_millis() -> u64 {
    0
}

/// Build the stored form of a runtime state.
pub fn to_persisted(
    story: &Story,
    state: &RuntimeStoryState,
    story_key: Option<&str>,
) -> PersistedChatState {
    PersistedChatState {
        story_signature: story_signature(story),
        story_key: story_key.map(str::to_string),
        checkpoint_index: state.checkpoint_index as i64,
        active_checkpoint_key: state.active_checkpoint_key.clone(),
        turns_since_eval: state.turns_since_eval as i64,
        checkpoint_turn_count: state.checkpoint_turn_count as i64,
        checkpoint_statuses: state
            .checkpoint_status_map
            .iter()
            .map(|(id, status)| (id.clone(), status.as_str().to_string()))
            .collect(),
        updated_at: now_millis(),
    }
}

/// Write a snapshot for `chat_id`.
pub fn persist_story_state(
    store: &mut dyn SettingsStore,
    chat_id: &str,
    story: &Story,
    state: &RuntimeStoryState,
    story_key: Option<&str>,
) -> Result<(), StoreError> {
    let record = serde_json::to_value(to_persisted(story, state, story_key))?;
    store.write(chat_id, record)
}

/// Read the snapshot for `chat_id`, falling back to a fresh run when it is
/// missing, unreadable, or was taken from a different story.
pub fn load_story_state(
    store: &dyn SettingsStore,
    chat_id: &str,
    story: &Story,
    story_key: Option<&str>,
) -> LoadedState {
    let record = match store.read(chat_id) {
        Ok(Some(record)) => record,
        Ok(None) => return LoadedState::fallback(story),
        Err(e) => {
            tracing::warn!(chat_id, error = %e, "failed to read stored story state");
            return LoadedState::fallback(story);
        }
    };

    let persisted: PersistedChatState = match serde_json::from_value(record) {
        Ok(persisted) => persisted,
        Err(e) => {
            tracing::warn!(chat_id, error = %e, "discarding malformed story state");
            return LoadedState::fallback(story);
        }
    };

    if persisted.story_signature != story_signature(story) {
        tracing::warn!(chat_id, "story changed since progress was saved; starting over");
        return LoadedState::fallback(story);
    }

    if let (Some(stored), Some(live)) = (persisted.story_key.as_deref(), story_key) {
        if stored != live {
            tracing::warn!(chat_id, stored, live, "stored progress belongs to another story");
            return LoadedState::fallback(story);
        }
    }

    LoadedState {
        state: migrate_persisted(&persisted, story),
        source: HydrationSource::Stored,
    }
}
