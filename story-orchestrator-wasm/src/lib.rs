//! WASM bindings for story-orchestrator: drives a story run from a browser host.
//!
//! Everything crossing the boundary is a JSON string. Saved progress lives in
//! an in-memory settings table that the host imports from and exports to its
//! own storage.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::rc::Rc;
use wasm_bindgen::prelude::*;

use story_orchestrator::core::engine::{ChatContext, StoryEngine};
use story_orchestrator::core::persistence::{
    story_signature, HydrationSource, MemorySettingsStore, SettingsStore, StoreError,
};
use story_orchestrator::core::talk_control::{
    select_action_for_event, EventMetadata, ReplyRuntimeTable, TalkControlEvent,
};
use story_orchestrator::schema::runtime::CheckpointStatus;
use story_orchestrator::schema::story::Story;
use story_orchestrator::schema::talk_control::{ReplyContent, TalkTrigger};

// ---------------------------------------------------------------------------
// Settings table shared between the session and its engine
// ---------------------------------------------------------------------------
#[derive(Clone, Default)]
struct SharedSettings(Rc<RefCell<MemorySettingsStore>>);

impl SettingsStore for SharedSettings {
    fn read(&self, chat_id: &str) -> Result<Option<serde_json::Value>, StoreError> {
        self.0.borrow().read(chat_id)
    }

    fn write(&mut self, chat_id: &str, mut record: serde_json::Value) -> Result<(), StoreError> {
        if let Some(fields) = record.as_object_mut() {
            fields.insert("updatedAt".to_string(), serde_json::json!(js_sys::Date::now() as u64));
        }
        self.0.borrow_mut().write(chat_id, record)
    }
}

// ---------------------------------------------------------------------------
// JSON helper types for communication across the WASM boundary
// ---------------------------------------------------------------------------
#[derive(serde::Serialize)]
struct MatchInfo {
    transition_id: String,
    to: String,
    pattern: String,
}

#[derive(serde::Serialize)]
struct TimedInfo {
    transition_id: String,
    to: String,
    within_turns: u32,
    due: bool,
}

#[derive(serde::Serialize)]
struct ReplyPreview {
    reply_index: usize,
    speaker_id: String,
    kind: &'static str,
    text: String,
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, JsError> {
    serde_json::to_string(value).map_err(|e| JsError::new(&format!("Serialization error: {e}")))
}

fn parse_trigger(s: &str) -> Option<TalkTrigger> {
    match s {
        "afterSpeak" => Some(TalkTrigger::AfterSpeak),
        "beforeArbiter" => Some(TalkTrigger::BeforeArbiter),
        "afterArbiter" => Some(TalkTrigger::AfterArbiter),
        "onEnter" => Some(TalkTrigger::OnEnter),
        "onExit" => Some(TalkTrigger::OnExit),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------
#[wasm_bindgen]
pub struct StorySession {
    engine: StoryEngine,
    settings: SharedSettings,
    rng: StdRng,
    reply_usage: ReplyRuntimeTable,
    next_event_id: u64,
}

#[wasm_bindgen]
impl StorySession {
    /// Create a session from a normalized story in JSON form.
    #[wasm_bindgen(constructor)]
    pub fn new(story_json: &str, seed: u64) -> Result<StorySession, JsError> {
        let story = Story::from_json(story_json)
            .map_err(|e| JsError::new(&format!("Story error: {e}")))?;
        Ok(Self::with_story(story, seed))
    }

    /// Create a session from a story authored in RON.
    pub fn from_ron(story_ron: &str, seed: u64) -> Result<StorySession, JsError> {
        let story =
            Story::parse_ron(story_ron).map_err(|e| JsError::new(&format!("Story error: {e}")))?;
        Ok(Self::with_story(story, seed))
    }

    /// Seed saved progress for a chat, as previously returned by `export_progress`.
    pub fn import_progress(&mut self, chat_id: &str, record_json: &str) -> Result<(), JsError> {
        let record: serde_json::Value = serde_json::from_str(record_json)
            .map_err(|e| JsError::new(&format!("Invalid progress JSON: {e}")))?;
        self.settings.0.borrow_mut().insert(chat_id, record);
        Ok(())
    }

    /// Saved progress for a chat, or `null`.
    pub fn export_progress(&self, chat_id: &str) -> Result<String, JsError> {
        to_json(&self.settings.0.borrow().get(chat_id))
    }

    /// Switch to a chat and load its progress. Returns "stored" or "default".
    pub fn open_chat(
        &mut self,
        chat_id: &str,
        is_group: bool,
        story_key: Option<String>,
    ) -> String {
        self.engine.set_chat_context(ChatContext {
            chat_id: Some(chat_id.to_string()),
            is_group,
            story_key,
        });
        self.reply_usage.clear();
        match self.engine.hydrate() {
            HydrationSource::Stored => "stored".to_string(),
            HydrationSource::Default => "default".to_string(),
        }
    }

    /// Current runtime state as JSON.
    pub fn runtime(&self) -> Result<String, JsError> {
        to_json(self.engine.runtime())
    }

    pub fn activate(&mut self, index: usize) -> Result<String, JsError> {
        to_json(self.engine.activate_index(index))
    }

    pub fn set_status(&mut self, index: usize, status: &str) -> Result<String, JsError> {
        let status = CheckpointStatus::parse(status)
            .ok_or_else(|| JsError::new(&format!("Unknown status: {status}")))?;
        to_json(self.engine.update_checkpoint_status(index, status))
    }

    pub fn set_turn_counters(
        &mut self,
        turns_since_eval: u32,
        checkpoint_turn_count: u32,
    ) -> Result<String, JsError> {
        self.engine.set_turns_since_eval(turns_since_eval);
        to_json(self.engine.set_checkpoint_turn_count(checkpoint_turn_count))
    }

    /// Restart from the beginning, overwriting saved progress.
    pub fn reset(&mut self) -> Result<String, JsError> {
        self.engine.reset_runtime();
        self.reply_usage.clear();
        to_json(self.engine.runtime())
    }

    /// JSON array of transitions from the active checkpoint whose regex
    /// triggers match `text`.
    pub fn evaluate(&mut self, text: &str) -> Result<String, JsError> {
        let matches: Vec<MatchInfo> = self
            .engine
            .evaluate_active(text)
            .into_iter()
            .map(|m| MatchInfo {
                transition_id: m.transition_id,
                to: m.to,
                pattern: m.pattern,
            })
            .collect();
        to_json(&matches)
    }

    /// JSON array of timed transitions from the active checkpoint.
    pub fn timed_transitions(&self) -> Result<String, JsError> {
        let count = self.engine.runtime().checkpoint_turn_count;
        let timed: Vec<TimedInfo> = self
            .engine
            .timed_transitions()
            .into_iter()
            .map(|t| TimedInfo {
                due: t.is_due(count),
                transition_id: t.transition_id,
                to: t.to,
                within_turns: t.within_turns,
            })
            .collect();
        to_json(&timed)
    }

    /// Pick the reply talk control would send for an event on the active
    /// checkpoint, and mark it used for `turn`. Returns `null` when nothing
    /// qualifies.
    pub fn preview_reply(
        &mut self,
        trigger: &str,
        speaker: Option<String>,
        turn: u64,
    ) -> Result<String, JsError> {
        let kind = parse_trigger(trigger)
            .ok_or_else(|| JsError::new(&format!("Unknown trigger: {trigger}")))?;
        let story = self.engine.story().cloned();
        let (Some(story), Some(active)) = (story, self.engine.active_checkpoint()) else {
            return Ok("null".to_string());
        };
        self.next_event_id += 1;
        let event = TalkControlEvent {
            id: self.next_event_id,
            kind,
            checkpoint_id: active.id.clone(),
            metadata: EventMetadata { speaker },
        };
        self.reply_usage.advance_turn(turn);
        let Some(action) =
            select_action_for_event(&story, &event, &self.reply_usage, turn, &mut self.rng)
        else {
            return Ok("null".to_string());
        };
        self.reply_usage.record_dispatch(action.key(), turn);
        let (kind, text) = match &action.reply.content {
            ReplyContent::Static { text } => ("static", text.clone()),
            ReplyContent::Llm { instruction } => ("llm", instruction.clone()),
        };
        to_json(&ReplyPreview {
            reply_index: action.reply_index,
            speaker_id: action.reply.speaker_id.clone(),
            kind,
            text,
        })
    }

    /// Structural fingerprint of the loaded story.
    pub fn signature(&self) -> String {
        self.engine
            .story()
            .map(|story| story_signature(story))
            .unwrap_or_default()
    }

    /// JSON array of checkpoint ids in story order.
    pub fn checkpoint_ids(&self) -> String {
        let ids: Vec<&str> = self
            .engine
            .story()
            .map(|story| story.checkpoints.iter().map(|c| c.id.as_str()).collect())
            .unwrap_or_default();
        serde_json::to_string(&ids).unwrap_or_else(|_| "[]".to_string())
    }
}

// Private helpers
impl StorySession {
    fn with_story(story: Story, seed: u64) -> StorySession {
        let settings = SharedSettings::default();
        let engine = StoryEngine::builder()
            .with_story(story)
            .with_store(Box::new(settings.clone()))
            .build();
        StorySession {
            engine,
            settings,
            rng: StdRng::seed_from_u64(seed),
            reply_usage: ReplyRuntimeTable::default(),
            next_event_id: 0,
        }
    }
}
