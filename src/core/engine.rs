//! The story engine: owns the live runtime for the active chat, hydrates it
//! from host settings and writes it back after each mutation.
use std::rc::Rc;

use crate::core::persistence::{
    load_story_state, persist_story_state, HydrationSource, MemorySettingsStore, SettingsStore,
};
use crate::core::state::{self, default_runtime, sanitize_runtime};
use crate::core::triggers::{timed_transitions, TimedTransition, TriggerEvaluator, TriggerMatch};
use crate::schema::runtime::{CheckpointStatus, RuntimeStoryState};
use crate::schema::story::{Checkpoint, Story, Transition};

/// The chat the engine is currently attached to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatContext {
    pub chat_id: Option<String>,
    /// Only multi-participant chats run stories.
    pub is_group: bool,
    /// Identifies the story file the chat uses, stored next to progress.
    pub story_key: Option<String>,
}

impl ChatContext {
    pub fn group(chat_id: &str) -> Self {
        Self {
            chat_id: Some(chat_id.to_string()),
            is_group: true,
            story_key: None,
        }
    }

    pub fn with_story_key(mut self, key: &str) -> Self {
        self.story_key = Some(key.to_string());
        self
    }

    pub fn is_eligible(&self) -> bool {
        self.is_group && self.chat_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    pub persist: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self { persist: true }
    }
}

/// Checkpoint state machine bound to one story and one chat.
pub struct StoryEngine {
    story: Option<Rc<Story>>,
    chat: ChatContext,
    runtime: RuntimeStoryState,
    hydrated: bool,
    store: Box<dyn SettingsStore>,
    evaluator: TriggerEvaluator,
}

/// Builder for constructing a `StoryEngine`.
pub struct StoryEngineBuilder {
    story: Option<Rc<Story>>,
    chat: ChatContext,
    store: Option<Box<dyn SettingsStore>>,
}

impl StoryEngine {
    pub fn builder() -> StoryEngineBuilder {
        StoryEngineBuilder {
            story: None,
            chat: ChatContext::default(),
            store: None,
        }
    }

    pub fn story(&self) -> Option<&Rc<Story>> {
        self.story.as_ref()
    }

    pub fn chat(&self) -> &ChatContext {
        &self.chat
    }

    pub fn runtime(&self) -> &RuntimeStoryState {
        &self.runtime
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    pub fn store(&self) -> &dyn SettingsStore {
        self.store.as_ref()
    }

    pub fn active_checkpoint(&self) -> Option<&Checkpoint> {
        let story = self.story.as_deref()?;
        story.checkpoints.get(self.runtime.checkpoint_index)
    }

    /// Replace the story. Progress resets until the next `hydrate`.
    pub fn set_story(&mut self, story: Option<Rc<Story>>) {
        tracing::info!(
            title = story.as_deref().map(|s| s.title.as_str()).unwrap_or("<none>"),
            "story set"
        );
        self.story = story;
        self.evaluator = TriggerEvaluator::new();
        self.runtime = default_runtime(self.story.as_deref());
        self.hydrated = false;
    }

    /// Attach to another chat. Progress resets until the next `hydrate`.
    pub fn set_chat_context(&mut self, chat: ChatContext) {
        tracing::debug!(chat_id = ?chat.chat_id, is_group = chat.is_group, "chat context set");
        self.chat = chat;
        self.runtime = default_runtime(self.story.as_deref());
        self.hydrated = false;
    }

    /// Restart the story from its beginning, overwriting saved progress.
    pub fn reset_runtime(&mut self) {
        let fresh = default_runtime(self.story.as_deref());
        self.write_runtime(fresh, WriteOptions::default());
    }

    /// Load saved progress for the current chat, or start fresh.
    pub fn hydrate(&mut self) -> HydrationSource {
        self.hydrated = true;
        let (Some(story), Some(chat_id)) = (self.story.as_deref(), self.chat.chat_id.as_deref())
        else {
            self.runtime = default_runtime(self.story.as_deref());
            return HydrationSource::Default;
        };
        if !self.chat.is_group {
            self.runtime = default_runtime(Some(story));
            return HydrationSource::Default;
        }

        let loaded = load_story_state(
            self.store.as_ref(),
            chat_id,
            story,
            self.chat.story_key.as_deref(),
        );
        tracing::info!(
            chat_id,
            source = ?loaded.source,
            checkpoint = ?loaded.state.active_checkpoint_key,
            "story runtime hydrated"
        );
        self.runtime = loaded.state;
        loaded.source
    }

    /// Replace the live runtime with a sanitised `next` and persist it when
    /// allowed. The active key is rewritten to follow `checkpoint_index`.
    /// Persistence failures are logged and swallowed.
    pub fn write_runtime(
        &mut self,
        next: RuntimeStoryState,
        options: WriteOptions,
    ) -> &RuntimeStoryState {
        self.runtime = sanitize_runtime(next, self.story.as_deref());
        if options.persist {
            self.persist();
        }
        &self.runtime
    }

    fn persist(&mut self) {
        if !self.hydrated || !self.chat.is_eligible() {
            return;
        }
        let (Some(story), Some(chat_id)) = (self.story.as_deref(), self.chat.chat_id.as_deref())
        else {
            return;
        };
        if let Err(e) = persist_story_state(
            self.store.as_mut(),
            chat_id,
            story,
            &self.runtime,
            self.chat.story_key.as_deref(),
        ) {
            tracing::warn!(chat_id, error = %e, "failed to persist story state");
        }
    }

    /// Make checkpoint `index` the active one.
    pub fn activate_index(&mut self, index: usize) -> &RuntimeStoryState {
        let Some(story) = self.story.clone() else {
            return &self.runtime;
        };
        let next = state::activate_index(&self.runtime, &story, index);
        tracing::info!(
            index = next.checkpoint_index,
            checkpoint = ?next.active_checkpoint_key,
            "checkpoint activated"
        );
        self.write_runtime(next, WriteOptions::default())
    }

    pub fn update_checkpoint_status(
        &mut self,
        index: usize,
        status: CheckpointStatus,
    ) -> &RuntimeStoryState {
        let Some(story) = self.story.clone() else {
            return &self.runtime;
        };
        let next = state::update_checkpoint_status(&self.runtime, &story, index, status);
        self.write_runtime(next, WriteOptions::default())
    }

    pub fn set_turns_since_eval(&mut self, turns: u32) -> &RuntimeStoryState {
        let next = RuntimeStoryState {
            turns_since_eval: turns,
            ..self.runtime.clone()
        };
        self.write_runtime(next, WriteOptions::default())
    }

    pub fn set_checkpoint_turn_count(&mut self, turns: u32) -> &RuntimeStoryState {
        let next = RuntimeStoryState {
            checkpoint_turn_count: turns,
            ..self.runtime.clone()
        };
        self.write_runtime(next, WriteOptions::default())
    }

    /// Match `text` against the regex triggers of `transitions`.
    pub fn evaluate_transition_triggers<'a, I>(
        &mut self,
        text: &str,
        transitions: I,
    ) -> Vec<TriggerMatch>
    where
        I: IntoIterator<Item = &'a Transition>,
    {
        self.evaluator.evaluate(text, transitions)
    }

    /// Transitions leaving the active checkpoint.
    pub fn outgoing_transitions(&self) -> Vec<Transition> {
        match (self.story.as_deref(), self.active_checkpoint()) {
            (Some(story), Some(active)) => story.outgoing(&active.id).cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Match `text` against the active checkpoint's outgoing transitions.
    pub fn evaluate_active(&mut self, text: &str) -> Vec<TriggerMatch> {
        let outgoing = self.outgoing_transitions();
        self.evaluator.evaluate(text, &outgoing)
    }

    /// Turn-count triggers on the active checkpoint, for polling.
    pub fn timed_transitions(&self) -> Vec<TimedTransition> {
        timed_transitions(&self.outgoing_transitions())
    }
}

impl StoryEngineBuilder {
    pub fn with_story(mut self, story: Story) -> Self {
        self.story = Some(Rc::new(story));
        self
    }

    pub fn with_shared_story(mut self, story: Rc<Story>) -> Self {
        self.story = Some(story);
        self
    }

    pub fn with_chat(mut self, chat: ChatContext) -> Self {
        self.chat = chat;
        self
    }

    /// Provide the settings store. Defaults to an in-memory store.
    pub fn with_store(mut self, store: Box<dyn SettingsStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> StoryEngine {
        let runtime = default_runtime(self.story.as_deref());
        StoryEngine {
            story: self.story,
            chat: self.chat,
            runtime,
            hydrated: false,
            store: self
                .store
                .unwrap_or_else(|| Box::new(MemorySettingsStore::new())),
            evaluator: TriggerEvaluator::new(),
        }
    }
}
