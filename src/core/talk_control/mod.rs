//! Talk control: characters speaking on their own at scripted story moments.
//!
//! Story events (entering or leaving a checkpoint, arbiter phases, a member
//! speaking) are queued, matched against the active checkpoint's replies,
//! and dispatched one at a time through the host. A host generation about
//! to start may be aborted so a pending reply goes first.
//!
//! `TalkControl` is a cheap handle over single-threaded shared state. No
//! `RefCell` borrow is held across an `await`, so host callbacks fired
//! during a dispatch can re-enter the scheduler safely; the reentrancy
//! guards make sure those callbacks don't react to our own output.
mod dispatch;
mod guard;
mod queue;
mod selection;

pub use dispatch::{dispatch_action, resolve_character, truncate_reply, DispatchError};
pub use guard::{DepthGuard, ReentrancyGuards};
pub use queue::{EventMetadata, EventQueue, TalkControlEvent};
pub use selection::{
    next_ready_action, roll_probability, select_action_for_event, speaker_matches, ReplyKey,
    ReplyRuntimeState, ReplyRuntimeTable, SelectedAction,
};

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use thiserror::Error;

use crate::config::TalkControlSettings;
use crate::core::host::{
    EventBus, EventHandler, GenerationRequest, HostEvent, HostEventKind, SubscriptionId,
    TalkControlHost,
};
use crate::schema::chat::ChatMessage;
use crate::schema::story::Story;
use crate::schema::talk_control::TalkTrigger;

#[derive(Debug, Error)]
pub enum TalkControlError {
    #[error("talk control requires a host")]
    MissingHost,
    #[error("invalid talk control settings: {0}")]
    InvalidSettings(String),
}

/// Which side of the arbiter's evaluation just happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterPhase {
    Before,
    After,
}

impl ArbiterPhase {
    fn trigger(self) -> TalkTrigger {
        match self {
            Self::Before => TalkTrigger::BeforeArbiter,
            Self::After => TalkTrigger::AfterArbiter,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptDecision {
    /// Let the host generation run.
    Proceed,
    /// The generation was aborted; a reply is pending dispatch.
    Abort,
}

/// Outcome of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpReport {
    pub dispatched: usize,
    pub failed: usize,
    /// Stopped early because a host generation became active.
    pub interrupted: bool,
}

struct SchedulerState {
    story: Option<Rc<Story>>,
    checkpoint_id: Option<String>,
    turn: u64,
    queue: EventQueue,
    replies: ReplyRuntimeTable,
    rng: StdRng,
    pending: Option<SelectedAction>,
    generation_active: bool,
    /// Quiet generations started by the dispatch in flight.
    own_quiet_generations: u32,
    suppressed: bool,
    flush_requested: bool,
    flushing: bool,
}

struct Inner {
    state: RefCell<SchedulerState>,
    guards: ReentrancyGuards,
    host: Rc<dyn TalkControlHost>,
    settings: TalkControlSettings,
}

/// Handle to the talk control scheduler. Clones share state.
#[derive(Clone)]
pub struct TalkControl {
    inner: Rc<Inner>,
}

/// Builder for constructing a `TalkControl`.
pub struct TalkControlBuilder {
    host: Option<Rc<dyn TalkControlHost>>,
    settings: TalkControlSettings,
    story: Option<Rc<Story>>,
}

impl TalkControlBuilder {
    pub fn with_host(mut self, host: Rc<dyn TalkControlHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_settings(mut self, settings: TalkControlSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_story(mut self, story: Rc<Story>) -> Self {
        self.story = Some(story);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.settings.seed = Some(seed);
        self
    }

    pub fn flush_limit(mut self, limit: usize) -> Self {
        self.settings.flush_limit = limit;
        self
    }

    pub fn build(self) -> Result<TalkControl, TalkControlError> {
        let host = self.host.ok_or(TalkControlError::MissingHost)?;
        if self.settings.flush_limit == 0 {
            return Err(TalkControlError::InvalidSettings(
                "flush_limit must be at least 1".to_string(),
            ));
        }
        let rng = match self.settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let state = SchedulerState {
            story: self.story,
            checkpoint_id: None,
            turn: 0,
            queue: EventQueue::with_capacity(self.settings.max_queue),
            replies: ReplyRuntimeTable::default(),
            rng,
            pending: None,
            generation_active: false,
            own_quiet_generations: 0,
            suppressed: false,
            flush_requested: false,
            flushing: false,
        };
        Ok(TalkControl {
            inner: Rc::new(Inner {
                state: RefCell::new(state),
                guards: ReentrancyGuards::default(),
                host,
                settings: self.settings,
            }),
        })
    }
}

/// Clears the `flushing` flag when a pass ends, however it ends.
struct FlushPass<'a> {
    state: &'a RefCell<SchedulerState>,
}

impl Drop for FlushPass<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.try_borrow_mut() {
            state.flushing = false;
        }
    }
}

/// Bus subscriptions made by `TalkControl::attach`.
#[derive(Debug)]
pub struct BusSubscriptions {
    ids: Vec<SubscriptionId>,
}

impl BusSubscriptions {
    pub fn ids(&self) -> &[SubscriptionId] {
        &self.ids
    }

    /// Revoke every subscription. Returns how many were still live.
    pub fn detach(self, bus: &dyn EventBus) -> usize {
        self.ids.into_iter().filter(|id| bus.unsubscribe(*id)).count()
    }
}

fn bind(weak: &Weak<Inner>, on_event: fn(&TalkControl, &HostEvent)) -> EventHandler {
    let weak = weak.clone();
    Box::new(move |event| {
        if let Some(inner) = weak.upgrade() {
            on_event(&TalkControl { inner }, event);
        }
    })
}

impl TalkControl {
    pub fn builder() -> TalkControlBuilder {
        TalkControlBuilder {
            host: None,
            settings: TalkControlSettings::default(),
            story: None,
        }
    }

    /// Subscribe to the host lifecycle events the scheduler reacts to.
    /// Handlers hold weak references and go quiet once the scheduler is
    /// dropped.
    pub fn attach(&self, bus: &dyn EventBus) -> BusSubscriptions {
        let weak = Rc::downgrade(&self.inner);
        let ids = vec![
            bus.subscribe(
                HostEventKind::MessageReceived,
                bind(&weak, |tc, event| {
                    if let HostEvent::MessageReceived(message) = event {
                        tc.on_message_received(message);
                    }
                }),
            ),
            bus.subscribe(
                HostEventKind::GenerationStarted,
                bind(&weak, |tc, event| {
                    if let HostEvent::GenerationStarted(request) = event {
                        tc.on_generation_started(request);
                    }
                }),
            ),
            bus.subscribe(
                HostEventKind::GenerationStopped,
                bind(&weak, |tc, _| tc.on_generation_stopped()),
            ),
            bus.subscribe(
                HostEventKind::GenerationEnded,
                bind(&weak, |tc, _| tc.on_generation_ended()),
            ),
            bus.subscribe(
                HostEventKind::ChatChanged,
                bind(&weak, |tc, _| tc.on_chat_changed()),
            ),
        ];
        BusSubscriptions { ids }
    }

    fn story_enabled(&self) -> bool {
        self.inner
            .state
            .borrow()
            .story
            .as_deref()
            .and_then(|story| story.talk_control.as_ref())
            .map(|config| config.enabled)
            .unwrap_or(false)
    }

    /// A story with enabled talk control is loaded and the chat is a group.
    pub fn is_active(&self) -> bool {
        self.story_enabled() && self.inner.host.is_group_chat()
    }

    /// Swap the story. Queue, reply usage, pending action and checkpoint
    /// all reset.
    pub fn set_story(&self, story: Option<Rc<Story>>) {
        let mut state = self.inner.state.borrow_mut();
        tracing::info!(
            title = story.as_deref().map(|s| s.title.as_str()).unwrap_or("<none>"),
            "talk control story set"
        );
        state.story = story;
        state.checkpoint_id = None;
        state.turn = 0;
        state.queue.clear();
        state.replies.clear();
        state.pending = None;
        state.flush_requested = false;
    }

    /// Follow the active checkpoint, queueing onExit for the old one and
    /// onEnter for the new one.
    pub fn set_checkpoint(&self, checkpoint_id: Option<&str>) {
        let previous = {
            let mut state = self.inner.state.borrow_mut();
            if state.checkpoint_id.as_deref() == checkpoint_id {
                return;
            }
            std::mem::replace(&mut state.checkpoint_id, checkpoint_id.map(str::to_string))
        };
        tracing::debug!(from = ?previous, to = ?checkpoint_id, "talk control checkpoint changed");
        if let Some(previous) = previous {
            self.queue_event(TalkTrigger::OnExit, &previous, EventMetadata::default());
        }
        if let Some(next) = checkpoint_id {
            self.queue_event(TalkTrigger::OnEnter, next, EventMetadata::default());
        }
    }

    pub fn notify_arbiter_phase(&self, phase: ArbiterPhase) {
        let Some(checkpoint_id) = self.checkpoint() else {
            return;
        };
        self.queue_event(phase.trigger(), &checkpoint_id, EventMetadata::default());
    }

    /// Per-turn reply counters reset when the turn moves on.
    pub fn update_turn(&self, turn: u64) {
        let mut state = self.inner.state.borrow_mut();
        if state.turn != turn {
            state.turn = turn;
            state.replies.advance_turn(turn);
        }
    }

    /// Queue an event and request a flush. Dropped when inactive.
    pub fn queue_event(
        &self,
        kind: TalkTrigger,
        checkpoint_id: &str,
        metadata: EventMetadata,
    ) -> Option<u64> {
        if !self.is_active() {
            tracing::trace!(kind = kind.as_str(), "talk control inactive; event ignored");
            return None;
        }
        let mut state = self.inner.state.borrow_mut();
        let id = state.queue.push(kind, checkpoint_id, metadata);
        state.flush_requested = true;
        tracing::debug!(event_id = id, kind = kind.as_str(), checkpoint = checkpoint_id, "queued");
        Some(id)
    }

    /// Queue afterSpeak for a character message that isn't ours.
    pub fn on_message_received(&self, message: &ChatMessage) {
        if self.inner.guards.message_held() {
            tracing::trace!(speaker = %message.name, "message during dispatch ignored");
            return;
        }
        if !message.is_character_message() || message.is_injected() {
            return;
        }
        let Some(checkpoint_id) = self.checkpoint() else {
            return;
        };
        self.queue_event(
            TalkTrigger::AfterSpeak,
            &checkpoint_id,
            EventMetadata::spoken_by(&message.name),
        );
    }

    /// Called by the host before it generates. Aborts the generation when a
    /// reply is ready to go instead.
    pub fn intercept_generation(&self, request: &GenerationRequest) -> InterceptDecision {
        if request.is_quiet() || self.inner.guards.generation_held() || !self.is_active() {
            return InterceptDecision::Proceed;
        }
        {
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            if state.suppressed {
                return InterceptDecision::Proceed;
            }
            let Some(story) = state.story.clone() else {
                return InterceptDecision::Proceed;
            };
            if state.pending.is_none() {
                state.pending = next_ready_action(
                    &mut state.queue,
                    &story,
                    &state.replies,
                    state.turn,
                    &mut state.rng,
                );
            }
            let Some(action) = state.pending.as_ref() else {
                return InterceptDecision::Proceed;
            };
            tracing::info!(
                checkpoint = %action.event.checkpoint_id,
                reply = action.reply_index,
                trigger = action.event.kind.as_str(),
                "aborting host generation for talk control reply"
            );
            state.flush_requested = true;
        }
        self.inner.host.abort_generation();
        InterceptDecision::Abort
    }

    /// Quiet generations never block a flush. A normal one does, even when
    /// the host starts it in response to a reply we just posted.
    pub fn on_generation_started(&self, request: &GenerationRequest) {
        let mut state = self.inner.state.borrow_mut();
        if request.is_quiet() {
            if self.inner.guards.generation_held() {
                state.own_quiet_generations += 1;
            }
            return;
        }
        state.generation_active = true;
    }

    pub fn on_generation_stopped(&self) {
        self.generation_finished();
    }

    pub fn on_generation_ended(&self) {
        self.generation_finished();
    }

    fn generation_finished(&self) {
        let mut state = self.inner.state.borrow_mut();
        if state.own_quiet_generations > 0 {
            state.own_quiet_generations -= 1;
            return;
        }
        state.generation_active = false;
        if state.pending.is_some() || !state.queue.is_empty() {
            state.flush_requested = true;
        }
    }

    /// A different chat was opened: queued work and reply usage are
    /// discarded. The story stays loaded.
    pub fn on_chat_changed(&self) {
        let mut state = self.inner.state.borrow_mut();
        state.checkpoint_id = None;
        state.turn = 0;
        state.queue.clear();
        state.replies.clear();
        state.pending = None;
        state.generation_active = false;
        state.own_quiet_generations = 0;
        state.flush_requested = false;
        tracing::debug!("talk control reset for chat change");
    }

    /// While suppressed nothing is intercepted or dispatched; events keep
    /// queueing.
    pub fn set_suppressed(&self, suppressed: bool) {
        let mut state = self.inner.state.borrow_mut();
        state.suppressed = suppressed;
        if !suppressed && (state.pending.is_some() || !state.queue.is_empty()) {
            state.flush_requested = true;
        }
    }

    /// Run one flush pass: the pending action first, then queued events,
    /// one dispatch at a time. At most `flush_limit` dispatches are
    /// attempted. A pass already in progress makes this a no-op.
    pub async fn pump(&self) -> PumpReport {
        let mut report = PumpReport::default();
        {
            let mut state = self.inner.state.borrow_mut();
            if state.flushing {
                return report;
            }
            state.flushing = true;
            state.flush_requested = false;
        }
        let _pass = FlushPass {
            state: &self.inner.state,
        };

        let limit = self.inner.settings.flush_limit;
        let mut attempts = 0;
        while attempts < limit {
            if !self.is_active() {
                break;
            }
            let next = {
                let mut guard = self.inner.state.borrow_mut();
                let state = &mut *guard;
                if state.generation_active {
                    state.flush_requested = true;
                    report.interrupted = true;
                    break;
                }
                if state.suppressed {
                    break;
                }
                let Some(story) = state.story.clone() else {
                    break;
                };
                let action = state.pending.take().or_else(|| {
                    next_ready_action(
                        &mut state.queue,
                        &story,
                        &state.replies,
                        state.turn,
                        &mut state.rng,
                    )
                });
                action.map(|action| (story, action))
            };
            let Some((story, action)) = next else {
                break;
            };
            attempts += 1;
            if self.run_dispatch(&story, action).await {
                report.dispatched += 1;
            } else {
                report.failed += 1;
            }
        }

        if attempts >= limit {
            let mut state = self.inner.state.borrow_mut();
            if state.pending.is_some() || !state.queue.is_empty() {
                tracing::debug!(limit, remaining = state.queue.len(), "flush limit reached");
                state.flush_requested = true;
            }
        }
        report
    }

    async fn run_dispatch(&self, story: &Rc<Story>, action: SelectedAction) -> bool {
        let result = {
            let _generation = self.inner.guards.hold_generation();
            let _message = self.inner.guards.hold_message();
            dispatch_action(
                self.inner.host.as_ref(),
                story,
                &action,
                self.inner.settings.default_max_chars,
            )
            .await
        };
        self.inner.state.borrow_mut().own_quiet_generations = 0;
        match result {
            Ok(message) => {
                let mut state = self.inner.state.borrow_mut();
                let same_story = state
                    .story
                    .as_ref()
                    .map(|current| Rc::ptr_eq(current, story))
                    .unwrap_or(false);
                if same_story {
                    let turn = state.turn;
                    state.replies.record_dispatch(action.key(), turn);
                }
                tracing::info!(
                    speaker = %message.name,
                    checkpoint = %action.event.checkpoint_id,
                    reply = action.reply_index,
                    trigger = action.event.kind.as_str(),
                    "talk control reply posted"
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    checkpoint = %action.event.checkpoint_id,
                    reply = action.reply_index,
                    error = %e,
                    "talk control dispatch failed"
                );
                false
            }
        }
    }

    pub fn checkpoint(&self) -> Option<String> {
        self.inner.state.borrow().checkpoint_id.clone()
    }

    pub fn current_turn(&self) -> u64 {
        self.inner.state.borrow().turn
    }

    pub fn queue_len(&self) -> usize {
        self.inner.state.borrow().queue.len()
    }

    pub fn queued_events(&self) -> Vec<TalkControlEvent> {
        self.inner.state.borrow().queue.iter().cloned().collect()
    }

    pub fn has_pending_action(&self) -> bool {
        self.inner.state.borrow().pending.is_some()
    }

    /// The host should call `pump` soon.
    pub fn is_flush_pending(&self) -> bool {
        self.inner.state.borrow().flush_requested
    }

    pub fn is_generation_active(&self) -> bool {
        self.inner.state.borrow().generation_active
    }

    pub fn is_suppressed(&self) -> bool {
        self.inner.state.borrow().suppressed
    }

    pub fn reply_state(&self, checkpoint_id: &str, reply_index: usize) -> Option<ReplyRuntimeState> {
        self.inner
            .state
            .borrow()
            .replies
            .get(&ReplyKey::new(checkpoint_id, reply_index))
            .copied()
    }
}
