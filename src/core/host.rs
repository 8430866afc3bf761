//! Ports to the host chat runtime.
//!
//! The engine never talks to a concrete chat application. Generation,
//! roster lookup, message posting and lifecycle events all come through
//! the traits here, so the scheduler runs the same against a browser host
//! adapter or a fake in tests.
use async_trait::async_trait;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;

use crate::schema::chat::{Character, ChatMessage};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("failed to save chat: {0}")]
    Save(String),
    #[error("host unavailable: {0}")]
    Unavailable(String),
}

/// A background generation whose output is not shown as a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuietRequest {
    pub prompt: String,
    /// Character the model must answer as.
    pub force_speaker: String,
}

/// Why the host is about to generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationKind {
    Normal,
    Continue,
    Regenerate,
    Swipe,
    Impersonate,
    /// Internal background generation; never intercepted.
    Quiet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub kind: GenerationKind,
}

impl GenerationRequest {
    pub fn normal() -> Self {
        Self {
            kind: GenerationKind::Normal,
        }
    }

    pub fn quiet() -> Self {
        Self {
            kind: GenerationKind::Quiet,
        }
    }

    pub fn is_quiet(&self) -> bool {
        self.kind == GenerationKind::Quiet
    }
}

/// Services the talk control scheduler needs from the host.
///
/// Single-threaded: futures are not `Send`.
#[cfg_attr(test, mockall::automock)]
#[async_trait(?Send)]
pub trait TalkControlHost {
    /// Whether the open chat has several participants.
    fn is_group_chat(&self) -> bool;
    /// Exact roster lookup by name.
    fn find_character(&self, name: &str) -> Option<Character>;
    fn roster(&self) -> Vec<Character>;
    /// Expand template macros in reply text.
    fn substitute_macros(&self, text: &str, speaker: &Character) -> String;
    /// Cancel the generation the host was about to run.
    fn abort_generation(&self);
    async fn generate_quiet(&self, request: QuietRequest) -> Result<String, HostError>;
    /// Append to the transcript and save the chat.
    async fn append_message(&self, message: ChatMessage) -> Result<(), HostError>;
}

/// Lifecycle notifications published by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostEventKind {
    MessageReceived,
    MessageRendered,
    GenerationStarted,
    GenerationStopped,
    GenerationEnded,
    ChatChanged,
    WorldInfoUpdated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    MessageReceived(ChatMessage),
    MessageRendered { index: usize },
    GenerationStarted(GenerationRequest),
    GenerationStopped,
    GenerationEnded,
    ChatChanged {
        chat_id: Option<String>,
        is_group: bool,
    },
    WorldInfoUpdated,
}

impl HostEvent {
    pub fn kind(&self) -> HostEventKind {
        match self {
            Self::MessageReceived(_) => HostEventKind::MessageReceived,
            Self::MessageRendered { .. } => HostEventKind::MessageRendered,
            Self::GenerationStarted(_) => HostEventKind::GenerationStarted,
            Self::GenerationStopped => HostEventKind::GenerationStopped,
            Self::GenerationEnded => HostEventKind::GenerationEnded,
            Self::ChatChanged { .. } => HostEventKind::ChatChanged,
            Self::WorldInfoUpdated => HostEventKind::WorldInfoUpdated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

pub type EventHandler = Box<dyn FnMut(&HostEvent)>;

/// Named subscribe/unsubscribe over host lifecycle events.
pub trait EventBus {
    fn subscribe(&self, kind: HostEventKind, handler: EventHandler) -> SubscriptionId;
    /// Returns false if the subscription was already gone.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

type SharedHandler = Rc<RefCell<EventHandler>>;

#[derive(Default)]
struct BusInner {
    next_id: u64,
    handlers: HashMap<HostEventKind, Vec<(SubscriptionId, SharedHandler)>>,
}

/// In-process event bus. Cloning shares the same subscriber list.
///
/// Handlers may emit further events; a handler that is already running is
/// skipped for the nested emit.
#[derive(Clone, Default)]
pub struct LocalEventBus {
    inner: Rc<RefCell<BusInner>>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every subscriber of its kind, in subscription order.
    pub fn emit(&self, event: &HostEvent) {
        let targets: Vec<SharedHandler> = self
            .inner
            .borrow()
            .handlers
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, h)| Rc::clone(h)).collect())
            .unwrap_or_default();
        for handler in targets {
            match handler.try_borrow_mut() {
                Ok(mut handler) => handler(event),
                Err(_) => tracing::debug!(kind = ?event.kind(), "skipping re-entrant handler"),
            }
        }
    }

    pub fn subscriber_count(&self, kind: HostEventKind) -> usize {
        self.inner
            .borrow()
            .handlers
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl EventBus for LocalEventBus {
    fn subscribe(&self, kind: HostEventKind, handler: EventHandler) -> SubscriptionId {
        let mut inner = self.inner.borrow_mut();
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Rc::new(RefCell::new(handler))));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.borrow_mut();
        for list in inner.handlers.values_mut() {
            if let Some(position) = list.iter().position(|(sid, _)| *sid == id) {
                list.remove(position);
                return true;
            }
        }
        false
    }
}
