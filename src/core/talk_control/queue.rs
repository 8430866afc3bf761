//! FIFO of pending talk control events.
use std::collections::VecDeque;

use crate::schema::talk_control::TalkTrigger;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventMetadata {
    /// Name of the member who spoke, for afterSpeak.
    pub speaker: Option<String>,
}

impl EventMetadata {
    pub fn spoken_by(speaker: &str) -> Self {
        Self {
            speaker: Some(speaker.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TalkControlEvent {
    pub id: u64,
    pub kind: TalkTrigger,
    pub checkpoint_id: String,
    pub metadata: EventMetadata,
}

/// Bounded queue; ids increase monotonically for the queue's lifetime,
/// clears included.
#[derive(Debug)]
pub struct EventQueue {
    events: VecDeque<TalkControlEvent>,
    next_id: u64,
    capacity: usize,
}

impl EventQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            next_id: 1,
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, kind: TalkTrigger, checkpoint_id: &str, metadata: EventMetadata) -> u64 {
        if self.events.len() >= self.capacity {
            if let Some(dropped) = self.events.pop_front() {
                tracing::warn!(
                    event_id = dropped.id,
                    kind = dropped.kind.as_str(),
                    "talk control queue full; dropping oldest event"
                );
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        self.events.push_back(TalkControlEvent {
            id,
            kind,
            checkpoint_id: checkpoint_id.to_string(),
            metadata,
        });
        id
    }

    pub fn pop(&mut self) -> Option<TalkControlEvent> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &TalkControlEvent> {
        self.events.iter()
    }
}
