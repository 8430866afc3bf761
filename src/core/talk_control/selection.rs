//! Choosing which reply, if any, answers a queued event.
use rand::seq::SliceRandom;
use rand::Rng;
use rustc_hash::FxHashMap;

use super::queue::{EventQueue, TalkControlEvent};
use crate::schema::story::{normalize_name, Story};
use crate::schema::talk_control::{TalkControlReply, TalkTrigger};

/// Identifies a reply: its checkpoint and its position in that
/// checkpoint's reply list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplyKey {
    pub checkpoint_id: String,
    pub reply_index: usize,
}

impl ReplyKey {
    pub fn new(checkpoint_id: &str, reply_index: usize) -> Self {
        Self {
            checkpoint_id: checkpoint_id.to_string(),
            reply_index,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyRuntimeState {
    pub last_action_turn: Option<u64>,
    pub actions_this_turn: u32,
    /// Turn `actions_this_turn` counts for.
    pub turn: u64,
}

/// Per-reply usage, created lazily on first dispatch.
#[derive(Debug, Default)]
pub struct ReplyRuntimeTable {
    entries: FxHashMap<ReplyKey, ReplyRuntimeState>,
}

impl ReplyRuntimeTable {
    pub fn get(&self, key: &ReplyKey) -> Option<&ReplyRuntimeState> {
        self.entries.get(key)
    }

    pub fn used_this_turn(&self, key: &ReplyKey, turn: u64) -> bool {
        self.entries
            .get(key)
            .map(|entry| entry.last_action_turn == Some(turn))
            .unwrap_or(false)
    }

    pub fn record_dispatch(&mut self, key: ReplyKey, turn: u64) {
        let entry = self.entries.entry(key).or_default();
        if entry.turn != turn {
            entry.turn = turn;
            entry.actions_this_turn = 0;
        }
        entry.actions_this_turn += 1;
        entry.last_action_turn = Some(turn);
    }

    /// Zero the per-turn counters once the turn moves on.
    pub fn advance_turn(&mut self, turn: u64) {
        for entry in self.entries.values_mut() {
            if entry.turn != turn {
                entry.turn = turn;
                entry.actions_this_turn = 0;
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A reply chosen for an event, ready to dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedAction {
    pub event: TalkControlEvent,
    pub reply_index: usize,
    pub reply: TalkControlReply,
}

impl SelectedAction {
    pub fn key(&self) -> ReplyKey {
        ReplyKey::new(&self.event.checkpoint_id, self.reply_index)
    }
}

/// Percent roll: a draw in `[0, 100)` must land below `probability`.
pub fn roll_probability<R: Rng>(rng: &mut R, probability: u8) -> bool {
    if probability == 0 {
        return false;
    }
    rng.gen_range(0.0..100.0) < f64::from(probability.min(100))
}

/// Whether `speaker` satisfies the reply's afterSpeak gate, by name or
/// through the story role the gate names.
pub fn speaker_matches(story: &Story, reply: &TalkControlReply, speaker: &str) -> bool {
    let gate = reply.gate_id();
    let speaker = normalize_name(speaker);
    if normalize_name(gate) == speaker {
        return true;
    }
    story
        .role_alias(gate)
        .map(|alias| normalize_name(alias) == speaker)
        .unwrap_or(false)
}

/// Pick a reply for `event`: candidates are shuffled, then the first one
/// that is enabled, passes the speaker gate, wins its roll and hasn't acted
/// this turn is chosen.
pub fn select_action_for_event<R: Rng>(
    story: &Story,
    event: &TalkControlEvent,
    table: &ReplyRuntimeTable,
    turn: u64,
    rng: &mut R,
) -> Option<SelectedAction> {
    let config = story.talk_control.as_ref().filter(|c| c.enabled)?;
    let mut candidates = config.replies_for(&event.checkpoint_id, event.kind);
    candidates.shuffle(rng);

    for (reply_index, reply) in candidates {
        if !reply.enabled {
            continue;
        }
        if event.kind == TalkTrigger::AfterSpeak {
            let Some(speaker) = event.metadata.speaker.as_deref() else {
                continue;
            };
            if !speaker_matches(story, reply, speaker) {
                continue;
            }
        }
        if !roll_probability(rng, reply.probability()) {
            continue;
        }
        if table.used_this_turn(&ReplyKey::new(&event.checkpoint_id, reply_index), turn) {
            continue;
        }
        return Some(SelectedAction {
            event: event.clone(),
            reply_index,
            reply: reply.clone(),
        });
    }
    None
}

/// Drain events until one yields an action. Events with no surviving
/// reply are dropped.
pub fn next_ready_action<R: Rng>(
    queue: &mut EventQueue,
    story: &Story,
    table: &ReplyRuntimeTable,
    turn: u64,
    rng: &mut R,
) -> Option<SelectedAction> {
    while let Some(event) = queue.pop() {
        if let Some(action) = select_action_for_event(story, &event, table, turn, rng) {
            return Some(action);
        }
        tracing::debug!(
            event_id = event.id,
            kind = event.kind.as_str(),
            checkpoint = %event.checkpoint_id,
            "no eligible reply; dropping event"
        );
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::talk_control::queue::EventMetadata;
    use crate::schema::story::Checkpoint;
    use crate::schema::talk_control::{ReplyContent, TalkControlConfig};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn reply(speaker: &str, trigger: TalkTrigger, probability: u8) -> TalkControlReply {
        TalkControlReply {
            member_id: None,
            speaker_id: speaker.to_string(),
            enabled: true,
            trigger,
            probability,
            content: ReplyContent::Static {
                text: format!("{speaker} speaks"),
            },
            max_chars: None,
        }
    }

    fn story(replies: Vec<TalkControlReply>) -> Story {
        Story {
            title: "Selection".to_string(),
            description: None,
            lorebook: None,
            roles: HashMap::from([("bard".to_string(), "Finn the Bard".to_string())]),
            checkpoints: vec![Checkpoint {
                id: "tavern".to_string(),
                name: "Tavern".to_string(),
                objective: String::new(),
                on_activate: None,
            }],
            transitions: Vec::new(),
            start_checkpoint: None,
            talk_control: Some(TalkControlConfig {
                checkpoints: HashMap::from([("tavern".to_string(), replies)]),
                ..Default::default()
            }),
        }
    }

    fn event(kind: TalkTrigger, speaker: Option<&str>) -> TalkControlEvent {
        TalkControlEvent {
            id: 1,
            kind,
            checkpoint_id: "tavern".to_string(),
            metadata: EventMetadata {
                speaker: speaker.map(str::to_string),
            },
        }
    }

    #[test]
    fn probability_boundaries() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            assert!(roll_probability(&mut rng, 100));
            assert!(!roll_probability(&mut rng, 0));
        }
    }

    #[test]
    fn zero_probability_reply_never_selected() {
        let s = story(vec![reply("bard", TalkTrigger::OnEnter, 0)]);
        let mut rng = StdRng::seed_from_u64(1);
        let table = ReplyRuntimeTable::default();
        for _ in 0..200 {
            assert!(select_action_for_event(&s, &event(TalkTrigger::OnEnter, None), &table, 0, &mut rng)
                .is_none());
        }
    }

    #[test]
    fn shuffle_is_fair_across_equal_candidates() {
        let s = story(vec![
            reply("a", TalkTrigger::OnEnter, 100),
            reply("b", TalkTrigger::OnEnter, 100),
            reply("c", TalkTrigger::OnEnter, 100),
        ]);
        let mut rng = StdRng::seed_from_u64(2024);
        let table = ReplyRuntimeTable::default();
        let trials = 3000;
        let mut counts = [0usize; 3];
        for _ in 0..trials {
            let action =
                select_action_for_event(&s, &event(TalkTrigger::OnEnter, None), &table, 0, &mut rng)
                    .unwrap();
            counts[action.reply_index] += 1;
        }
        for count in counts {
            let share = count as f64 / trials as f64;
            assert!((0.28..0.39).contains(&share), "share {share} out of range");
        }
    }

    #[test]
    fn after_speak_gate_rejects_other_speakers() {
        let s = story(vec![reply("bard", TalkTrigger::AfterSpeak, 100)]);
        let mut rng = StdRng::seed_from_u64(3);
        let table = ReplyRuntimeTable::default();
        let ev = event(TalkTrigger::AfterSpeak, Some("guard"));
        assert!(select_action_for_event(&s, &ev, &table, 0, &mut rng).is_none());
        let ev = event(TalkTrigger::AfterSpeak, None);
        assert!(select_action_for_event(&s, &ev, &table, 0, &mut rng).is_none());
    }

    #[test]
    fn after_speak_gate_accepts_name_and_role_alias() {
        let s = story(vec![reply("bard", TalkTrigger::AfterSpeak, 100)]);
        let mut rng = StdRng::seed_from_u64(3);
        let table = ReplyRuntimeTable::default();
        for speaker in ["bard", "  BARD ", "finn the  bard"] {
            let ev = event(TalkTrigger::AfterSpeak, Some(speaker));
            assert!(
                select_action_for_event(&s, &ev, &table, 0, &mut rng).is_some(),
                "{speaker} should pass"
            );
        }
    }

    #[test]
    fn member_id_overrides_speaker_gate() {
        let mut r = reply("bard", TalkTrigger::AfterSpeak, 100);
        r.member_id = Some("guard".to_string());
        let s = story(vec![r]);
        let mut rng = StdRng::seed_from_u64(3);
        let table = ReplyRuntimeTable::default();
        let ev = event(TalkTrigger::AfterSpeak, Some("Guard"));
        assert!(select_action_for_event(&s, &ev, &table, 0, &mut rng).is_some());
    }

    #[test]
    fn disabled_and_used_replies_skipped() {
        let mut disabled = reply("a", TalkTrigger::OnEnter, 100);
        disabled.enabled = false;
        let s = story(vec![disabled, reply("b", TalkTrigger::OnEnter, 100)]);
        let mut rng = StdRng::seed_from_u64(4);
        let mut table = ReplyRuntimeTable::default();
        let ev = event(TalkTrigger::OnEnter, None);

        let action = select_action_for_event(&s, &ev, &table, 5, &mut rng).unwrap();
        assert_eq!(action.reply_index, 1);

        table.record_dispatch(action.key(), 5);
        assert!(select_action_for_event(&s, &ev, &table, 5, &mut rng).is_none());
        assert!(select_action_for_event(&s, &ev, &table, 6, &mut rng).is_some());
    }

    #[test]
    fn runtime_counters_reset_with_turn() {
        let mut table = ReplyRuntimeTable::default();
        let key = ReplyKey::new("tavern", 0);
        table.record_dispatch(key.clone(), 2);
        table.record_dispatch(key.clone(), 2);
        assert_eq!(table.get(&key).unwrap().actions_this_turn, 2);
        table.advance_turn(3);
        let entry = table.get(&key).unwrap();
        assert_eq!(entry.actions_this_turn, 0);
        assert_eq!(entry.last_action_turn, Some(2));
    }

    #[test]
    fn drain_drops_events_without_survivors() {
        let s = story(vec![reply("bard", TalkTrigger::OnEnter, 100)]);
        let mut queue = EventQueue::with_capacity(8);
        queue.push(TalkTrigger::OnExit, "tavern", EventMetadata::default());
        queue.push(TalkTrigger::AfterSpeak, "tavern", EventMetadata::spoken_by("guard"));
        queue.push(TalkTrigger::OnEnter, "tavern", EventMetadata::default());
        queue.push(TalkTrigger::OnEnter, "tavern", EventMetadata::default());
        let table = ReplyRuntimeTable::default();
        let mut rng = StdRng::seed_from_u64(5);

        let action = next_ready_action(&mut queue, &s, &table, 0, &mut rng).unwrap();
        assert_eq!(action.event.kind, TalkTrigger::OnEnter);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn disabled_config_selects_nothing() {
        let mut s = story(vec![reply("bard", TalkTrigger::OnEnter, 100)]);
        if let Some(config) = s.talk_control.as_mut() {
            config.enabled = false;
        }
        let mut rng = StdRng::seed_from_u64(6);
        let table = ReplyRuntimeTable::default();
        assert!(
            select_action_for_event(&s, &event(TalkTrigger::OnEnter, None), &table, 0, &mut rng)
                .is_none()
        );
    }
}
