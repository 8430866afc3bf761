//! Checkpoint state machine: status derivation, activation and sanitising.
//!
//! All functions here are pure. They take the live story and a runtime
//! snapshot and return a new snapshot, so the same code normalises fresh
//! runs, stored snapshots and host-supplied updates.
use std::collections::HashMap;

use crate::schema::runtime::{CheckpointStatus, PersistedChatState, RuntimeStoryState};
use crate::schema::story::Story;

/// A fresh run: positioned at the explicit start checkpoint or the first one.
pub fn default_runtime(story: Option<&Story>) -> RuntimeStoryState {
    let Some(story) = story else {
        return RuntimeStoryState::default();
    };
    let index = story.start_index();
    RuntimeStoryState {
        checkpoint_index: index,
        active_checkpoint_key: story.checkpoints.get(index).map(|c| c.id.clone()),
        turns_since_eval: 0,
        checkpoint_turn_count: 0,
        checkpoint_status_map: derive_status_map(story, index, &HashMap::new()),
    }
}

/// Recompute every checkpoint's status for an active index.
///
/// Below the index is `complete`, the index itself is `current`, above it
/// keeps its prior status or `pending`. `failed` always sticks. A stale
/// `current` above the index is demoted so only one checkpoint is current.
pub fn derive_status_map(
    story: &Story,
    index: usize,
    prior: &HashMap<String, CheckpointStatus>,
) -> HashMap<String, CheckpointStatus> {
    story
        .checkpoints
        .iter()
        .enumerate()
        .map(|(position, checkpoint)| {
            let previous = prior.get(&checkpoint.id).copied();
            let status = match previous {
                Some(CheckpointStatus::Failed) => CheckpointStatus::Failed,
                _ if position < index => CheckpointStatus::Complete,
                _ if position == index => CheckpointStatus::Current,
                Some(CheckpointStatus::Current) | None => CheckpointStatus::Pending,
                Some(other) => other,
            };
            (checkpoint.id.clone(), status)
        })
        .collect()
}

fn clamp_index(story: &Story, index: usize) -> usize {
    index.min(story.checkpoints.len().saturating_sub(1))
}

/// Move the active checkpoint to `index`, clamped into range.
///
/// Changing checkpoints restarts the per-checkpoint turn count.
pub fn activate_index(state: &RuntimeStoryState, story: &Story, index: usize) -> RuntimeStoryState {
    let index = clamp_index(story, index);
    let moved = index != state.checkpoint_index;
    RuntimeStoryState {
        checkpoint_index: index,
        active_checkpoint_key: story.checkpoints.get(index).map(|c| c.id.clone()),
        turns_since_eval: state.turns_since_eval,
        checkpoint_turn_count: if moved { 0 } else { state.checkpoint_turn_count },
        checkpoint_status_map: derive_status_map(story, index, &state.checkpoint_status_map),
    }
}

/// Force one checkpoint's status, then re-derive the rest.
///
/// Only overrides compatible with the active index survive derivation:
/// `failed` anywhere, or any status above the index. Applying the same
/// override twice gives the same map.
pub fn update_checkpoint_status(
    state: &RuntimeStoryState,
    story: &Story,
    index: usize,
    status: CheckpointStatus,
) -> RuntimeStoryState {
    let Some(checkpoint) = story.checkpoints.get(index) else {
        tracing::warn!(index, "ignoring status update for out-of-range checkpoint");
        return state.clone();
    };
    let mut prior = state.checkpoint_status_map.clone();
    prior.insert(checkpoint.id.clone(), status);
    RuntimeStoryState {
        checkpoint_status_map: derive_status_map(story, state.checkpoint_index, &prior),
        ..state.clone()
    }
}

/// Make any candidate snapshot safe to use with `story`. Never fails.
///
/// An in-range index wins and the key is rewritten to match it. An
/// out-of-range index is recovered from the key when the key still names a
/// checkpoint, and clamped otherwise. Unknown checkpoint ids are dropped and
/// statuses re-derived.
pub fn sanitize_runtime(candidate: RuntimeStoryState, story: Option<&Story>) -> RuntimeStoryState {
    let Some(story) = story else {
        return RuntimeStoryState::default();
    };
    if story.checkpoints.is_empty() {
        return RuntimeStoryState {
            checkpoint_index: 0,
            active_checkpoint_key: None,
            checkpoint_status_map: HashMap::new(),
            ..candidate
        };
    }

    let index = if candidate.checkpoint_index < story.checkpoints.len() {
        candidate.checkpoint_index
    } else {
        candidate
            .active_checkpoint_key
            .as_deref()
            .and_then(|key| story.index_of(key))
            .unwrap_or_else(|| clamp_index(story, candidate.checkpoint_index))
    };

    let prior: HashMap<_, _> = candidate
        .checkpoint_status_map
        .into_iter()
        .filter(|(id, _)| story.index_of(id).is_some())
        .collect();

    RuntimeStoryState {
        checkpoint_index: index,
        active_checkpoint_key: Some(story.checkpoints[index].id.clone()),
        turns_since_eval: candidate.turns_since_eval,
        checkpoint_turn_count: candidate.checkpoint_turn_count,
        checkpoint_status_map: derive_status_map(story, index, &prior),
    }
}

fn floor_count(value: i64) -> u32 {
    value.clamp(0, u32::MAX as i64) as u32
}

/// Turn a stored snapshot into a runtime state, flooring counters and
/// discarding statuses that don't parse.
pub fn migrate_persisted(persisted: &PersistedChatState, story: &Story) -> RuntimeStoryState {
    let checkpoint_status_map = persisted
        .checkpoint_statuses
        .iter()
        .filter_map(|(id, raw)| CheckpointStatus::parse(raw).map(|status| (id.clone(), status)))
        .collect();
    let candidate = RuntimeStoryState {
        checkpoint_index: usize::try_from(persisted.checkpoint_index.max(0))
            .unwrap_or(usize::MAX),
        active_checkpoint_key: persisted.active_checkpoint_key.clone(),
        turns_since_eval: floor_count(persisted.turns_since_eval),
        checkpoint_turn_count: floor_count(persisted.checkpoint_turn_count),
        checkpoint_status_map,
    };
    sanitize_runtime(candidate, Some(story))
}
