/// State machine integration tests: activation, status derivation,
/// persistence and trigger evaluation against a loaded story.
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use story_orchestrator::core::engine::{ChatContext, StoryEngine, WriteOptions};
use story_orchestrator::core::persistence::{
    load_story_state, persist_story_state, story_signature, HydrationSource, JsonFileSettingsStore,
    MemorySettingsStore, SettingsStore,
};
use story_orchestrator::core::state::{
    activate_index, default_runtime, sanitize_runtime, update_checkpoint_status,
};
use story_orchestrator::logging;
use story_orchestrator::schema::runtime::{CheckpointStatus, RuntimeStoryState};
use story_orchestrator::schema::story::{Checkpoint, Story, TransitionTrigger};

use CheckpointStatus::*;

fn fixture() -> Story {
    logging::init_test();
    Story::load_from_ron(Path::new("tests/fixtures/tavern_story.ron")).unwrap()
}

fn abc() -> Story {
    Story {
        title: "ABC".to_string(),
        description: None,
        lorebook: None,
        roles: HashMap::new(),
        checkpoints: ["A", "B", "C"]
            .iter()
            .map(|id| Checkpoint {
                id: id.to_string(),
                name: format!("Checkpoint {id}"),
                objective: format!("Finish {id}"),
                on_activate: None,
            })
            .collect(),
        transitions: Vec::new(),
        start_checkpoint: Some("A".to_string()),
        talk_control: None,
    }
}

fn statuses(state: &RuntimeStoryState, story: &Story) -> Vec<CheckpointStatus> {
    story
        .checkpoints
        .iter()
        .map(|c| state.checkpoint_status_map[&c.id])
        .collect()
}

fn assert_single_current(state: &RuntimeStoryState, story: &Story) {
    let current: Vec<_> = story
        .checkpoints
        .iter()
        .enumerate()
        .filter(|(_, c)| state.status_of(&c.id) == Some(Current))
        .map(|(i, _)| i)
        .collect();
    assert!(current.len() <= 1, "more than one current: {current:?}");
    if let Some(&i) = current.first() {
        assert_eq!(i, state.checkpoint_index);
    }
}

#[test]
fn fixture_loads_and_normalizes_patterns() {
    let story = fixture();
    assert_eq!(story.checkpoints.len(), 4);
    assert_eq!(story.start_index(), 0);
    match &story.transitions[0].trigger {
        TransitionTrigger::Regex { patterns, .. } => {
            assert_eq!(patterns[0].pattern, "tavern door");
            assert_eq!(patterns[0].flags, "i");
            assert_eq!(patterns[1].pattern, "step inside");
            assert_eq!(patterns[1].flags, "");
        }
        other => panic!("unexpected trigger {other:?}"),
    }
    let tavern = story.checkpoint("tavern").unwrap();
    let effects = tavern.on_activate.as_ref().unwrap();
    assert_eq!(effects.world_info.activate, vec!["Drowned Lantern interior"]);
    assert_eq!(effects.automations, vec!["/bg tavern_night"]);
    assert_eq!(story.role_alias("Bard"), Some("Finn the Bard"));
}

#[test]
fn fresh_story_then_advance() {
    let story = abc();
    let state = default_runtime(Some(&story));
    assert_eq!(state.checkpoint_index, 0);
    assert_eq!(statuses(&state, &story), vec![Current, Pending, Pending]);

    let state = activate_index(&state, &story, 1);
    assert_eq!(statuses(&state, &story), vec![Complete, Current, Pending]);
}

#[test]
fn failure_is_sticky_through_advancement() {
    let story = abc();
    let state = activate_index(&default_runtime(Some(&story)), &story, 1);
    let state = update_checkpoint_status(&state, &story, 0, Failed);
    let state = activate_index(&state, &story, 2);
    assert_eq!(statuses(&state, &story), vec![Failed, Complete, Current]);
}

#[test]
fn activation_invariants_hold_for_every_index() {
    let story = fixture();
    let mut state = default_runtime(Some(&story));
    for target in [3, 0, 2, 9, 1, 1] {
        state = activate_index(&state, &story, target);
        let clamped = target.min(story.checkpoints.len() - 1);
        assert_eq!(state.checkpoint_index, clamped);
        assert_eq!(
            state.active_checkpoint_key.as_deref(),
            Some(story.checkpoints[clamped].id.as_str())
        );
        for (i, checkpoint) in story.checkpoints.iter().enumerate() {
            let status = state.status_of(&checkpoint.id).unwrap();
            if i < clamped {
                assert_eq!(status, Complete);
            } else if i == clamped {
                assert_eq!(status, Current);
            }
        }
        assert_single_current(&state, &story);
    }
}

#[test]
fn status_override_is_idempotent() {
    let story = fixture();
    let state = activate_index(&default_runtime(Some(&story)), &story, 1);
    let once = update_checkpoint_status(&state, &story, 3, Complete);
    let twice = update_checkpoint_status(&once, &story, 3, Complete);
    assert_eq!(once.checkpoint_status_map, twice.checkpoint_status_map);
}

#[test]
fn sanitize_is_idempotent() {
    let story = fixture();
    let messy = RuntimeStoryState {
        checkpoint_index: 42,
        active_checkpoint_key: Some("cellar".to_string()),
        turns_since_eval: 2,
        checkpoint_turn_count: 7,
        checkpoint_status_map: HashMap::from([
            ("gate".to_string(), Failed),
            ("ghost".to_string(), Complete),
        ]),
    };
    let once = sanitize_runtime(messy, Some(&story));
    let twice = sanitize_runtime(once.clone(), Some(&story));
    assert_eq!(once, twice);
    assert_eq!(once.checkpoint_index, 2);
    assert_eq!(statuses(&once, &story), vec![Failed, Complete, Current, Pending]);
}

#[test]
fn persistence_round_trip() {
    let story = fixture();
    let mut store = MemorySettingsStore::new();
    let mut state = activate_index(&default_runtime(Some(&story)), &story, 2);
    state = update_checkpoint_status(&state, &story, 0, Failed);
    state.turns_since_eval = 3;
    state.checkpoint_turn_count = 4;

    persist_story_state(&mut store, "c42", &story, &state, Some("lantern.ron")).unwrap();
    let loaded = load_story_state(&store, "c42", &story, Some("lantern.ron"));
    assert_eq!(loaded.source, HydrationSource::Stored);
    assert_eq!(loaded.state, sanitize_runtime(state, Some(&story)));
}

#[test]
fn structural_edit_discards_saved_progress() {
    let story = abc();
    let mut store = MemorySettingsStore::new();
    let state = activate_index(&default_runtime(Some(&story)), &story, 1);
    persist_story_state(&mut store, "c42", &story, &state, None).unwrap();

    let mut edited = abc();
    edited.checkpoints[1].name = "Checkpoint B (revised)".to_string();
    assert_ne!(story_signature(&story), story_signature(&edited));

    let loaded = load_story_state(&store, "c42", &edited, None);
    assert_eq!(loaded.source, HydrationSource::Default);
    assert_eq!(loaded.state, default_runtime(Some(&edited)));
}

#[test]
fn engine_persists_across_sessions_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let settings = dir.path().join("settings.json");
    let story = Rc::new(fixture());
    let chat = ChatContext::group("c7").with_story_key("drowned_lantern");

    {
        let mut engine = StoryEngine::builder()
            .with_shared_story(Rc::clone(&story))
            .with_chat(chat.clone())
            .with_store(Box::new(JsonFileSettingsStore::new(&settings)))
            .build();
        assert_eq!(engine.hydrate(), HydrationSource::Default);
        let matches = engine.evaluate_active("We push open the Tavern Door.");
        assert_eq!(matches.len(), 1);
        let target = story.index_of(&matches[0].to).unwrap();
        engine.activate_index(target);
        engine.set_checkpoint_turn_count(2);
    }

    let mut engine = StoryEngine::builder()
        .with_shared_story(Rc::clone(&story))
        .with_chat(chat)
        .with_store(Box::new(JsonFileSettingsStore::new(&settings)))
        .build();
    assert_eq!(engine.hydrate(), HydrationSource::Stored);
    assert_eq!(engine.active_checkpoint().unwrap().id, "tavern");
    assert_eq!(engine.runtime().checkpoint_turn_count, 2);

    let timed = engine.timed_transitions();
    assert_eq!(timed.len(), 1);
    assert!(!timed[0].is_due(engine.runtime().checkpoint_turn_count));
    let matches = engine.evaluate_active("Is that a trapdoor behind the bar?");
    assert_eq!(matches[0].transition_id, "find_trapdoor");
}

#[test]
fn writes_before_hydration_are_not_persisted() {
    let story = fixture();
    let mut engine = StoryEngine::builder()
        .with_story(story)
        .with_chat(ChatContext::group("early"))
        .build();
    engine.activate_index(1);
    assert!(engine.store().read("early").unwrap().is_none());

    engine.hydrate();
    engine.write_runtime(engine.runtime().clone(), WriteOptions { persist: false });
    assert!(engine.store().read("early").unwrap().is_none());

    engine.activate_index(2);
    assert!(engine.store().read("early").unwrap().is_some());
}

#[test]
fn written_index_moves_the_active_key() {
    let mut engine = StoryEngine::builder()
        .with_story(fixture())
        .with_chat(ChatContext::group("c9"))
        .build();
    engine.hydrate();
    let next = RuntimeStoryState {
        checkpoint_index: 2,
        ..engine.runtime().clone()
    };
    assert_eq!(next.active_checkpoint_key.as_deref(), Some("gate"));

    engine.write_runtime(next, WriteOptions { persist: true });
    assert_eq!(engine.runtime().checkpoint_index, 2);
    assert_eq!(engine.active_checkpoint().unwrap().id, "cellar");

    let stored = load_story_state(engine.store(), "c9", engine.story().unwrap(), None);
    assert_eq!(stored.state.active_checkpoint_key.as_deref(), Some("cellar"));
}
