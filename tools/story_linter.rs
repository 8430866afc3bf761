/// Story Linter: validates story files and reports authoring problems.
///
/// Usage: story_linter <story.ron | dir> [--json]
///
/// `--json` reads `.json` files in the normalized story format instead of RON.
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process;

use story_orchestrator::core::persistence::story_signature;
use story_orchestrator::core::triggers::compile_pattern;
use story_orchestrator::schema::story::{Story, StoryError, TransitionTrigger};
use story_orchestrator::schema::talk_control::ReplyContent;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        println!("Usage: story_linter <story.ron | dir> [--json]");
        process::exit(0);
    }

    let json = args.iter().skip(2).any(|a| a == "--json");
    let extension = if json { "json" } else { "ron" };
    let root = Path::new(&args[1]);

    let files = if root.is_file() {
        vec![root.to_path_buf()]
    } else if root.is_dir() {
        let mut found = Vec::new();
        collect_files(root, extension, &mut found);
        found.sort();
        found
    } else {
        eprintln!("ERROR: Path '{}' does not exist", root.display());
        process::exit(1);
    };

    let mut total_errors = 0;
    let mut total_warnings = 0;

    for path in &files {
        println!("\n=== {} ===\n", path.display());
        let story = match load(path, json) {
            Ok(story) => story,
            Err(e) => {
                println!("ERROR: {}", e);
                total_errors += 1;
                continue;
            }
        };

        println!(
            "\"{}\": {} checkpoints, {} transitions",
            story.title,
            story.checkpoints.len(),
            story.transitions.len()
        );
        println!("Signature: {}", story_signature(&story));

        let (errors, warnings) = lint_story(&story);
        if errors.is_empty() && warnings.is_empty() {
            println!("All checks passed!");
        }
        for warning in &warnings {
            println!("WARNING: {}", warning);
        }
        for error in &errors {
            println!("ERROR: {}", error);
        }
        total_errors += errors.len();
        total_warnings += warnings.len();
    }

    println!(
        "\nSummary: {} files, {} errors, {} warnings",
        files.len(),
        total_errors,
        total_warnings
    );

    if total_errors > 0 {
        process::exit(1);
    }
}

fn load(path: &Path, json: bool) -> Result<Story, StoryError> {
    if json {
        let contents = std::fs::read_to_string(path)?;
        Story::from_json(&contents)
    } else {
        Story::load_from_ron(path)
    }
}

fn collect_files(dir: &Path, extension: &str, found: &mut Vec<PathBuf>) {
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                collect_files(&path, extension, found);
            } else if path.extension().and_then(|s| s.to_str()) == Some(extension) {
                found.push(path);
            }
        }
    }
}

fn reachable_from_start(story: &Story) -> HashSet<&str> {
    let mut seen = HashSet::new();
    let Some(start) = story.checkpoints.get(story.start_index()) else {
        return seen;
    };
    let mut frontier = VecDeque::from([start.id.as_str()]);
    while let Some(id) = frontier.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        for transition in story.outgoing(id) {
            frontier.push_back(transition.to.as_str());
        }
    }
    seen
}

fn lint_story(story: &Story) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if story.checkpoints.is_empty() {
        errors.push("story has no checkpoints".to_string());
        return (errors, warnings);
    }

    let reachable = reachable_from_start(story);
    for checkpoint in &story.checkpoints {
        if !reachable.contains(checkpoint.id.as_str()) {
            warnings.push(format!(
                "checkpoint '{}' is unreachable from the start",
                checkpoint.id
            ));
        }
        if checkpoint.objective.trim().is_empty() {
            warnings.push(format!("checkpoint '{}' has no objective", checkpoint.id));
        }
    }

    for transition in &story.transitions {
        match &transition.trigger {
            TransitionTrigger::Regex { patterns, .. } => {
                if patterns.is_empty() {
                    warnings.push(format!(
                        "transition '{}' has a regex trigger with no patterns",
                        transition.id
                    ));
                }
                for pattern in patterns {
                    if let Err(e) = compile_pattern(pattern) {
                        errors.push(format!(
                            "transition '{}': pattern /{}/{} does not compile: {}",
                            transition.id, pattern.pattern, pattern.flags, e
                        ));
                    }
                }
            }
            TransitionTrigger::Timed { within_turns: 0 } => {
                warnings.push(format!(
                    "transition '{}' is timed with within_turns 0 and fires immediately",
                    transition.id
                ));
            }
            TransitionTrigger::Timed { .. } => {}
        }
        if transition.from == transition.to {
            warnings.push(format!("transition '{}' loops onto itself", transition.id));
        }
    }

    if let Some(talk_control) = &story.talk_control {
        let mut ids: Vec<_> = talk_control.checkpoints.keys().collect();
        ids.sort();
        for checkpoint_id in ids {
            for (index, reply) in talk_control.checkpoints[checkpoint_id].iter().enumerate() {
                let at = format!("talk control '{}'[{}]", checkpoint_id, index);
                if reply.probability > 100 {
                    errors.push(format!(
                        "{}: probability {} is above 100",
                        at, reply.probability
                    ));
                }
                if reply.enabled && reply.probability == 0 {
                    warnings.push(format!("{}: enabled but probability is 0", at));
                }
                if reply.max_chars == Some(0) {
                    errors.push(format!("{}: max_chars must be positive", at));
                }
                let empty = match &reply.content {
                    ReplyContent::Static { text } => text.trim().is_empty(),
                    ReplyContent::Llm { instruction } => instruction.trim().is_empty(),
                };
                if empty {
                    errors.push(format!("{}: reply content is empty", at));
                }
                if reply.speaker_id.trim().is_empty() {
                    errors.push(format!("{}: no speaker", at));
                }
            }
        }
    }

    (errors, warnings)
}
