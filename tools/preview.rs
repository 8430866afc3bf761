/// Preview: interactive shell for walking a story with a console chat host.
///
/// Usage: preview <story.ron> [--config <engine.ron>] [--settings <file.json>]
///                            [--chat <id>] [--seed <n>]
///
/// Commands:
///   say <name> <text>     a character speaks
///   user <text>           the user speaks
///   go <index|id>         activate a checkpoint
///   status <index> <s>    force a checkpoint status (pending/current/complete/failed)
///   arbiter before|after  signal an arbiter phase
///   generate              ask the host to generate (may be intercepted)
///   state                 show runtime state
///   timed                 show timed transitions on the active checkpoint
///   reset                 restart the story
///   help                  list commands
///   quit                  exit
use async_trait::async_trait;
use std::cell::RefCell;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::rc::Rc;

use story_orchestrator::config::EngineConfig;
use story_orchestrator::core::engine::{ChatContext, StoryEngine};
use story_orchestrator::core::host::{
    GenerationRequest, HostError, HostEvent, LocalEventBus, QuietRequest, TalkControlHost,
};
use story_orchestrator::core::persistence::{HydrationSource, JsonFileSettingsStore};
use story_orchestrator::core::talk_control::{ArbiterPhase, InterceptDecision, TalkControl};
use story_orchestrator::logging;
use story_orchestrator::schema::chat::{Character, ChatMessage};
use story_orchestrator::schema::runtime::CheckpointStatus;
use story_orchestrator::schema::story::Story;

/// Prints messages to stdout and republishes them on the bus.
struct ConsoleHost {
    roster: Vec<Character>,
    bus: LocalEventBus,
    transcript: RefCell<Vec<ChatMessage>>,
}

#[async_trait(?Send)]
impl TalkControlHost for ConsoleHost {
    fn is_group_chat(&self) -> bool {
        true
    }

    fn find_character(&self, name: &str) -> Option<Character> {
        self.roster.iter().find(|c| c.name == name).cloned()
    }

    fn roster(&self) -> Vec<Character> {
        self.roster.clone()
    }

    fn substitute_macros(&self, text: &str, speaker: &Character) -> String {
        text.replace("{{char}}", &speaker.name)
            .replace("{{user}}", "You")
    }

    fn abort_generation(&self) {
        println!("  (host generation aborted)");
        self.bus.emit(&HostEvent::GenerationStopped);
    }

    async fn generate_quiet(&self, request: QuietRequest) -> Result<String, HostError> {
        Ok(format!("*{} improvises: {}*", request.force_speaker, request.prompt))
    }

    async fn append_message(&self, message: ChatMessage) -> Result<(), HostError> {
        println!("[{}] {}", message.name, message.content);
        self.transcript.borrow_mut().push(message.clone());
        self.bus.emit(&HostEvent::MessageReceived(message));
        Ok(())
    }
}

struct Session {
    engine: StoryEngine,
    talk: TalkControl,
    bus: LocalEventBus,
    turn: u64,
}

impl Session {
    fn sync_checkpoint(&self) {
        let active = self.engine.active_checkpoint().map(|c| c.id.clone());
        self.talk.set_checkpoint(active.as_deref());
    }

    async fn flush(&self) {
        if self.talk.is_flush_pending() {
            let report = self.talk.pump().await;
            if report.failed > 0 || report.interrupted {
                println!(
                    "  (flush: {} posted, {} failed, interrupted: {})",
                    report.dispatched, report.failed, report.interrupted
                );
            }
        }
    }

    fn advance_turn(&mut self) {
        self.turn += 1;
        self.talk.update_turn(self.turn);
        let runtime = self.engine.runtime().clone();
        self.engine
            .set_checkpoint_turn_count(runtime.checkpoint_turn_count + 1);
        self.engine.set_turns_since_eval(runtime.turns_since_eval + 1);
    }

    fn follow_triggers(&mut self, text: &str) {
        let matches = self.engine.evaluate_active(text);
        for m in &matches {
            println!("  trigger '{}' matched /{}/ -> {}", m.transition_id, m.pattern, m.to);
        }
        let target = matches
            .first()
            .and_then(|m| self.engine.story().and_then(|s| s.index_of(&m.to)));
        if let Some(index) = target {
            self.engine.activate_index(index);
            self.engine.set_turns_since_eval(0);
            self.print_active();
            self.sync_checkpoint();
        }
    }

    fn print_active(&self) {
        match self.engine.active_checkpoint() {
            Some(c) => println!("  now at '{}' ({}): {}", c.id, c.name, c.objective),
            None => println!("  no active checkpoint"),
        }
    }

    fn print_state(&self) {
        let runtime = self.engine.runtime();
        println!("  turn: {}", self.turn);
        println!("  checkpoint index: {}", runtime.checkpoint_index);
        println!("  active key: {:?}", runtime.active_checkpoint_key);
        println!("  turns since eval: {}", runtime.turns_since_eval);
        println!("  checkpoint turns: {}", runtime.checkpoint_turn_count);
        if let Some(story) = self.engine.story() {
            for (i, c) in story.checkpoints.iter().enumerate() {
                let status = runtime
                    .status_of(&c.id)
                    .map(|s| s.as_str())
                    .unwrap_or("?");
                println!("    [{}] {:<20} {}", i, c.id, status);
            }
        }
        println!("  queued talk events: {}", self.talk.queue_len());
    }
}

fn print_usage() {
    println!("Usage: preview <story.ron> [--config <engine.ron>] [--settings <file.json>] [--chat <id>] [--seed <n>]");
}

fn print_help() {
    println!("Commands:");
    println!("  say <name> <text>     a character speaks");
    println!("  user <text>           the user speaks");
    println!("  go <index|id>         activate a checkpoint");
    println!("  status <index> <s>    force a checkpoint status");
    println!("  arbiter before|after  signal an arbiter phase");
    println!("  generate              ask the host to generate");
    println!("  state                 show runtime state");
    println!("  timed                 show timed transitions");
    println!("  reset                 restart the story");
    println!("  quit                  exit");
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage();
        return;
    }

    let story_path = args[1].clone();
    let mut config_path = None;
    let mut settings_path = None;
    let mut chat_id = "preview".to_string();
    let mut seed = None;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                i += 1;
                config_path = Some(args[i].clone());
            }
            "--settings" if i + 1 < args.len() => {
                i += 1;
                settings_path = Some(args[i].clone());
            }
            "--chat" if i + 1 < args.len() => {
                i += 1;
                chat_id = args[i].clone();
            }
            "--seed" if i + 1 < args.len() => {
                i += 1;
                seed = args[i].parse().ok();
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let mut config = match config_path {
        Some(ref path) => match EngineConfig::load_from_ron(Path::new(path)) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("ERROR: Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => EngineConfig::default(),
    };
    if seed.is_some() {
        config.talk_control.seed = seed;
    }
    logging::init(&config.logging);

    let story = match Story::load_from_ron(Path::new(&story_path)) {
        Ok(story) => Rc::new(story),
        Err(e) => {
            eprintln!("ERROR: Failed to load story: {}", e);
            std::process::exit(1);
        }
    };

    let mut roster: Vec<Character> = story.roles.values().map(|n| Character::named(n)).collect();
    roster.sort_by(|a, b| a.name.cmp(&b.name));

    let bus = LocalEventBus::new();
    let host = Rc::new(ConsoleHost {
        roster,
        bus: bus.clone(),
        transcript: RefCell::new(Vec::new()),
    });

    let mut builder = StoryEngine::builder()
        .with_shared_story(Rc::clone(&story))
        .with_chat(ChatContext::group(&chat_id));
    if let Some(ref path) = settings_path {
        builder = builder.with_store(Box::new(JsonFileSettingsStore::new(Path::new(path))));
    }
    let mut engine = builder.build();
    let source = engine.hydrate();

    let talk = match TalkControl::builder()
        .with_host(host.clone())
        .with_settings(config.talk_control.clone())
        .with_story(Rc::clone(&story))
        .build()
    {
        Ok(talk) => talk,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
    };
    let _subscriptions = talk.attach(&bus);

    let mut session = Session {
        engine,
        talk,
        bus,
        turn: 0,
    };

    println!("Loaded \"{}\" ({} checkpoints)", story.title, story.checkpoints.len());
    println!(
        "Progress: {}",
        match source {
            HydrationSource::Stored => "restored from settings",
            HydrationSource::Default => "fresh start",
        }
    );
    session.print_active();
    session.sync_checkpoint();
    session.flush().await;
    println!("Type 'help' for commands.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("preview> ");
        stdout.flush().ok();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).is_err() || line.is_empty() {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        match cmd.to_lowercase().as_str() {
            "quit" | "exit" | "q" => {
                println!("Goodbye.");
                break;
            }
            "help" | "h" | "?" => print_help(),
            "say" => {
                let Some((name, text)) = rest.split_once(' ') else {
                    println!("Usage: say <name> <text>");
                    continue;
                };
                session.advance_turn();
                let message = ChatMessage {
                    name: name.to_string(),
                    content: text.to_string(),
                    ..Default::default()
                };
                session.bus.emit(&HostEvent::MessageReceived(message));
                session.follow_triggers(text);
                session.flush().await;
            }
            "user" => {
                if rest.is_empty() {
                    println!("Usage: user <text>");
                    continue;
                }
                session.advance_turn();
                session.follow_triggers(rest);
                session.flush().await;
            }
            "go" => {
                let Some(story) = session.engine.story().cloned() else {
                    continue;
                };
                let index = rest
                    .parse::<usize>()
                    .ok()
                    .or_else(|| story.index_of(rest));
                match index {
                    Some(index) => {
                        session.engine.activate_index(index);
                        session.print_active();
                        session.sync_checkpoint();
                        session.flush().await;
                    }
                    None => println!("Unknown checkpoint: {}", rest),
                }
            }
            "status" => {
                let mut parts = rest.split_whitespace();
                let index = parts.next().and_then(|p| p.parse::<usize>().ok());
                let status = parts.next().and_then(CheckpointStatus::parse);
                match (index, status) {
                    (Some(index), Some(status)) => {
                        session.engine.update_checkpoint_status(index, status);
                        session.print_state();
                    }
                    _ => println!("Usage: status <index> pending|current|complete|failed"),
                }
            }
            "arbiter" => {
                let phase = match rest {
                    "before" => ArbiterPhase::Before,
                    "after" => ArbiterPhase::After,
                    _ => {
                        println!("Usage: arbiter before|after");
                        continue;
                    }
                };
                session.talk.notify_arbiter_phase(phase);
                session.flush().await;
            }
            "generate" => {
                session
                    .bus
                    .emit(&HostEvent::GenerationStarted(GenerationRequest::normal()));
                match session.talk.intercept_generation(&GenerationRequest::normal()) {
                    InterceptDecision::Abort => session.flush().await,
                    InterceptDecision::Proceed => {
                        println!("  (host generates a normal reply)");
                        session.bus.emit(&HostEvent::GenerationEnded);
                    }
                }
            }
            "state" => session.print_state(),
            "timed" => {
                let count = session.engine.runtime().checkpoint_turn_count;
                let timed = session.engine.timed_transitions();
                if timed.is_empty() {
                    println!("  no timed transitions here");
                }
                for t in timed {
                    println!(
                        "  '{}' -> {} after {} turns{}",
                        t.transition_id,
                        t.to,
                        t.within_turns,
                        if t.is_due(count) { " (due)" } else { "" }
                    );
                }
            }
            "reset" => {
                session.engine.reset_runtime();
                session.turn = 0;
                session.talk.update_turn(0);
                session.print_active();
                session.sync_checkpoint();
                session.flush().await;
            }
            other => {
                println!("Unknown command: {}. Type 'help' for commands.", other);
            }
        }
    }

    println!("{} messages posted by talk control.", host.transcript.borrow().len());
}
