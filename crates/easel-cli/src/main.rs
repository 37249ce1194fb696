use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use easel_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use easel_contracts::engines::EngineKind;
use easel_contracts::outcome::{GeneratedImage, GenerationFailure};
use easel_engine::{
    default_engine_registry, offline_engine_registry, Orchestrator, MIN_PROMPT_CHARS,
};
use serde_json::Value;

mod keepalive;

#[derive(Debug, Parser)]
#[command(name = "easel", version, about = "Chat-driven image generation relay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Chat(ChatArgs),
    Run(RunArgs),
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value_t = 0)]
    user: i64,
    #[arg(long)]
    offline: bool,
    #[arg(long)]
    no_keepalive: bool,
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    engine: Option<String>,
    #[arg(long, default_value_t = 0)]
    user: i64,
    #[arg(long)]
    offline: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("easel error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Run(args) => run_once(args),
    }
}

fn build_orchestrator(out: &Path, events: Option<PathBuf>, offline: bool) -> Result<Orchestrator> {
    let events_path = events.unwrap_or_else(|| out.join("events.jsonl"));
    let registry = if offline {
        offline_engine_registry()
    } else {
        default_engine_registry()
    };
    Orchestrator::new(out, events_path, registry)
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let orchestrator = build_orchestrator(&args.out, args.events.clone(), args.offline)?;
    let user = args.user;

    if !args.no_keepalive {
        let port = keepalive::resolve_port(args.port);
        match keepalive::spawn(port) {
            Ok(bound) => println!("Keep-alive listening on port {bound}"),
            Err(err) => eprintln!("easel: keep-alive listener unavailable: {err:#}"),
        }
    }

    let stdin = io::stdin();
    let mut line = String::new();
    println!("Easel chat started. Type /help for commands.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        match intent.action.as_str() {
            "noop" => continue,
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
            }
            "start" => {
                orchestrator.start(user);
                println!("Welcome! Type a prompt to generate an image, or /engines to pick an engine.");
            }
            "list_engines" => {
                let current = current_engine(&orchestrator, user);
                for kind in EngineKind::all() {
                    let marker = if *kind == current { "*" } else { " " };
                    println!("{marker} {:<12} {}", kind.as_str(), kind.label());
                }
            }
            "set_engine" => {
                let raw = intent
                    .command_args
                    .get("engine")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                match EngineKind::parse(raw) {
                    Some(kind) => {
                        orchestrator.select_engine(user, kind);
                        println!("Engine set to {}", kind.label());
                    }
                    None => println!("Unknown engine '{raw}'. Options: horde, huggingface"),
                }
            }
            "regenerate" => {
                render(orchestrator.regenerate(user));
            }
            "reset" => {
                orchestrator.reset(user);
                println!("Session cleared. Type /start to begin again.");
            }
            "generate" => {
                let prompt = intent.prompt.unwrap_or_default();
                if prompt.trim().chars().count() >= MIN_PROMPT_CHARS {
                    println!("Generating with {}…", current_engine(&orchestrator, user).label());
                }
                render(orchestrator.generate(user, &prompt));
            }
            "unknown" => {
                println!("Unknown command. Type /help for the list.");
            }
            _ => {}
        }
    }

    Ok(())
}

fn current_engine(orchestrator: &Orchestrator, user: i64) -> EngineKind {
    orchestrator
        .session(user)
        .map(|session| session.engine)
        .unwrap_or_default()
}

fn render(result: Result<GeneratedImage, GenerationFailure>) {
    match result {
        Ok(image) => println!("Image ready ({}): {}", image.engine, image.image.describe()),
        Err(failure) => println!("{}", failure.user_message()),
    }
}

fn run_once(args: RunArgs) -> Result<i32> {
    let orchestrator = build_orchestrator(&args.out, args.events.clone(), args.offline)?;
    if let Some(raw) = args.engine.as_deref() {
        let Some(kind) = EngineKind::parse(raw) else {
            eprintln!("unknown engine '{raw}' (options: horde, huggingface)");
            return Ok(2);
        };
        orchestrator.select_engine(args.user, kind);
    }
    match orchestrator.generate(args.user, &args.prompt) {
        Ok(image) => {
            println!("Image ready ({}): {}", image.engine, image.image.describe());
            Ok(0)
        }
        Err(failure) => {
            eprintln!("{}", failure.user_message());
            Ok(1)
        }
    }
}
