//! `council` — run a debate council or a swarm assembly from the command line.
//!
//! # Usage
//!
//! ```bash
//! council debate --agents roster.yaml --topic "Adopt the new schema?" --option yes --option no
//! council assemble --agents roster.yaml --assembly review.yaml --input "Summarize the diff"
//! council validate assemblies/
//! council plan --kind research "Compare vector stores"
//! ```
//!
//! Sessions print their JSON record on stdout (or a readable transcript with
//! `--transcript`) and exit non-zero when they end in `error`. Logs go to
//! stderr; `RUST_LOG` controls the filter.

mod roster;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use coordination::{
    Assembly, AssemblyEngine, AssemblyLoader, CapabilityRegistry, DebateEngine, EngineConfig,
    JsonFileSink, OutcomeSink, SessionRecord, TaskDecomposer, TaskKind, Topic,
};
use roster::Roster;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "council", author, version, about, long_about = None)]
struct Cli {
    /// Log line format on stderr
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Seat a council and debate one topic
    Debate(DebateArgs),
    /// Run one task through an assembly
    Assemble(AssembleArgs),
    /// Check an assembly file, or every assembly in a directory
    Validate {
        path: PathBuf,
    },
    /// Break a task into phased subtasks and print the plan as JSON
    Plan {
        /// Phase template: development, research, analysis, testing,
        /// documentation or architecture
        #[arg(long, default_value_t = TaskKind::Development)]
        kind: TaskKind,
        task: String,
    },
}

#[derive(Args, Debug)]
struct SessionArgs {
    /// Roster of agents to register (YAML)
    #[arg(long)]
    agents: PathBuf,

    /// Engine configuration (TOML); COUNCIL_* variables override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seed text for a replayable run
    #[arg(long)]
    seed: Option<String>,

    /// Also write `<session_id>.json` into this directory
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct DebateArgs {
    #[command(flatten)]
    session: SessionArgs,

    /// Question put to the council
    #[arg(long)]
    topic: String,

    /// Longer framing shown to agents
    #[arg(long, default_value = "")]
    description: String,

    /// Ballot option; repeat for more. Defaults to Support/Neutral/Oppose.
    #[arg(long = "option")]
    options: Vec<String>,

    /// Print a readable transcript instead of JSON
    #[arg(long, default_value_t = false)]
    transcript: bool,
}

#[derive(Args, Debug)]
struct AssembleArgs {
    #[command(flatten)]
    session: SessionArgs,

    /// Assembly definition (YAML)
    #[arg(long)]
    assembly: PathBuf,

    /// Task input handed to every role
    #[arg(long)]
    input: String,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Debate(args) => run_debate(args).await,
        Command::Assemble(args) => run_assembly(args).await,
        Command::Validate { path } => Ok(if validate(&path)? {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }),
        Command::Plan { kind, task } => {
            let plan = TaskDecomposer::new().decompose(&task, kind)?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Cancel the session on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling session");
            token.cancel();
        }
    });
    cancel
}

async fn prepare(args: &SessionArgs) -> Result<(CapabilityRegistry, EngineConfig)> {
    let config = EngineConfig::load(args.config.as_deref()).context("failed to load engine config")?;
    let roster = Roster::load(&args.agents)?;
    let registry = CapabilityRegistry::new();
    roster.register(&registry).await?;
    info!(agents = roster.agents.len(), "Roster registered");
    Ok((registry, config))
}

async fn run_debate(args: DebateArgs) -> Result<ExitCode> {
    let (registry, config) = prepare(&args.session).await?;
    let engine = DebateEngine::new(registry.shared(), &config)?;

    let topic = Topic::new("cli", &args.topic)
        .with_description(&args.description)
        .with_options(args.options.iter().cloned());
    let cancel = cancel_on_interrupt();
    let seed = args.session.seed.as_deref().map(str::as_bytes);
    let record = engine.run(topic, seed, &cancel).await;

    if args.transcript {
        println!("{}", record.render_transcript());
    } else {
        println!("{}", record.to_json()?);
    }
    finish(&record, args.session.out_dir.as_deref()).await
}

async fn run_assembly(args: AssembleArgs) -> Result<ExitCode> {
    let assembly = Assembly::from_path(&args.assembly)
        .with_context(|| format!("failed to load assembly {}", args.assembly.display()))?;
    let (registry, config) = prepare(&args.session).await?;
    let engine = AssemblyEngine::new(registry.shared(), &config)?;

    let cancel = cancel_on_interrupt();
    let seed = args.session.seed.as_deref().map(str::as_bytes);
    let record = engine.run(&assembly, &args.input, seed, &cancel).await;

    println!("{}", record.to_json()?);
    finish(&record, args.session.out_dir.as_deref()).await
}

async fn finish(record: &SessionRecord, out_dir: Option<&Path>) -> Result<ExitCode> {
    if let Some(dir) = out_dir {
        JsonFileSink::new(dir)
            .deliver(record)
            .await
            .with_context(|| format!("failed to write record into {}", dir.display()))?;
    }
    Ok(exit_code(record))
}

fn exit_code(record: &SessionRecord) -> ExitCode {
    if record.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Print one line per assembly; `false` when any of them is invalid.
fn validate(path: &Path) -> Result<bool> {
    if path.is_dir() {
        let mut loader = AssemblyLoader::new();
        let report = loader
            .load_dir(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        for name in &report.loaded {
            println!("ok      {}", name);
        }
        for (file, err) in &report.failed {
            println!("invalid {}: {}", file.display(), err);
        }
        return Ok(report.failed.is_empty());
    }

    match Assembly::from_path(path) {
        Ok(assembly) => {
            println!(
                "ok      {} v{} ({} roles, {})",
                assembly.name,
                assembly.version,
                assembly.roles.len(),
                assembly.strategy
            );
            Ok(true)
        }
        Err(err) => {
            println!("invalid {}: {}", path.display(), err);
            Ok(false)
        }
    }
}
