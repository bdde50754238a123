//! palisade CLI - operator tooling for the job resilience engine.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use palisade::{
    CheckpointStore, DeadLetterQueue, EngineConfig, FileBackend, RecoveryService,
    ResolutionStatus, TracingAlertSink,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "palisade")]
#[command(version)]
#[command(about = "Job resilience engine: checkpoints, retries, dead letters, recovery")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect stored job checkpoints
    Checkpoints {
        #[command(subcommand)]
        command: CheckpointCommands,
    },

    /// Inspect and resolve dead letter entries
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },

    /// Scan stored checkpoints: resume, restart or dead-letter each job
    Recover,

    /// Move a live job's checkpoint to the dead letter queue
    ForceDeadLetter {
        job_id: String,

        /// Reason recorded on the entry
        #[arg(long, default_value = "forced via CLI")]
        reason: String,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

#[derive(Subcommand)]
enum CheckpointCommands {
    /// List stored checkpoints
    List {
        /// Only recoverable jobs
        #[arg(long)]
        recoverable: bool,
    },

    /// Show one checkpoint as JSON
    Show { job_id: String },

    /// Structurally validate a stored checkpoint
    Validate { job_id: String },

    /// Delete a checkpoint
    Delete { job_id: String },
}

#[derive(Subcommand)]
enum DlqCommands {
    /// List entries, newest first
    List {
        /// Filter: pending_review | retried | dismissed
        #[arg(long)]
        status: Option<String>,

        /// Maximum entries to show
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Counts by resolution status and failure kind
    Stats,

    /// Show one entry as JSON
    Show { entry_id: String },

    /// Release an entry for manual retry (restores its checkpoint)
    Retry { entry_id: String },

    /// Dismiss an entry permanently
    Dismiss {
        entry_id: String,

        /// Reason recorded on the entry
        #[arg(long, default_value = "dismissed via CLI")]
        notes: String,
    },

    /// Remove an entry outright
    Purge { entry_id: String },
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn load_config(path: &PathBuf) -> Result<EngineConfig> {
    if path.exists() {
        EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))
    } else {
        info!(path = %path.display(), "No config file found, using defaults");
        Ok(EngineConfig::default())
    }
}

fn open_checkpoints(config: &EngineConfig) -> Result<CheckpointStore> {
    let backend = FileBackend::new(&config.storage.checkpoint_dir())
        .context("Failed to open checkpoint directory")?;
    Ok(CheckpointStore::new(Arc::new(backend)))
}

fn open_dead_letters(config: &EngineConfig) -> Result<DeadLetterQueue> {
    let backend = FileBackend::new(&config.storage.dead_letter_dir())
        .context("Failed to open dead letter directory")?;
    Ok(DeadLetterQueue::new(
        Arc::new(backend),
        Arc::new(TracingAlertSink),
    ))
}

fn parse_status(s: &str) -> Result<ResolutionStatus> {
    match s {
        "pending_review" => Ok(ResolutionStatus::PendingReview),
        "retried" => Ok(ResolutionStatus::Retried),
        "dismissed" => Ok(ResolutionStatus::Dismissed),
        other => bail!("unknown status '{other}' (expected pending_review, retried or dismissed)"),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Checkpoints { command } => run_checkpoints(&config, command),
        Commands::Dlq { command } => run_dlq(&config, command),
        Commands::Recover => run_recover(&config),
        Commands::ForceDeadLetter { job_id, reason } => run_force_dead_letter(&config, &job_id, &reason),
        Commands::Validate => {
            config.validate().context("Configuration is invalid")?;
            println!("Configuration is valid");
            Ok(())
        }
        Commands::Example => {
            print_example_config();
            Ok(())
        }
    }
}

fn run_checkpoints(config: &EngineConfig, command: CheckpointCommands) -> Result<()> {
    let store = open_checkpoints(config)?;
    match command {
        CheckpointCommands::List { recoverable } => {
            let checkpoints = store.list(recoverable)?;
            if checkpoints.is_empty() {
                println!("No checkpoints");
                return Ok(());
            }
            println!(
                "{:<28} {:<20} {:<14} {:>8} {:>12}",
                "JOB", "TYPE", "STAGE", "RETRIES", "RECOVERABLE"
            );
            for cp in checkpoints {
                println!(
                    "{:<28} {:<20} {:<14} {:>8} {:>12}",
                    cp.job_id,
                    cp.job_type,
                    cp.current_stage.as_deref().unwrap_or("-"),
                    cp.total_retries,
                    cp.is_recoverable,
                );
            }
        }
        CheckpointCommands::Show { job_id } => {
            let cp = store
                .get(&job_id)?
                .with_context(|| format!("No checkpoint for job '{job_id}'"))?;
            println!("{}", serde_json::to_string_pretty(&cp)?);
        }
        CheckpointCommands::Validate { job_id } => {
            let report = store.validate(&job_id)?;
            for error in &report.errors {
                println!("error: {error}");
            }
            for warning in &report.warnings {
                println!("warning: {warning}");
            }
            if report.is_valid() {
                println!("Checkpoint '{job_id}' is structurally valid");
            } else {
                bail!("checkpoint '{job_id}' failed validation");
            }
        }
        CheckpointCommands::Delete { job_id } => {
            store.delete(&job_id)?;
            println!("Deleted checkpoint '{job_id}'");
        }
    }
    Ok(())
}

fn run_dlq(config: &EngineConfig, command: DlqCommands) -> Result<()> {
    let queue = open_dead_letters(config)?;
    match command {
        DlqCommands::List { status, limit } => {
            let status = status.as_deref().map(parse_status).transpose()?;
            let entries = queue.list(status, limit)?;
            if entries.is_empty() {
                println!("No dead letter entries");
                return Ok(());
            }
            println!(
                "{:<40} {:<24} {:<14} {:<20} {:<16}",
                "ENTRY", "JOB", "STAGE", "KIND", "STATUS"
            );
            for entry in entries {
                println!(
                    "{:<40} {:<24} {:<14} {:<20} {:<16}",
                    entry.id,
                    entry.job_id,
                    entry.failure_stage,
                    entry.failure_kind,
                    entry.resolution_status,
                );
            }
        }
        DlqCommands::Stats => {
            let stats = queue.stats()?;
            println!("Total entries: {}", stats.total);
            println!("By status:");
            for (status, count) in &stats.by_status {
                println!("  {status}: {count}");
            }
            println!("By failure kind:");
            for (kind, count) in &stats.by_failure_kind {
                println!("  {kind}: {count}");
            }
        }
        DlqCommands::Show { entry_id } => {
            let entry = queue
                .get(&entry_id)?
                .with_context(|| format!("No dead letter entry '{entry_id}'"))?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        DlqCommands::Retry { entry_id } => {
            let handoff = queue.retry(&entry_id)?;
            // Put the checkpoint back so a driver can resume the job.
            let checkpoints = open_checkpoints(config)?;
            checkpoints.persist(&handoff.checkpoint)?;
            println!(
                "Released job '{}' for retry; checkpoint restored at stage {}",
                handoff.job_id,
                handoff
                    .checkpoint
                    .current_stage
                    .as_deref()
                    .unwrap_or("<start>"),
            );
        }
        DlqCommands::Dismiss { entry_id, notes } => {
            let entry = queue.dismiss(&entry_id, &notes)?;
            println!("Dismissed entry '{}' (job '{}')", entry.id, entry.job_id);
        }
        DlqCommands::Purge { entry_id } => {
            queue.purge(&entry_id)?;
            println!("Purged entry '{entry_id}'");
        }
    }
    Ok(())
}

fn run_recover(config: &EngineConfig) -> Result<()> {
    let checkpoints = open_checkpoints(config)?;
    let dead_letters = open_dead_letters(config)?;
    let service = RecoveryService::new(&checkpoints, &dead_letters);

    let (results, summary) = service.scan()?;
    for result in &results {
        match &result.from_stage {
            Some(stage) => println!("{:<28} {} (from {stage})", result.job_id, result.action),
            None => println!("{:<28} {} ({})", result.job_id, result.action, result.message),
        }
    }
    println!(
        "Scanned {}: {} resumable, {} restarted, {} dead-lettered ({} unreadable)",
        summary.scanned,
        summary.resumed,
        summary.restarted,
        summary.dead_lettered,
        summary.unreadable,
    );
    Ok(())
}

fn run_force_dead_letter(config: &EngineConfig, job_id: &str, reason: &str) -> Result<()> {
    let checkpoints = open_checkpoints(config)?;
    let dead_letters = open_dead_letters(config)?;
    let service = RecoveryService::new(&checkpoints, &dead_letters);

    let entry = service.force_dead_letter(job_id, reason)?;
    println!(
        "Dead-lettered job '{}' as entry '{}' (stage '{}')",
        entry.job_id, entry.id, entry.failure_stage,
    );
    Ok(())
}

fn print_example_config() {
    let example = r#"# palisade configuration file

[storage]
# Root directory for checkpoints, dead letters and pending transactions
data_dir = "data"

# Per-kind retry overrides; unset fields keep the built-in policy.
# Kinds: network_timeout, api_rate_limit, resource_unavailable,
#        invalid_input, auth_failure, out_of_memory, unknown_error
[retry.network_timeout]
max_retries = 5
base_delay_secs = 2.0
max_delay_secs = 60.0

[retry.api_rate_limit]
max_retries = 8
base_delay_secs = 5.0
max_delay_secs = 300.0

[circuit_breaker]
# Consecutive failures before a dependency's circuit opens
failure_threshold = 5
# Cooldown before an open circuit allows a half-open probe
timeout_secs = 60

[idempotency]
# How long completed-item records shield against re-execution
ttl_secs = 86400

[batch]
max_concurrent_jobs = 8
progress_bar = true
"#;
    println!("{example}");
}
