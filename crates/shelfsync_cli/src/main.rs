//! shelfsync CLI
//!
//! Operator tools for a shelfsync job journal directory.
//!
//! # Commands
//!
//! - `inspect` - Queue counts, journal size and last sync
//! - `list` - List jobs, optionally by status
//! - `conflicts` - List outstanding conflicts
//! - `retry-failed` - Return failed jobs to the queue
//! - `cancel` - Cancel a pending or failed job
//! - `clear-old` - Purge old completed jobs
//! - `enqueue` - Enqueue a mutation by hand
//! - `dump-journal` - Dump journal records for debugging
//! - `compact` - Rewrite the journal with only live state

mod commands;

use clap::{Parser, Subcommand};
use shelfsync_protocol::JobId;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// shelfsync job journal tools.
#[derive(Parser)]
#[command(name = "shelfsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the journal directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(global = true, short, long, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display queue counts and journal metadata
    Inspect,

    /// List jobs in queue order
    List {
        /// Only jobs with this status
        /// (pending, processing, completed, failed, conflicted)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// List outstanding conflicts
    Conflicts,

    /// Return permanently failed jobs to the queue
    RetryFailed,

    /// Cancel a pending or failed job
    Cancel {
        /// Job ID
        job_id: u64,
    },

    /// Purge completed jobs older than the retention window
    ClearOld {
        /// Retention window in days
        #[arg(short, long, default_value = "30")]
        retention_days: u32,
    },

    /// Enqueue a mutation
    Enqueue {
        /// Entity ID
        #[arg(short, long)]
        entity: String,

        /// Job kind, e.g. update_bookmark
        #[arg(short, long)]
        kind: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Dump journal records for debugging
    DumpJournal {
        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Rewrite the journal with only live state
    Compact,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Version = cli.command {
        println!("shelfsync CLI v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let path = cli.path.ok_or("Journal directory required (--path)")?;
    let format = cli.format.as_str();

    match cli.command {
        Commands::Inspect => commands::inspect::run(&path, format)?,
        Commands::List { status } => commands::jobs::list(&path, status.as_deref(), format)?,
        Commands::Conflicts => commands::jobs::conflicts(&path, format)?,
        Commands::RetryFailed => commands::jobs::retry_failed(&path)?,
        Commands::Cancel { job_id } => commands::jobs::cancel(&path, JobId(job_id))?,
        Commands::ClearOld { retention_days } => {
            commands::maintenance::clear_old(&path, retention_days)?
        }
        Commands::Enqueue {
            entity,
            kind,
            payload,
        } => commands::jobs::enqueue(&path, &entity, &kind, &payload, format)?,
        Commands::DumpJournal { limit } => commands::dump_journal::run(&path, limit, format)?,
        Commands::Compact => commands::maintenance::compact(&path)?,
        Commands::Version => {}
    }

    Ok(())
}
