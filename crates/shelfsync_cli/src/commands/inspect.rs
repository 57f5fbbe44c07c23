//! Inspect command implementation.

use super::{format_size, open_queue_read_only, CommandResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use shelfsync_engine::{JobQueueStatus, MutationQueue};
use std::path::Path;

/// Queue inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Journal directory.
    pub path: String,
    /// Journal size in bytes.
    pub journal_size: u64,
    /// Job counts by status.
    pub jobs: JobQueueStatus,
    /// Last successful sync.
    pub last_sync: Option<DateTime<Utc>>,
    /// Earliest scheduled retry.
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> CommandResult<()> {
    let queue = open_queue_read_only(path)?;
    let result = inspect(path, &queue)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn inspect(path: &Path, queue: &MutationQueue) -> CommandResult<InspectResult> {
    Ok(InspectResult {
        path: path.display().to_string(),
        journal_size: queue.journal_size()?,
        jobs: queue.stats(),
        last_sync: queue.last_sync(),
        next_retry_at: queue.next_retry_at(),
    })
}

fn print_text_output(result: &InspectResult) {
    println!("shelfsync Queue Inspection");
    println!("==========================");
    println!();
    println!("Path:         {}", result.path);
    println!("Journal size: {}", format_size(result.journal_size));
    println!();
    println!("Jobs:");
    println!("  Pending:    {}", result.jobs.pending);
    println!("  Processing: {}", result.jobs.processing);
    println!("  Failed:     {}", result.jobs.failed);
    println!("  Conflicted: {}", result.jobs.conflicted);
    println!("  Completed:  {}", result.jobs.completed);
    println!();
    match result.last_sync {
        Some(t) => println!("Last sync:  {}", t.to_rfc3339()),
        None => println!("Last sync:  never"),
    }
    if let Some(t) = result.next_retry_at {
        println!("Next retry: {}", t.to_rfc3339());
    }
}
