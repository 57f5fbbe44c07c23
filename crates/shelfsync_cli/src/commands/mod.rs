//! CLI command implementations.

pub mod dump_journal;
pub mod inspect;
pub mod jobs;
pub mod maintenance;

use shelfsync_engine::{JobStoreConfig, MutationQueue, RetryConfig};
use std::path::Path;

/// Boxed error used by every command.
pub type CommandResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Opens the queue stored in `dir` for writing, taking the journal lock.
///
/// Refuses to create a journal where none exists unless `create` is set.
pub fn open_queue(dir: &Path, create: bool) -> CommandResult<MutationQueue> {
    let config = JobStoreConfig::default();
    if !create {
        require_journal(dir, &config)?;
    }
    Ok(MutationQueue::open_dir(dir, &config, RetryConfig::default())?)
}

/// Opens a snapshot of the queue stored in `dir` without locking or
/// modifying the journal. Safe to use while an app holds it open.
pub fn open_queue_read_only(dir: &Path) -> CommandResult<MutationQueue> {
    let config = JobStoreConfig::default();
    require_journal(dir, &config)?;
    Ok(MutationQueue::open_dir_read_only(
        dir,
        &config,
        RetryConfig::default(),
    )?)
}

fn require_journal(dir: &Path, config: &JobStoreConfig) -> CommandResult<()> {
    if !config.journal_path(dir).exists() {
        return Err(format!("No job journal found at {:?}", dir).into());
    }
    Ok(())
}

pub(crate) fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} bytes", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
