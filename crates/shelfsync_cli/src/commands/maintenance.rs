//! Journal maintenance commands.

use super::{format_size, open_queue, CommandResult};
use std::path::Path;
use std::time::Duration;
use tracing::info;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Runs the clear-old command.
pub fn clear_old(path: &Path, retention_days: u32) -> CommandResult<()> {
    let queue = open_queue(path, false)?;
    let retention = Duration::from_secs(u64::from(retention_days) * SECONDS_PER_DAY);
    let purged = queue.clear_old_jobs(retention)?;
    println!(
        "Purged {} completed job(s) older than {} day(s)",
        purged, retention_days
    );
    Ok(())
}

/// Runs the compact command.
pub fn compact(path: &Path) -> CommandResult<()> {
    let queue = open_queue(path, false)?;
    let before = queue.journal_size()?;
    queue.compact()?;
    let after = queue.journal_size()?;
    info!(before, after, "journal compacted");

    println!(
        "Journal compacted: {} -> {}",
        format_size(before),
        format_size(after)
    );
    Ok(())
}
