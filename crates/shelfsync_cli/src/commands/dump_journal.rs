//! Dump journal command implementation.

use super::CommandResult;
use serde::Serialize;
use shelfsync_engine::{JobStore, JobStoreConfig, StoreRecord};
use std::path::Path;

/// Journal record representation for output.
#[derive(Debug, Serialize)]
pub struct JournalEntry {
    /// Offset in the journal file.
    pub offset: u64,
    /// Decoded record.
    #[serde(flatten)]
    pub record: StoreRecord,
}

/// Runs the dump-journal command.
pub fn run(path: &Path, limit: Option<usize>, format: &str) -> CommandResult<()> {
    let config = JobStoreConfig::default();
    if !path.join(&config.file_name).exists() {
        return Err("Journal file not found".into());
    }

    let entries = read_entries(path, &config, limit)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&entries)?),
        _ => print_text_output(&entries),
    }
    Ok(())
}

fn read_entries(
    path: &Path,
    config: &JobStoreConfig,
    limit: Option<usize>,
) -> CommandResult<Vec<JournalEntry>> {
    let (store, loaded) = JobStore::open_read_only(path, config)?;
    if loaded.truncated_bytes > 0 {
        eprintln!(
            "warning: {} trailing byte(s) of a torn write follow the last record",
            loaded.truncated_bytes
        );
    }

    Ok(store
        .records()?
        .into_iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(|(offset, record)| JournalEntry { offset, record })
        .collect())
}

fn print_text_output(entries: &[JournalEntry]) {
    println!("Journal Records");
    println!("===============");
    println!();

    for entry in entries {
        let description = match &entry.record {
            StoreRecord::PutJob { job } => format!(
                "PUT_JOB     #{} {} {} [{}] attempts={}",
                job.id,
                job.kind,
                job.entity_id,
                job.status.as_str(),
                job.attempts
            ),
            StoreRecord::RemoveJob { job_id } => format!("REMOVE_JOB  #{}", job_id),
            StoreRecord::Bookmark { last_sync } => {
                format!("BOOKMARK    last_sync={}", last_sync.to_rfc3339())
            }
            StoreRecord::IdFloor { next_id } => format!("ID_FLOOR    next_id={}", next_id),
        };
        println!("{:>10}: {}", entry.offset, description);
    }

    println!();
    println!("Total: {} records", entries.len());
}
