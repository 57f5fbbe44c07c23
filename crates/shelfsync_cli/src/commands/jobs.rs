//! Job listing and manipulation commands.

use super::{open_queue, open_queue_read_only, CommandResult};
use shelfsync_protocol::{Job, JobId, JobStatus, MutationRequest, SyncConflict};
use std::path::Path;

/// Runs the list command.
pub fn list(path: &Path, status: Option<&str>, format: &str) -> CommandResult<()> {
    let status = status.map(str::parse::<JobStatus>).transpose()?;
    let queue = open_queue_read_only(path)?;
    let jobs = filter_jobs(queue.jobs(), status);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&jobs)?),
        _ => {
            if jobs.is_empty() {
                println!("No jobs");
            }
            for job in &jobs {
                print_job(job);
            }
        }
    }
    Ok(())
}

fn filter_jobs(jobs: Vec<Job>, status: Option<JobStatus>) -> Vec<Job> {
    match status {
        Some(status) => jobs.into_iter().filter(|j| j.status == status).collect(),
        None => jobs,
    }
}

fn print_job(job: &Job) {
    println!(
        "#{:<6} {:<11} {:<28} {} (attempts: {}, created {})",
        job.id.to_string(),
        job.status.as_str(),
        job.kind.to_string(),
        job.entity_id,
        job.attempts,
        job.created_at.to_rfc3339()
    );
    if let Some(error) = &job.last_error {
        println!("        last error: {}", error);
    }
}

/// Runs the conflicts command.
pub fn conflicts(path: &Path, format: &str) -> CommandResult<()> {
    let queue = open_queue_read_only(path)?;
    let conflicts = queue.conflicts();

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&conflicts)?),
        _ => {
            if conflicts.is_empty() {
                println!("No conflicts");
            }
            for conflict in &conflicts {
                print_conflict(conflict);
            }
        }
    }
    Ok(())
}

fn print_conflict(conflict: &SyncConflict) {
    println!(
        "job #{} {} {}: {} on [{}]",
        conflict.job_id,
        conflict.entity_type,
        conflict.entity_id,
        conflict.conflict_type,
        conflict.fields.join(", ")
    );
    println!(
        "  client v{} at {}, server v{} at {}, suggested {}",
        conflict.client_version.version,
        conflict.client_version.updated_at.to_rfc3339(),
        conflict.server_version.version,
        conflict.server_version.updated_at.to_rfc3339(),
        conflict.suggested.as_str()
    );
}

/// Runs the retry-failed command.
pub fn retry_failed(path: &Path) -> CommandResult<()> {
    let queue = open_queue(path, false)?;
    let count = queue.retry_failed_jobs()?;
    println!("Requeued {} failed job(s)", count);
    Ok(())
}

/// Runs the cancel command.
pub fn cancel(path: &Path, job_id: JobId) -> CommandResult<()> {
    let queue = open_queue(path, false)?;
    let job = queue.cancel_job(job_id)?;
    println!("Cancelled job #{} ({} {})", job.id, job.kind, job.entity_id);
    Ok(())
}

/// Runs the enqueue command. Creates the journal if needed.
pub fn enqueue(
    path: &Path,
    entity: &str,
    kind: &str,
    payload: &str,
    format: &str,
) -> CommandResult<()> {
    let payload: serde_json::Value = serde_json::from_str(payload)?;
    let queue = open_queue(path, true)?;
    let job = queue.enqueue(MutationRequest::new(entity, kind, payload))?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&job)?),
        _ => println!("Enqueued job #{} ({} {})", job.id, job.kind, job.entity_id),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn enqueue_then_cancel() {
        let dir = tempfile::tempdir().unwrap();
        enqueue(dir.path(), "b1", "create_bookmark", r#"{"page": 3}"#, "text").unwrap();

        let queue = open_queue(dir.path(), false).unwrap();
        let job = queue.jobs().remove(0);
        assert_eq!(job.payload, json!({"page": 3}));
        drop(queue);

        cancel(dir.path(), job.id).unwrap();
        assert!(open_queue(dir.path(), false).unwrap().jobs().is_empty());
    }

    #[test]
    fn enqueue_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        assert!(enqueue(dir.path(), "b1", "create_bookmark", "not json", "text").is_err());
        assert!(enqueue(dir.path(), "b1", "archive_bookmark", "{}", "text").is_err());
    }

    #[test]
    fn status_filter() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_queue(dir.path(), true).unwrap();
        let first = queue
            .enqueue(MutationRequest::new("b1", "create_bookmark", json!({})))
            .unwrap();
        queue
            .enqueue(MutationRequest::new("b2", "create_bookmark", json!({})))
            .unwrap();
        queue.mark_processing(first.id).unwrap();

        let pending = filter_jobs(queue.jobs(), Some(JobStatus::Pending));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, JobStatus::Pending);
        assert_eq!(filter_jobs(queue.jobs(), None).len(), 2);
    }

    #[test]
    fn unknown_status_filter_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        enqueue(dir.path(), "b1", "create_bookmark", "{}", "text").unwrap();

        let err = list(dir.path(), Some("bogus"), "text").unwrap_err();
        assert!(err.to_string().contains("unknown job status"));
        list(dir.path(), Some("pending"), "json").unwrap();
    }

    #[test]
    fn listing_does_not_block_a_running_app() {
        let dir = tempfile::tempdir().unwrap();
        let app = open_queue(dir.path(), true).unwrap();
        let job = app
            .enqueue(MutationRequest::new("b1", "create_bookmark", json!({})))
            .unwrap();
        let size = app.journal_size().unwrap();

        list(dir.path(), None, "text").unwrap();
        conflicts(dir.path(), "json").unwrap();
        assert!(cancel(dir.path(), job.id).is_err());

        assert_eq!(app.journal_size().unwrap(), size);
        assert_eq!(app.get(job.id).unwrap().status, JobStatus::Pending);
    }
}
