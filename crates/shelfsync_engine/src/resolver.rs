//! Conflict resolution.

use crate::error::{SyncError, SyncResult};
use crate::local::LocalStore;
use crate::queue::MutationQueue;
use shelfsync_protocol::{
    merge_changes, ConflictResolution, EntitySnapshot, Job, JobId, JobKind, MutationOp,
    SyncConflict,
};
use std::sync::Arc;
use tracing::info;

/// What a resolution did.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionOutcome {
    /// The originating job: completed, or discarded on [`ConflictResolution::Skip`].
    pub job: Job,
    /// Job scheduled to push the chosen state, if the server needs it.
    pub follow_up: Option<Job>,
}

/// Applies conflict resolutions to local state and the queue.
pub struct ConflictResolver {
    queue: Arc<MutationQueue>,
    local: Arc<dyn LocalStore>,
}

impl ConflictResolver {
    /// Creates a resolver.
    pub fn new(queue: Arc<MutationQueue>, local: Arc<dyn LocalStore>) -> Self {
        Self { queue, local }
    }

    /// Settles the conflict held by a conflicted job.
    ///
    /// - `UseServer` writes the server version locally and drops the local change.
    /// - `UseLocal` schedules a follow-up job that pushes the local change
    ///   on top of the server version.
    /// - `Merge` writes the merged version locally and schedules a follow-up
    ///   job to push it.
    /// - `Skip` discards the job and its conflict, touching neither side.
    ///
    /// Except for `Skip`, the originating job is marked completed with the
    /// resolution recorded on its conflict. A follow-up job takes the
    /// original's queue position. The status check, the local write, the
    /// follow-up and the completion happen under the queue lock, so a
    /// second resolution of the same job fails with
    /// [`SyncError::ConflictNotFound`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::JobNotFound`] or [`SyncError::ConflictNotFound`]
    /// if the job holds no conflict, and local-store or storage errors. On
    /// error the job stays conflicted; retrying the same resolution is safe.
    pub fn resolve_conflict(
        &self,
        job_id: JobId,
        resolution: ConflictResolution,
    ) -> SyncResult<ResolutionOutcome> {
        if resolution == ConflictResolution::Skip {
            let job = self.queue.discard_conflicted(job_id).map_err(|e| match e {
                SyncError::InvalidJobState { .. } => SyncError::ConflictNotFound(job_id),
                other => other,
            })?;
            info!(job_id = %job_id, "conflict skipped");
            return Ok(ResolutionOutcome {
                job,
                follow_up: None,
            });
        }

        let (job, follow_up) = self
            .queue
            .settle_conflict(job_id, resolution, |job, conflict| match resolution {
                ConflictResolution::UseServer => {
                    self.write_local(&conflict.server_version)?;
                    Ok(None)
                }
                ConflictResolution::UseLocal => Ok(Some((job.kind, job.payload.clone()))),
                ConflictResolution::Merge => {
                    let merged = merge_changes(
                        &conflict.client_version,
                        &conflict.server_version,
                        conflict.ancestor.as_ref(),
                    );
                    self.write_local(&merged)?;
                    Ok(Some((merged_kind(job, &merged), merged.fields_as_payload())))
                }
                // Discarded above.
                ConflictResolution::Skip => Ok(None),
            })?;

        info!(
            job_id = %job_id,
            resolution = resolution.as_str(),
            follow_up = ?follow_up.as_ref().map(|j| j.id),
            "conflict resolved"
        );
        Ok(ResolutionOutcome { job, follow_up })
    }

    /// Outstanding conflicts.
    pub fn pending_conflicts(&self) -> Vec<SyncConflict> {
        self.queue.conflicts()
    }

    fn write_local(&self, snapshot: &EntitySnapshot) -> SyncResult<()> {
        if snapshot.deleted {
            self.local.remove(snapshot.entity_type, &snapshot.entity_id)
        } else {
            self.local.apply_snapshot(snapshot)
        }
    }
}

/// A merge that keeps the entity alive must not be pushed as a delete.
fn merged_kind(job: &Job, merged: &EntitySnapshot) -> JobKind {
    if job.kind.op == MutationOp::Delete && !merged.deleted {
        JobKind::new(MutationOp::Update, job.kind.entity_type)
    } else {
        job.kind
    }
}
