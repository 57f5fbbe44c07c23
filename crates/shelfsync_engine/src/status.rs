//! Combined sync health.

use crate::observable::Observable;
use crate::progress::{SyncProgress, SyncStatus};
use crate::queue::JobQueueStatus;
use serde::Serialize;
use shelfsync_protocol::SyncConflict;
use tokio::sync::watch;

/// Overall health, ordered from least to most severe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Nothing to report.
    #[default]
    Healthy,
    /// Work is in flight.
    Syncing,
    /// The remote store is unreachable.
    Offline,
    /// A cycle failed or jobs need manual action.
    Error,
    /// Conflicts await resolution.
    Conflicts,
}

/// Everything a consumer needs to render sync state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CombinedSyncStatus {
    /// Current or last cycle.
    pub sync_progress: SyncProgress,
    /// Connectivity.
    pub is_online: bool,
    /// Job counts.
    pub job_queue_status: JobQueueStatus,
    /// Outstanding conflicts.
    pub conflicts: Vec<SyncConflict>,
    /// Most severe condition among the above.
    pub health: HealthStatus,
}

impl CombinedSyncStatus {
    /// Derives the combined status from its inputs.
    pub fn compute(
        sync_progress: SyncProgress,
        is_online: bool,
        job_queue_status: JobQueueStatus,
        conflicts: Vec<SyncConflict>,
    ) -> Self {
        let health = if !conflicts.is_empty() {
            HealthStatus::Conflicts
        } else if sync_progress.status == SyncStatus::Error || job_queue_status.failed > 0 {
            HealthStatus::Error
        } else if !is_online {
            HealthStatus::Offline
        } else if sync_progress.status.is_active() || job_queue_status.processing > 0 {
            HealthStatus::Syncing
        } else {
            HealthStatus::Healthy
        };

        Self {
            sync_progress,
            is_online,
            job_queue_status,
            conflicts,
            health,
        }
    }
}

/// Caches and publishes the last computed [`CombinedSyncStatus`].
#[derive(Debug, Default)]
pub struct StatusAggregator {
    current: Observable<CombinedSyncStatus>,
}

impl StatusAggregator {
    /// Creates an aggregator holding the default status.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes from the given inputs and publishes if anything changed.
    pub fn recompute(
        &self,
        sync_progress: SyncProgress,
        is_online: bool,
        job_queue_status: JobQueueStatus,
        conflicts: Vec<SyncConflict>,
    ) -> CombinedSyncStatus {
        let status =
            CombinedSyncStatus::compute(sync_progress, is_online, job_queue_status, conflicts);
        self.current.set(status.clone());
        status
    }

    /// Last computed status.
    pub fn current(&self) -> CombinedSyncStatus {
        self.current.get()
    }

    /// Subscribes to status changes.
    pub fn subscribe(&self) -> watch::Receiver<CombinedSyncStatus> {
        self.current.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use shelfsync_protocol::{detect_conflict, EntitySnapshot, EntityType, JobId};

    fn conflict() -> SyncConflict {
        let t = Utc::now();
        let local = EntitySnapshot::new(EntityType::Tag, "t1", t).with_field("name", json!("a"));
        let server = EntitySnapshot::new(EntityType::Tag, "t1", t).with_field("name", json!("b"));
        detect_conflict(JobId(1), &local, &server, None, t).unwrap()
    }

    fn failed_progress() -> SyncProgress {
        let mut p = SyncProgress::started(1);
        p.fail("pull failed");
        p
    }

    fn compute(
        progress: SyncProgress,
        online: bool,
        conflicts: Vec<SyncConflict>,
    ) -> CombinedSyncStatus {
        CombinedSyncStatus::compute(progress, online, JobQueueStatus::default(), conflicts)
    }

    #[test]
    fn healthy_by_default() {
        let status = compute(SyncProgress::default(), true, vec![]);
        assert_eq!(status.health, HealthStatus::Healthy);
    }

    #[test]
    fn most_severe_condition_wins() {
        let status = compute(failed_progress(), false, vec![conflict()]);
        assert_eq!(status.health, HealthStatus::Conflicts);

        let status = compute(failed_progress(), false, vec![]);
        assert_eq!(status.health, HealthStatus::Error);

        let status = compute(SyncProgress::started(3), false, vec![]);
        assert_eq!(status.health, HealthStatus::Offline);

        let status = compute(SyncProgress::started(3), true, vec![]);
        assert_eq!(status.health, HealthStatus::Syncing);
    }

    #[test]
    fn failed_jobs_are_an_error() {
        let stats = JobQueueStatus {
            failed: 1,
            ..JobQueueStatus::default()
        };
        let status = CombinedSyncStatus::compute(SyncProgress::default(), true, stats, vec![]);
        assert_eq!(status.health, HealthStatus::Error);
    }

    #[test]
    fn severity_order() {
        assert!(HealthStatus::Conflicts > HealthStatus::Error);
        assert!(HealthStatus::Error > HealthStatus::Offline);
        assert!(HealthStatus::Offline > HealthStatus::Syncing);
        assert!(HealthStatus::Syncing > HealthStatus::Healthy);
    }

    #[test]
    fn aggregator_publishes_changes_only() {
        let aggregator = StatusAggregator::new();
        let mut rx = aggregator.subscribe();

        aggregator.recompute(SyncProgress::default(), false, JobQueueStatus::default(), vec![]);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        aggregator.recompute(SyncProgress::default(), false, JobQueueStatus::default(), vec![]);
        assert!(!rx.has_changed().unwrap());
        assert_eq!(aggregator.current().health, HealthStatus::Offline);
    }
}
