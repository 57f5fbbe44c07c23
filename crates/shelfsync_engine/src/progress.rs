//! Sync cycle progress.

use serde::Serialize;

/// Phase of the sync state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// No cycle has run yet.
    #[default]
    Idle,
    /// A cycle is running.
    Syncing,
    /// The last cycle drained the queue.
    Completed,
    /// The last cycle hit an unrecoverable step.
    Error,
    /// The last cycle found the device offline.
    Offline,
}

impl SyncStatus {
    /// Returns true while a cycle is running.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncStatus::Syncing)
    }
}

/// Observable state of the current or last sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncProgress {
    /// Phase.
    pub status: SyncStatus,
    /// Fraction of work done, in `[0, 1]`.
    pub progress: f64,
    /// Changes known to this cycle.
    pub total_changes: usize,
    /// Changes handled so far.
    pub processed_changes: usize,
    /// Human-readable status line.
    pub message: Option<String>,
    /// Error from the last failed step.
    pub error: Option<String>,
}

impl SyncProgress {
    /// Progress at the start of a cycle.
    pub fn started(total_changes: usize) -> Self {
        Self {
            status: SyncStatus::Syncing,
            progress: 0.0,
            total_changes,
            processed_changes: 0,
            message: Some("syncing".into()),
            error: None,
        }
    }

    /// Offline outcome.
    pub fn offline() -> Self {
        Self {
            status: SyncStatus::Offline,
            message: Some("offline".into()),
            ..Self::default()
        }
    }

    /// Records one more handled change.
    ///
    /// `progress` never decreases within a cycle, even when more work is
    /// discovered along the way.
    pub fn advance(&mut self, discovered_total: usize) {
        self.processed_changes += 1;
        self.total_changes = self.total_changes.max(discovered_total).max(self.processed_changes);
        let ratio = self.processed_changes as f64 / self.total_changes as f64;
        self.progress = self.progress.max(ratio.min(1.0));
    }

    /// Marks the cycle as finished.
    pub fn complete(&mut self) {
        self.status = SyncStatus::Completed;
        self.progress = 1.0;
        self.message = Some(format!("synced {} changes", self.processed_changes));
        self.error = None;
    }

    /// Marks the cycle as failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.status = SyncStatus::Error;
        self.message = Some("sync failed".into());
        self.error = Some(error);
    }
}
