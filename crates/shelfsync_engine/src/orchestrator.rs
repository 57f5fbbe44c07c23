//! Sync cycles.
//!
//! A cycle pulls remote changes since the last recorded sync, then drains
//! the mutation queue through the remote API:
//!
//! ```text
//! offline? ──yes──▶ Offline
//!    │
//! quiescent? ──yes──▶ (nothing happens)
//!    │
//! Syncing: delta pull ──fail──▶ Error
//!    │
//! drain queue ──▶ Completed (last sync recorded)
//! ```
//!
//! Only one cycle runs at a time; a trigger that arrives while a cycle is
//! running is dropped.

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{SyncError, SyncResult};
use crate::local::LocalStore;
use crate::observable::Observable;
use crate::progress::SyncProgress;
use crate::queue::MutationQueue;
use crate::remote::{RemoteApi, RemoteError};
use crate::resolver::ConflictResolver;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shelfsync_protocol::{detect_conflict, DeltaCursor, EntitySnapshot, Job, JobId};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn};

/// What started a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// An explicit request.
    Manual,
    /// The periodic timer.
    Periodic,
    /// The device came back online.
    ConnectivityRestored,
    /// The application returned to the foreground.
    Foreground,
}

impl SyncTrigger {
    /// Returns the canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Manual => "manual",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::ConnectivityRestored => "connectivity_restored",
            SyncTrigger::Foreground => "foreground",
        }
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The queue was drained and the last sync recorded.
    Completed,
    /// The device was offline; the queue was not touched.
    Offline,
    /// Another cycle was already running.
    Coalesced,
    /// Nothing changed since the last cycle; no calls were made.
    Quiescent,
}

/// Summary of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// How the cycle ended.
    pub outcome: CycleOutcome,
    /// Remote changes applied locally.
    pub pulled: usize,
    /// Remote changes skipped because a local job is queued for the entity.
    pub deferred: usize,
    /// Jobs applied remotely.
    pub completed: usize,
    /// Jobs that failed (retryable or not).
    pub failed: usize,
    /// Jobs that ran into a conflict.
    pub conflicted: usize,
    /// Conflicts settled by the configured policy.
    pub auto_resolved: usize,
}

impl CycleReport {
    fn new(outcome: CycleOutcome) -> Self {
        Self {
            outcome,
            pulled: 0,
            deferred: 0,
            completed: 0,
            failed: 0,
            conflicted: 0,
            auto_resolved: 0,
        }
    }
}

/// State after the last completed cycle, used to skip redundant cycles.
#[derive(Debug, Clone, Copy)]
struct Quiescence {
    revision: u64,
    pulled_at: DateTime<Utc>,
}

/// Clears the running flag when a cycle ends, even by early return.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drives sync cycles.
pub struct SyncOrchestrator {
    config: SyncConfig,
    queue: Arc<MutationQueue>,
    remote: Arc<dyn RemoteApi>,
    local: Arc<dyn LocalStore>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    resolver: Arc<ConflictResolver>,
    progress: Observable<SyncProgress>,
    running: AtomicBool,
    quiescence: Mutex<Option<Quiescence>>,
}

impl SyncOrchestrator {
    /// Creates an orchestrator.
    pub fn new(
        config: SyncConfig,
        queue: Arc<MutationQueue>,
        remote: Arc<dyn RemoteApi>,
        local: Arc<dyn LocalStore>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        resolver: Arc<ConflictResolver>,
    ) -> Self {
        Self {
            config,
            queue,
            remote,
            local,
            connectivity,
            resolver,
            progress: Observable::new(SyncProgress::default()),
            running: AtomicBool::new(false),
            quiescence: Mutex::new(None),
        }
    }

    /// Current or last cycle progress.
    pub fn progress(&self) -> SyncProgress {
        self.progress.get()
    }

    /// Subscribes to progress changes.
    pub fn subscribe_progress(&self) -> watch::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    /// Returns true while a cycle is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The configuration in use.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Runs one sync cycle on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns the remote error if the delta pull fails, and storage errors
    /// if the queue cannot persist a transition. Progress is set to
    /// `Error` in both cases and the last-sync timestamp is left alone.
    pub fn run_cycle(&self, trigger: SyncTrigger) -> SyncResult<CycleReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(trigger = trigger.as_str(), "sync cycle already running, trigger coalesced");
            return Ok(CycleReport::new(CycleOutcome::Coalesced));
        }
        let _guard = RunningGuard(&self.running);

        let span = info_span!("sync_cycle", trigger = trigger.as_str());
        let _enter = span.enter();

        if !self.connectivity.is_online() {
            info!("offline, skipping sync");
            self.progress.set(SyncProgress::offline());
            *self.quiescence.lock() = None;
            return Ok(CycleReport::new(CycleOutcome::Offline));
        }

        let now = Utc::now();
        if self.is_quiescent(now) {
            debug!("nothing changed since last cycle");
            return Ok(CycleReport::new(CycleOutcome::Quiescent));
        }

        info!(pending = self.queue.stats().pending, "sync cycle started");
        self.progress.set(SyncProgress::started(self.queue.stats().pending));

        match self.cycle(now) {
            Ok(report) => Ok(report),
            Err(e) => {
                error!(error = %e, "sync cycle failed");
                self.progress.update(|p| p.fail(e.to_string()));
                *self.quiescence.lock() = None;
                Err(e)
            }
        }
    }

    fn is_quiescent(&self, now: DateTime<Utc>) -> bool {
        let Some(q) = *self.quiescence.lock() else {
            return false;
        };
        let fresh = chrono::Duration::from_std(self.config.min_pull_interval)
            .map(|interval| now - q.pulled_at < interval)
            .unwrap_or(true);

        fresh && q.revision == self.queue.revision() && self.queue.dequeue_next_at(now).is_none()
    }

    fn cycle(&self, started_at: DateTime<Utc>) -> SyncResult<CycleReport> {
        let mut report = CycleReport::new(CycleOutcome::Completed);

        let server_time = self.pull(&mut report)?;
        self.drain(&mut report)?;

        let last_sync = server_time.map_or(started_at, |t| t.max(started_at)).max(Utc::now());
        self.queue.set_last_sync(last_sync)?;
        *self.quiescence.lock() = Some(Quiescence {
            revision: self.queue.revision(),
            pulled_at: started_at,
        });

        self.progress.update(|p| p.complete());
        info!(
            pulled = report.pulled,
            completed = report.completed,
            failed = report.failed,
            conflicted = report.conflicted,
            "sync cycle completed"
        );
        Ok(report)
    }

    /// Pulls every page of remote changes. Returns the latest server time.
    ///
    /// Pages are chained by feed cursor, so changes sharing a timestamp
    /// across a page boundary are all delivered.
    fn pull(&self, report: &mut CycleReport) -> SyncResult<Option<DateTime<Utc>>> {
        let since = self.queue.last_sync();
        let mut cursor: Option<DeltaCursor> = None;
        let mut server_time: Option<DateTime<Utc>> = None;

        loop {
            let delta = self.remote.changes_since(
                since,
                cursor.as_ref(),
                self.config.pull_batch_size,
                self.config.request_timeout,
            )?;

            for change in &delta.changes {
                if self.queue.has_live_job(change.entity_type, &change.entity_id) {
                    debug!(entity_id = %change.entity_id, "remote change deferred to queued job");
                    report.deferred += 1;
                } else {
                    self.local.apply_remote(change)?;
                    report.pulled += 1;
                }
            }

            server_time = server_time.max(delta.server_time);

            let next = delta.next_cursor.clone().or_else(|| delta.last_cursor());
            match next {
                Some(next) if delta.has_more && cursor.as_ref().map_or(true, |c| next > *c) => {
                    cursor = Some(next);
                }
                _ => break,
            }
        }

        debug!(pulled = report.pulled, deferred = report.deferred, "delta pull finished");
        Ok(server_time)
    }

    /// Applies queued jobs until none is eligible. Each job is attempted at
    /// most once per cycle.
    ///
    /// If a step after `mark_processing` fails, the job is released back to
    /// `pending` before the error aborts the cycle, so its entity is not
    /// left blocked.
    fn drain(&self, report: &mut CycleReport) -> SyncResult<()> {
        let mut attempted: HashSet<JobId> = HashSet::new();

        while let Some(job) = self.queue.dequeue_next_skipping(Utc::now(), &attempted) {
            attempted.insert(job.id);
            let job = self.queue.mark_processing(job.id)?;

            if let Err(e) = self.process(&job, &mut attempted, report) {
                if self.queue.release_processing(job.id) {
                    warn!(job_id = %job.id, error = %e, "job released after aborted apply");
                }
                return Err(e);
            }

            let remaining = self.queue.stats().pending;
            self.progress
                .update(|p| p.advance(p.processed_changes + 1 + remaining));
        }
        Ok(())
    }

    /// Applies one processing job and records the outcome.
    fn process(
        &self,
        job: &Job,
        attempted: &mut HashSet<JobId>,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        match self.remote.apply(job, self.config.request_timeout) {
            Ok(ack) => {
                self.queue.mark_completed(job.id)?;
                report.completed += 1;
                if !self.queue.has_live_job(job.entity_type(), &job.entity_id) {
                    self.local.apply_remote(&ack)?;
                }
            }
            Err(e) if e.is_conflict() => {
                if let Some(follow_up) = self.handle_conflict(job, e, report)? {
                    attempted.insert(follow_up);
                }
            }
            Err(e) if e.is_retryable() => {
                self.queue.mark_failed(job.id, e.to_string())?;
                report.failed += 1;
            }
            Err(e) => {
                self.queue.mark_rejected(job.id, e.to_string())?;
                report.failed += 1;
            }
        }
        Ok(())
    }

    /// Routes a version conflict. Returns a follow-up job created by an
    /// automatic resolution.
    fn handle_conflict(
        &self,
        job: &Job,
        error: RemoteError,
        report: &mut CycleReport,
    ) -> SyncResult<Option<JobId>> {
        let server = match error {
            RemoteError::VersionConflict {
                server: Some(server),
            } => *server,
            _ => match self.remote.fetch_entity(
                job.entity_type(),
                &job.entity_id,
                self.config.request_timeout,
            ) {
                Ok(Some(server)) => server,
                Ok(None) => {
                    EntitySnapshot::new(job.entity_type(), job.entity_id.clone(), Utc::now())
                        .into_deleted()
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "could not fetch server version");
                    if e.is_retryable() {
                        self.queue.mark_failed(job.id, e.to_string())?;
                    } else {
                        self.queue.mark_rejected(job.id, e.to_string())?;
                    }
                    report.failed += 1;
                    return Ok(None);
                }
            },
        };

        let local = job.intended_state();
        let Some(conflict) = detect_conflict(job.id, &local, &server, job.base.as_ref(), Utc::now())
        else {
            debug!(job_id = %job.id, "server already holds the local change");
            self.queue.mark_completed(job.id)?;
            report.completed += 1;
            return Ok(None);
        };

        report.conflicted += 1;
        let policy = self.config.conflict_policy;
        let choice = policy.choose(&conflict);
        self.queue.mark_conflicted(job.id, conflict)?;

        let Some(resolution) = choice else {
            return Ok(None);
        };
        let outcome = self.resolver.resolve_conflict(job.id, resolution)?;
        report.auto_resolved += 1;
        info!(
            job_id = %job.id,
            resolution = resolution.as_str(),
            ?policy,
            "conflict resolved by policy"
        );
        Ok(outcome.follow_up.map(|j| j.id))
    }
}
