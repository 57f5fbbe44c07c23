//! The durable mutation queue.
//!
//! Every state change is written to the [`JobStore`] before it becomes
//! visible in memory, so a successful call always survives a restart and a
//! failed write leaves the queue unchanged.
//!
//! ## Ordering
//!
//! Jobs are considered in `(created_at, id)` order. For each entity only
//! the oldest live job can run: a job that is processing, conflicted, or
//! pending but waiting out its backoff blocks every later job for the same
//! entity. Jobs for different entities never block each other.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use crate::observable::Observable;
use crate::store::{JobStore, JobStoreConfig, LoadedState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use shelfsync_protocol::{
    ConflictResolution, EntityType, Job, JobId, JobKind, JobStatus, MutationRequest, SyncConflict,
};
use shelfsync_storage::StorageBackend;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobQueueStatus {
    /// Jobs waiting to be applied.
    pub pending: usize,
    /// Jobs being applied.
    pub processing: usize,
    /// Jobs that exhausted their retries or were rejected.
    pub failed: usize,
    /// Jobs awaiting conflict resolution.
    pub conflicted: usize,
    /// Completed jobs not yet purged.
    pub completed: usize,
}

impl JobQueueStatus {
    fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut stats = Self::default();
        for job in jobs {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Conflicted => stats.conflicted += 1,
                JobStatus::Completed => stats.completed += 1,
            }
        }
        stats
    }

    /// Jobs that still need work or attention.
    pub fn outstanding(&self) -> usize {
        self.pending + self.processing + self.failed + self.conflicted
    }
}

struct QueueInner {
    jobs: BTreeMap<JobId, Job>,
    next_id: u64,
    last_sync: Option<DateTime<Utc>>,
    revision: u64,
}

impl QueueInner {
    fn ordered(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs
    }

    fn get(&self, job_id: JobId) -> SyncResult<&Job> {
        self.jobs.get(&job_id).ok_or(SyncError::JobNotFound(job_id))
    }

    fn expect_status(&self, job_id: JobId, expected: JobStatus) -> SyncResult<Job> {
        let job = self.get(job_id)?;
        if job.status != expected {
            return Err(SyncError::InvalidJobState {
                job_id,
                actual: job.status,
                expected,
            });
        }
        Ok(job.clone())
    }

    fn processing_for(&self, entity_id: &str) -> Option<JobId> {
        self.jobs
            .values()
            .find(|j| j.status == JobStatus::Processing && j.entity_id == entity_id)
            .map(|j| j.id)
    }

    fn next_eligible(&self, now: DateTime<Utc>, skip: &HashSet<JobId>) -> Option<&Job> {
        let mut blocked: HashSet<&str> = HashSet::new();
        for job in self.ordered() {
            match job.status {
                JobStatus::Completed | JobStatus::Failed => {}
                JobStatus::Processing | JobStatus::Conflicted => {
                    blocked.insert(&job.entity_id);
                }
                JobStatus::Pending => {
                    if blocked.contains(job.entity_id.as_str()) {
                        continue;
                    }
                    if job.is_due(now) && !skip.contains(&job.id) {
                        return Some(job);
                    }
                    blocked.insert(&job.entity_id);
                }
            }
        }
        None
    }
}

/// Durable, per-entity ordered queue of mutation jobs.
pub struct MutationQueue {
    inner: Mutex<QueueInner>,
    store: JobStore,
    retry: RetryConfig,
    stats: Observable<JobQueueStatus>,
}

impl MutationQueue {
    /// Opens a queue over `backend`, replaying its journal.
    ///
    /// Jobs left `processing` by an interrupted run are returned to
    /// `pending`.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be replayed or recovery
    /// cannot be persisted.
    pub fn open(
        backend: Box<dyn StorageBackend>,
        store_config: &JobStoreConfig,
        retry: RetryConfig,
    ) -> SyncResult<Self> {
        let (store, loaded) = JobStore::open(backend, store_config)?;
        Self::from_store(store, loaded, retry)
    }

    /// Opens a queue whose journal lives in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be opened or replayed.
    pub fn open_dir(
        dir: &Path,
        store_config: &JobStoreConfig,
        retry: RetryConfig,
    ) -> SyncResult<Self> {
        let (store, loaded) = JobStore::open_dir(dir, store_config)?;
        Self::from_store(store, loaded, retry)
    }

    /// Opens the queue in `dir` for inspection only.
    ///
    /// Nothing is written: interrupted jobs keep their `processing` status,
    /// a torn tail is left in place, and every mutating call fails with a
    /// storage error. Safe to use while another process owns the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read or is corrupted.
    pub fn open_dir_read_only(
        dir: &Path,
        store_config: &JobStoreConfig,
        retry: RetryConfig,
    ) -> SyncResult<Self> {
        let (store, loaded) = JobStore::open_read_only(dir, store_config)?;
        Ok(Self::build(store, loaded, retry))
    }

    /// Opens an empty, non-persistent queue.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches [`MutationQueue::open`].
    pub fn in_memory(retry: RetryConfig) -> SyncResult<Self> {
        let (store, loaded) = JobStore::in_memory()?;
        Self::from_store(store, loaded, retry)
    }

    fn from_store(store: JobStore, loaded: LoadedState, retry: RetryConfig) -> SyncResult<Self> {
        let queue = Self::build(store, loaded, retry);
        queue.recover_interrupted()?;
        Ok(queue)
    }

    fn build(store: JobStore, loaded: LoadedState, retry: RetryConfig) -> Self {
        Self {
            stats: Observable::new(JobQueueStatus::from_jobs(loaded.jobs.values())),
            inner: Mutex::new(QueueInner {
                jobs: loaded.jobs,
                next_id: loaded.next_id.max(1),
                last_sync: loaded.last_sync,
                revision: 0,
            }),
            store,
            retry,
        }
    }

    /// Returns jobs left `processing` by a crash to `pending`.
    ///
    /// Returns the number of recovered jobs.
    ///
    /// # Errors
    ///
    /// Returns an error if a recovered job cannot be persisted.
    pub fn recover_interrupted(&self) -> SyncResult<usize> {
        let mut inner = self.inner.lock();
        let interrupted: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing)
            .cloned()
            .collect();

        for mut job in interrupted.iter().cloned() {
            warn!(job_id = %job.id, entity_id = %job.entity_id, "recovering interrupted job");
            job.status = JobStatus::Pending;
            self.commit(&mut inner, job)?;
        }
        Ok(interrupted.len())
    }

    /// Validates and durably enqueues a mutation.
    ///
    /// The returned job has been written to the store; it survives a
    /// process restart.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidJob`] or [`SyncError::UnknownKind`] for a
    /// bad request, and a storage error if the job could not be persisted.
    pub fn enqueue(&self, request: MutationRequest) -> SyncResult<Job> {
        let kind = request.validate()?;
        let mut inner = self.inner.lock();
        let id = JobId(inner.next_id);
        let job = Job::new(
            id,
            request.entity_id,
            kind,
            request.payload,
            request.base,
            Utc::now(),
        );

        self.commit(&mut inner, job.clone())?;
        inner.next_id += 1;
        info!(job_id = %id, entity_id = %job.entity_id, kind = %kind, "job enqueued");
        Ok(job)
    }

    /// Persists `job` and makes it visible. Memory is untouched on failure.
    fn commit(&self, inner: &mut QueueInner, job: Job) -> SyncResult<()> {
        self.commit_all(inner, vec![job])
    }

    /// Persists `jobs` with one journal write, then makes them visible.
    fn commit_all(&self, inner: &mut QueueInner, jobs: Vec<Job>) -> SyncResult<()> {
        if let Err(e) = self.store.put_jobs(&jobs) {
            let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
            error!(job_ids = ?ids, error = %e, "failed to persist job");
            return Err(e);
        }
        self.install(inner, jobs);
        Ok(())
    }

    fn install(&self, inner: &mut QueueInner, jobs: Vec<Job>) {
        for job in jobs {
            inner.jobs.insert(job.id, job);
        }
        inner.revision += 1;
        self.stats.set(JobQueueStatus::from_jobs(inner.jobs.values()));
    }

    fn remove(&self, inner: &mut QueueInner, job_id: JobId) -> SyncResult<()> {
        self.store.remove_job(job_id)?;
        inner.jobs.remove(&job_id);
        inner.revision += 1;
        self.stats.set(JobQueueStatus::from_jobs(inner.jobs.values()));
        Ok(())
    }

    /// Returns the oldest pending job whose entity is not blocked.
    pub fn dequeue_next(&self) -> Option<Job> {
        self.dequeue_next_at(Utc::now())
    }

    /// [`MutationQueue::dequeue_next`] as of `now`.
    pub fn dequeue_next_at(&self, now: DateTime<Utc>) -> Option<Job> {
        self.inner.lock().next_eligible(now, &HashSet::new()).cloned()
    }

    /// Like [`MutationQueue::dequeue_next_at`], treating the jobs in `skip`
    /// as not due. A skipped job still blocks later jobs for its entity.
    pub(crate) fn dequeue_next_skipping(
        &self,
        now: DateTime<Utc>,
        skip: &HashSet<JobId>,
    ) -> Option<Job> {
        self.inner.lock().next_eligible(now, skip).cloned()
    }

    /// Marks a pending job as being applied.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::EntityBusy`] if another job for the same entity
    /// is processing, and [`SyncError::InvalidJobState`] if the job is not
    /// pending.
    pub fn mark_processing(&self, job_id: JobId) -> SyncResult<Job> {
        let mut inner = self.inner.lock();
        let mut job = inner.expect_status(job_id, JobStatus::Pending)?;

        if let Some(processing) = inner.processing_for(&job.entity_id) {
            return Err(SyncError::EntityBusy {
                entity_id: job.entity_id,
                processing,
            });
        }

        job.status = JobStatus::Processing;
        job.updated_at = Utc::now();
        self.commit(&mut inner, job.clone())?;
        debug!(job_id = %job_id, entity_id = %job.entity_id, "job processing");
        Ok(job)
    }

    /// Marks a processing job as applied.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidJobState`] if the job is not processing.
    pub fn mark_completed(&self, job_id: JobId) -> SyncResult<Job> {
        let mut inner = self.inner.lock();
        let mut job = inner.expect_status(job_id, JobStatus::Processing)?;

        job.status = JobStatus::Completed;
        job.next_attempt_at = None;
        job.updated_at = Utc::now();
        self.commit(&mut inner, job.clone())?;
        debug!(job_id = %job_id, "job completed");
        Ok(job)
    }

    /// Records a retryable failure.
    ///
    /// The job goes back to `pending` with a backoff delay, or to `failed`
    /// once its attempts reach the configured maximum.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidJobState`] if the job is not processing.
    pub fn mark_failed(&self, job_id: JobId, error: impl Into<String>) -> SyncResult<Job> {
        let mut inner = self.inner.lock();
        let mut job = inner.expect_status(job_id, JobStatus::Processing)?;
        let now = Utc::now();

        job.attempts += 1;
        job.last_error = Some(error.into());
        job.updated_at = now;

        if job.attempts >= self.retry.max_attempts {
            job.status = JobStatus::Failed;
            job.next_attempt_at = None;
            warn!(job_id = %job_id, attempts = job.attempts, "job failed permanently");
        } else {
            let delay = self.retry.delay_for_attempt(job.attempts);
            let delay =
                chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            job.status = JobStatus::Pending;
            job.next_attempt_at = Some(now + delay);
            warn!(
                job_id = %job_id,
                attempts = job.attempts,
                retry_in_ms = delay.num_milliseconds(),
                "job failed, will retry"
            );
        }

        self.commit(&mut inner, job.clone())?;
        Ok(job)
    }

    /// Records a permanent rejection; the job skips the retry path.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidJobState`] if the job is not processing.
    pub fn mark_rejected(&self, job_id: JobId, error: impl Into<String>) -> SyncResult<Job> {
        let mut inner = self.inner.lock();
        let mut job = inner.expect_status(job_id, JobStatus::Processing)?;

        job.attempts += 1;
        job.last_error = Some(error.into());
        job.status = JobStatus::Failed;
        job.next_attempt_at = None;
        job.updated_at = Utc::now();
        self.commit(&mut inner, job.clone())?;
        warn!(job_id = %job_id, "job rejected by remote");
        Ok(job)
    }

    /// Moves a processing job to `conflicted`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidJobState`] if the job is not processing.
    pub fn mark_conflicted(&self, job_id: JobId, conflict: SyncConflict) -> SyncResult<Job> {
        let mut inner = self.inner.lock();
        let mut job = inner.expect_status(job_id, JobStatus::Processing)?;

        warn!(
            job_id = %job_id,
            entity_id = %job.entity_id,
            conflict_type = %conflict.conflict_type,
            "job conflicted"
        );
        job.status = JobStatus::Conflicted;
        job.conflict = Some(conflict);
        job.next_attempt_at = None;
        job.updated_at = Utc::now();
        self.commit(&mut inner, job.clone())?;
        Ok(job)
    }

    /// Returns a processing job to `pending` after its cycle aborted.
    ///
    /// The transition is persisted when the store accepts it. When it does
    /// not, memory is updated anyway: the journal still says `processing`,
    /// which the next open recovers to the same state. Returns false if the
    /// job was not processing.
    pub(crate) fn release_processing(&self, job_id: JobId) -> bool {
        let mut inner = self.inner.lock();
        let Ok(mut job) = inner.expect_status(job_id, JobStatus::Processing) else {
            return false;
        };
        job.status = JobStatus::Pending;
        job.updated_at = Utc::now();

        if let Err(e) = self.commit(&mut inner, job.clone()) {
            warn!(job_id = %job_id, error = %e, "job released in memory only");
            self.install(&mut inner, vec![job]);
        }
        true
    }

    /// Completes a conflicted job, recording `resolution` on its conflict.
    ///
    /// Everything happens under the queue lock, so concurrent resolutions of
    /// the same job cannot both succeed. Once the job is confirmed
    /// conflicted, `apply` performs the resolution's local side effects and
    /// returns the mutation to push, if any. That follow-up job takes the
    /// original's queue position and is based on the server version; it is
    /// persisted together with the completion in one journal write.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::JobNotFound`], [`SyncError::ConflictNotFound`] if
    /// the job holds no open conflict, any error from `apply`, and storage
    /// errors. On error the job stays conflicted and no follow-up exists.
    pub(crate) fn settle_conflict<F>(
        &self,
        job_id: JobId,
        resolution: ConflictResolution,
        apply: F,
    ) -> SyncResult<(Job, Option<Job>)>
    where
        F: FnOnce(&Job, &SyncConflict) -> SyncResult<Option<(JobKind, serde_json::Value)>>,
    {
        let mut inner = self.inner.lock();
        let mut job = inner.get(job_id)?.clone();
        let mut conflict = match (job.status, job.conflict.take()) {
            (JobStatus::Conflicted, Some(conflict)) => conflict,
            _ => return Err(SyncError::ConflictNotFound(job_id)),
        };

        let follow_up = apply(&job, &conflict)?.map(|(kind, payload)| {
            Job::new(
                JobId(inner.next_id),
                job.entity_id.clone(),
                kind,
                payload,
                Some(conflict.server_version.clone()),
                job.created_at,
            )
        });

        conflict.resolve(resolution);
        job.conflict = Some(conflict);
        job.status = JobStatus::Completed;
        job.next_attempt_at = None;
        job.updated_at = Utc::now();

        let mut batch: Vec<Job> = follow_up.iter().cloned().collect();
        batch.push(job.clone());
        self.commit_all(&mut inner, batch)?;
        if let Some(follow_up) = &follow_up {
            inner.next_id += 1;
            info!(job_id = %follow_up.id, original = %job_id, "follow-up job enqueued");
        }
        Ok((job, follow_up))
    }

    /// Returns every permanently failed job to `pending` with zeroed attempts.
    ///
    /// Ids and creation times are kept, so the original order holds.
    ///
    /// # Errors
    ///
    /// Returns an error if a job cannot be persisted; jobs reset before the
    /// failure stay reset.
    pub fn retry_failed_jobs(&self) -> SyncResult<usize> {
        let mut inner = self.inner.lock();
        let failed: Vec<Job> = inner
            .ordered()
            .into_iter()
            .filter(|j| j.status == JobStatus::Failed)
            .cloned()
            .collect();

        let now = Utc::now();
        for mut job in failed.iter().cloned() {
            job.status = JobStatus::Pending;
            job.attempts = 0;
            job.last_error = None;
            job.next_attempt_at = None;
            job.updated_at = now;
            self.commit(&mut inner, job)?;
        }

        if !failed.is_empty() {
            info!(count = failed.len(), "failed jobs requeued");
        }
        Ok(failed.len())
    }

    /// Removes a job that has not started.
    ///
    /// Pending and permanently failed jobs can be cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotCancellable`] for processing, conflicted and
    /// completed jobs.
    pub fn cancel_job(&self, job_id: JobId) -> SyncResult<Job> {
        let mut inner = self.inner.lock();
        let job = inner.get(job_id)?.clone();
        if !matches!(job.status, JobStatus::Pending | JobStatus::Failed) {
            return Err(SyncError::NotCancellable {
                job_id,
                status: job.status,
            });
        }

        self.remove(&mut inner, job_id)?;
        info!(job_id = %job_id, "job cancelled");
        Ok(job)
    }

    /// Drops a conflicted job together with its conflict.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidJobState`] if the job is not conflicted.
    pub fn discard_conflicted(&self, job_id: JobId) -> SyncResult<Job> {
        let mut inner = self.inner.lock();
        let job = inner.expect_status(job_id, JobStatus::Conflicted)?;
        self.remove(&mut inner, job_id)?;
        info!(job_id = %job_id, "conflicted job discarded");
        Ok(job)
    }

    /// Purges completed jobs older than `retention` and compacts the journal.
    ///
    /// Returns the number of purged jobs.
    ///
    /// # Errors
    ///
    /// Returns an error if a removal or the compaction fails.
    pub fn clear_old_jobs(&self, retention: Duration) -> SyncResult<usize> {
        let now = Utc::now();
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
        else {
            return Ok(0);
        };

        let mut inner = self.inner.lock();
        let old: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Completed && j.updated_at <= cutoff)
            .map(|j| j.id)
            .collect();

        for job_id in &old {
            self.remove(&mut inner, *job_id)?;
        }

        if !old.is_empty() {
            self.store
                .compact(inner.jobs.values(), inner.last_sync, inner.next_id)?;
            info!(purged = old.len(), "old jobs cleared");
        }
        Ok(old.len())
    }

    /// Rewrites the journal with only the live state.
    ///
    /// # Errors
    ///
    /// Returns an error if the rewrite fails.
    pub fn compact(&self) -> SyncResult<()> {
        let inner = self.inner.lock();
        self.store
            .compact(inner.jobs.values(), inner.last_sync, inner.next_id)
    }

    /// Returns a job by id.
    pub fn get(&self, job_id: JobId) -> Option<Job> {
        self.inner.lock().jobs.get(&job_id).cloned()
    }

    /// Returns every job in queue order.
    pub fn jobs(&self) -> Vec<Job> {
        self.inner.lock().ordered().into_iter().cloned().collect()
    }

    /// Returns conflicted jobs in queue order.
    pub fn get_conflicted_jobs(&self) -> Vec<Job> {
        self.inner
            .lock()
            .ordered()
            .into_iter()
            .filter(|j| j.status == JobStatus::Conflicted)
            .cloned()
            .collect()
    }

    /// Returns the outstanding conflicts.
    pub fn conflicts(&self) -> Vec<SyncConflict> {
        self.get_conflicted_jobs()
            .into_iter()
            .filter_map(|j| j.conflict)
            .filter(SyncConflict::is_pending)
            .collect()
    }

    /// Current job counts.
    pub fn stats(&self) -> JobQueueStatus {
        self.stats.get()
    }

    /// Subscribes to job count changes.
    pub fn subscribe_stats(&self) -> watch::Receiver<JobQueueStatus> {
        self.stats.subscribe()
    }

    /// Counter bumped by every state change.
    pub fn revision(&self) -> u64 {
        self.inner.lock().revision
    }

    /// Earliest scheduled retry among pending jobs.
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .filter_map(|j| j.next_attempt_at)
            .min()
    }

    /// Last recorded successful sync.
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_sync
    }

    /// Durably records a successful sync.
    ///
    /// # Errors
    ///
    /// Returns an error if the bookmark cannot be persisted.
    pub fn set_last_sync(&self, at: DateTime<Utc>) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        self.store.set_last_sync(at)?;
        inner.last_sync = Some(at);
        Ok(())
    }

    /// Journal size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot report its size.
    pub fn journal_size(&self) -> SyncResult<u64> {
        self.store.size()
    }

    /// Returns true if the entity has a job that is not yet terminal or is
    /// awaiting resolution.
    pub fn has_live_job(&self, entity_type: EntityType, entity_id: &str) -> bool {
        self.inner.lock().jobs.values().any(|j| {
            j.entity_type() == entity_type
                && j.entity_id == entity_id
                && matches!(
                    j.status,
                    JobStatus::Pending | JobStatus::Processing | JobStatus::Conflicted
                )
        })
    }
}
