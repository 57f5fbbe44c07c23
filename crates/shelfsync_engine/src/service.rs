//! Composition root.

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::SyncResult;
use crate::local::LocalStore;
use crate::orchestrator::{CycleReport, SyncOrchestrator, SyncTrigger};
use crate::progress::SyncProgress;
use crate::queue::MutationQueue;
use crate::remote::RemoteApi;
use crate::resolver::{ConflictResolver, ResolutionOutcome};
use crate::scheduler::{ReadingProgressDebouncer, ScheduledTask, SyncTriggers};
use crate::status::{CombinedSyncStatus, StatusAggregator};
use crate::store::JobStoreConfig;
use parking_lot::Mutex;
use shelfsync_protocol::{ConflictResolution, Job, JobId, MutationRequest, SyncConflict};
use shelfsync_storage::StorageBackend;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{error, info};

struct ServiceInner {
    config: SyncConfig,
    queue: Arc<MutationQueue>,
    orchestrator: SyncOrchestrator,
    resolver: Arc<ConflictResolver>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    status: StatusAggregator,
}

impl ServiceInner {
    fn refresh_status(&self) -> CombinedSyncStatus {
        self.status.recompute(
            self.orchestrator.progress(),
            self.connectivity.is_online(),
            self.queue.stats(),
            self.queue.conflicts(),
        )
    }

    fn run_cycle(&self, trigger: SyncTrigger) -> SyncResult<CycleReport> {
        let result = self.orchestrator.run_cycle(trigger);
        self.refresh_status();
        result
    }
}

struct Background {
    triggers: SyncTriggers,
    watcher: ScheduledTask,
}

/// Owns and wires every sync component.
///
/// All dependencies are passed in; nothing is global. Commands are
/// synchronous and refresh the combined status before returning.
/// [`SyncService::start`] adds the background triggers and the status
/// watcher.
pub struct SyncService {
    inner: Arc<ServiceInner>,
    background: Mutex<Option<Background>>,
}

impl SyncService {
    /// Wires a service around an opened queue.
    pub fn new(
        config: SyncConfig,
        queue: Arc<MutationQueue>,
        remote: Arc<dyn RemoteApi>,
        local: Arc<dyn LocalStore>,
        connectivity: Arc<dyn ConnectivityMonitor>,
    ) -> Self {
        let resolver = Arc::new(ConflictResolver::new(queue.clone(), local.clone()));
        let orchestrator = SyncOrchestrator::new(
            config.clone(),
            queue.clone(),
            remote,
            local,
            connectivity.clone(),
            resolver.clone(),
        );

        let inner = Arc::new(ServiceInner {
            config,
            queue,
            orchestrator,
            resolver,
            connectivity,
            status: StatusAggregator::new(),
        });
        inner.refresh_status();

        Self {
            inner,
            background: Mutex::new(None),
        }
    }

    /// Opens the queue's journal on `backend` and wires a service around it.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be replayed.
    pub fn open(
        backend: Box<dyn StorageBackend>,
        store_config: &JobStoreConfig,
        config: SyncConfig,
        remote: Arc<dyn RemoteApi>,
        local: Arc<dyn LocalStore>,
        connectivity: Arc<dyn ConnectivityMonitor>,
    ) -> SyncResult<Self> {
        let queue = Arc::new(MutationQueue::open(backend, store_config, config.retry.clone())?);
        Ok(Self::new(config, queue, remote, local, connectivity))
    }

    /// Starts the periodic, connectivity and foreground triggers and the
    /// status watcher on `runtime`. Calling it again restarts them.
    pub fn start(&self, runtime: &Handle) {
        self.shutdown();

        let cycle_inner = self.inner.clone();
        let triggers = SyncTriggers::start(
            runtime,
            move |trigger| {
                if let Err(e) = cycle_inner.run_cycle(trigger) {
                    error!(trigger = trigger.as_str(), error = %e, "triggered sync failed");
                }
            },
            self.inner.connectivity.subscribe(),
            self.inner.config.sync_interval,
        );

        let watcher = ScheduledTask::spawn(runtime, watch_status(self.inner.clone()));

        *self.background.lock() = Some(Background { triggers, watcher });
        info!(interval = ?self.inner.config.sync_interval, "sync service started");
    }

    /// Stops the background tasks. Commands keep working.
    pub fn shutdown(&self) {
        if let Some(background) = self.background.lock().take() {
            background.triggers.stop();
            background.watcher.cancel();
            info!("sync service stopped");
        }
    }

    /// Validates and durably enqueues a mutation.
    ///
    /// # Errors
    ///
    /// Returns validation errors and storage errors; see
    /// [`MutationQueue::enqueue`].
    pub fn enqueue(&self, request: MutationRequest) -> SyncResult<Job> {
        let job = self.inner.queue.enqueue(request)?;
        self.inner.refresh_status();
        Ok(job)
    }

    /// Runs a sync cycle on the calling thread.
    ///
    /// # Errors
    ///
    /// See [`SyncOrchestrator::run_cycle`].
    pub fn force_sync_now(&self) -> SyncResult<CycleReport> {
        self.inner.run_cycle(SyncTrigger::Manual)
    }

    /// Signals that the application returned to the foreground.
    ///
    /// With background triggers running the cycle is scheduled; otherwise
    /// it runs on the calling thread.
    pub fn notify_foreground(&self) {
        if let Some(background) = self.background.lock().as_ref() {
            background.triggers.notify_foreground();
            return;
        }
        if let Err(e) = self.inner.run_cycle(SyncTrigger::Foreground) {
            error!(error = %e, "foreground sync failed");
        }
    }

    /// Returns permanently failed jobs to the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if a job cannot be persisted.
    pub fn retry_failed_jobs(&self) -> SyncResult<usize> {
        let count = self.inner.queue.retry_failed_jobs()?;
        self.inner.refresh_status();
        Ok(count)
    }

    /// Settles a conflict.
    ///
    /// # Errors
    ///
    /// See [`ConflictResolver::resolve_conflict`].
    pub fn resolve_conflict(
        &self,
        job_id: JobId,
        resolution: ConflictResolution,
    ) -> SyncResult<ResolutionOutcome> {
        let outcome = self.inner.resolver.resolve_conflict(job_id, resolution)?;
        self.inner.refresh_status();
        Ok(outcome)
    }

    /// Purges completed jobs older than the configured retention.
    ///
    /// # Errors
    ///
    /// Returns an error if the purge or compaction fails.
    pub fn clear_old_jobs(&self) -> SyncResult<usize> {
        let purged = self
            .inner
            .queue
            .clear_old_jobs(self.inner.config.completed_retention)?;
        self.inner.refresh_status();
        Ok(purged)
    }

    /// Cancels a job that has not started.
    ///
    /// # Errors
    ///
    /// See [`MutationQueue::cancel_job`].
    pub fn cancel_job(&self, job_id: JobId) -> SyncResult<Job> {
        let job = self.inner.queue.cancel_job(job_id)?;
        self.inner.refresh_status();
        Ok(job)
    }

    /// Outstanding conflicts.
    pub fn conflicts(&self) -> Vec<SyncConflict> {
        self.inner.queue.conflicts()
    }

    /// Conflicted jobs.
    pub fn get_conflicted_jobs(&self) -> Vec<Job> {
        self.inner.queue.get_conflicted_jobs()
    }

    /// Sync progress stream.
    pub fn sync_progress(&self) -> watch::Receiver<SyncProgress> {
        self.inner.orchestrator.subscribe_progress()
    }

    /// Connectivity stream.
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.inner.connectivity.subscribe()
    }

    /// Combined status stream.
    pub fn combined_status(&self) -> watch::Receiver<CombinedSyncStatus> {
        self.inner.status.subscribe()
    }

    /// Latest combined status.
    pub fn current_status(&self) -> CombinedSyncStatus {
        self.inner.status.current()
    }

    /// The underlying queue.
    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.inner.queue
    }

    /// Creates a reading-progress debouncer feeding this service's queue.
    pub fn reading_progress(&self, runtime: Handle, delay: Duration) -> ReadingProgressDebouncer {
        ReadingProgressDebouncer::new(self.inner.queue.clone(), runtime, delay)
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Recomputes the combined status whenever an upstream value changes.
async fn watch_status(inner: Arc<ServiceInner>) {
    let mut progress = inner.orchestrator.subscribe_progress();
    let mut online = inner.connectivity.subscribe();
    let mut stats = inner.queue.subscribe_stats();

    loop {
        let changed = tokio::select! {
            r = progress.changed() => r,
            r = online.changed() => r,
            r = stats.changed() => r,
        };
        if changed.is_err() {
            break;
        }
        inner.refresh_status();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::connectivity::ManualConnectivity;
    use crate::local::MemoryLocalStore;
    use crate::remote::MockRemote;
    use crate::status::HealthStatus;
    use serde_json::json;
    use shelfsync_storage::InMemoryBackend;

    fn service(connectivity: Arc<ManualConnectivity>) -> (SyncService, Arc<MockRemote>) {
        let remote = Arc::new(MockRemote::new());
        let service = SyncService::open(
            Box::new(InMemoryBackend::new()),
            &JobStoreConfig::default(),
            SyncConfig::new().with_retry(RetryConfig::immediate(5)),
            remote.clone(),
            Arc::new(MemoryLocalStore::new()),
            connectivity,
        )
        .unwrap();
        (service, remote)
    }

    #[test]
    fn commands_refresh_status() {
        let connectivity = Arc::new(ManualConnectivity::new(false));
        let (service, _) = service(connectivity.clone());
        assert_eq!(service.current_status().health, HealthStatus::Offline);

        service
            .enqueue(MutationRequest::new("b1", "create_bookmark", json!({"title": "x"})))
            .unwrap();
        assert_eq!(service.current_status().job_queue_status.pending, 1);

        connectivity.set_online(true);
        service.force_sync_now().unwrap();
        let status = service.current_status();
        assert_eq!(status.health, HealthStatus::Healthy);
        assert_eq!(status.job_queue_status.completed, 1);
    }

    #[test]
    fn foreground_without_background_runs_inline() {
        let (service, remote) = service(Arc::new(ManualConnectivity::new(true)));
        service
            .enqueue(MutationRequest::new("b1", "create_bookmark", json!({})))
            .unwrap();

        service.notify_foreground();
        assert_eq!(remote.applied().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconnect_syncs_in_background() {
        let connectivity = Arc::new(ManualConnectivity::new(false));
        let (service, remote) = service(connectivity.clone());
        service.start(&Handle::current());

        service
            .enqueue(MutationRequest::new("t1", "create_tag", json!({"name": "fiction"})))
            .unwrap();
        let mut status = service.combined_status();

        connectivity.set_online(true);
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if status.borrow_and_update().job_queue_status.completed == 1 {
                    break;
                }
                if status.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(remote.applied().len(), 1);
        service.shutdown();
    }
}
