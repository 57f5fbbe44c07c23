//! Cancelable scheduled work and sync triggers.

use crate::error::SyncResult;
use crate::orchestrator::SyncTrigger;
use crate::queue::MutationQueue;
use parking_lot::Mutex;
use serde_json::Value;
use shelfsync_protocol::{EntityType, JobKind, MutationOp, MutationRequest};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

/// A spawned task that can be cancelled.
///
/// Dropping a `ScheduledTask` does not cancel it; call [`ScheduledTask::cancel`].
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Spawns `future` on `runtime`.
    pub fn spawn<F>(runtime: &Handle, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: runtime.spawn(future),
        }
    }

    /// Runs blocking `work` on the blocking pool after `delay`.
    pub fn after<W>(runtime: &Handle, delay: Duration, work: W) -> Self
    where
        W: FnOnce() + Send + 'static,
    {
        Self::spawn(runtime, async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tokio::task::spawn_blocking(work).await {
                error!(error = %e, "scheduled work panicked");
            }
        })
    }

    /// Cancels the task. Has no effect once it finished.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Returns true once the task ran to completion or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Runs the latest submission per key once submissions settle.
///
/// Submitting for a key cancels that key's previous, not yet started task.
pub struct Debouncer<K> {
    runtime: Handle,
    delay: Duration,
    tasks: Mutex<HashMap<K, ScheduledTask>>,
}

impl<K: Eq + Hash + Clone + Send + 'static> Debouncer<K> {
    /// Creates a debouncer that spawns on `runtime`.
    pub fn new(runtime: Handle, delay: Duration) -> Self {
        Self {
            runtime,
            delay,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Schedules `work` for `key`, replacing any earlier submission.
    pub fn submit<W>(&self, key: K, work: W)
    where
        W: FnOnce() + Send + 'static,
    {
        let task = ScheduledTask::after(&self.runtime, self.delay, work);
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, t| !t.is_finished());
        if let Some(previous) = tasks.insert(key, task) {
            previous.cancel();
        }
    }

    /// Cancels the pending submission for `key`. Returns true if one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        match self.tasks.lock().remove(key) {
            Some(task) => {
                let pending = !task.is_finished();
                task.cancel();
                pending
            }
            None => false,
        }
    }

    /// Cancels every pending submission.
    pub fn cancel_all(&self) {
        for (_, task) in self.tasks.lock().drain() {
            task.cancel();
        }
    }

    /// Number of submissions not yet run.
    pub fn pending(&self) -> usize {
        self.tasks.lock().values().filter(|t| !t.is_finished()).count()
    }
}

/// Coalesces rapid reading-progress updates into one queued job per document.
pub struct ReadingProgressDebouncer {
    queue: Arc<MutationQueue>,
    latest: Arc<Mutex<HashMap<String, Value>>>,
    debouncer: Debouncer<String>,
}

impl ReadingProgressDebouncer {
    /// Creates a debouncer that enqueues into `queue` after `delay` of quiet.
    pub fn new(queue: Arc<MutationQueue>, runtime: Handle, delay: Duration) -> Self {
        Self {
            queue,
            latest: Arc::new(Mutex::new(HashMap::new())),
            debouncer: Debouncer::new(runtime, delay),
        }
    }

    /// Records the reader's position in a document.
    pub fn record(&self, document_id: impl Into<String>, position: Value) {
        let document_id = document_id.into();
        self.latest.lock().insert(document_id.clone(), position);

        let queue = self.queue.clone();
        let latest = self.latest.clone();
        let key = document_id.clone();
        self.debouncer.submit(key, move || {
            let Some(position) = latest.lock().remove(&document_id) else {
                return;
            };
            if let Err(e) = queue.enqueue(progress_request(&document_id, position)) {
                error!(
                    document_id = %document_id,
                    error = %e,
                    "failed to enqueue reading progress"
                );
            }
        });
    }

    /// Enqueues every pending update now.
    ///
    /// # Errors
    ///
    /// Returns the first enqueue error; updates not yet enqueued are kept.
    pub fn flush(&self) -> SyncResult<usize> {
        self.debouncer.cancel_all();
        let pending: Vec<(String, Value)> = self.latest.lock().drain().collect();

        for (i, (document_id, position)) in pending.iter().enumerate() {
            if let Err(e) = self
                .queue
                .enqueue(progress_request(document_id, position.clone()))
            {
                let mut latest = self.latest.lock();
                for (id, pos) in pending[i..].iter().cloned() {
                    latest.entry(id).or_insert(pos);
                }
                return Err(e);
            }
        }
        let flushed = pending.len();
        debug!(flushed, "reading progress flushed");
        Ok(flushed)
    }

    /// Number of documents with an update not yet enqueued.
    pub fn pending(&self) -> usize {
        self.latest.lock().len()
    }
}

fn progress_request(document_id: &str, position: Value) -> MutationRequest {
    MutationRequest::typed(
        document_id,
        JobKind::new(MutationOp::Update, EntityType::ReadingProgress),
        position,
    )
}

/// Background tasks that start sync cycles.
///
/// Cycles run on the blocking pool through `run`; the orchestrator
/// coalesces overlapping cycles.
pub struct SyncTriggers {
    tasks: Vec<ScheduledTask>,
    foreground: Arc<Notify>,
}

impl SyncTriggers {
    /// Starts the triggers.
    ///
    /// - `interval`: periodic cycles, if set
    /// - `connectivity`: a cycle on every offline to online transition
    /// - [`SyncTriggers::notify_foreground`]: a cycle on foreground resume
    pub fn start<R>(
        runtime: &Handle,
        run: R,
        mut connectivity: watch::Receiver<bool>,
        interval: Option<Duration>,
    ) -> Self
    where
        R: Fn(SyncTrigger) + Send + Sync + 'static,
    {
        let run = Arc::new(run);
        let foreground = Arc::new(Notify::new());
        let mut tasks = Vec::new();

        if let Some(period) = interval {
            let run = run.clone();
            tasks.push(ScheduledTask::spawn(runtime, async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    run_blocking(&run, SyncTrigger::Periodic).await;
                }
            }));
        }

        {
            let run = run.clone();
            tasks.push(ScheduledTask::spawn(runtime, async move {
                let mut online = *connectivity.borrow_and_update();
                while connectivity.changed().await.is_ok() {
                    let now_online = *connectivity.borrow_and_update();
                    if now_online && !online {
                        run_blocking(&run, SyncTrigger::ConnectivityRestored).await;
                    }
                    online = now_online;
                }
            }));
        }

        {
            let notify = foreground.clone();
            tasks.push(ScheduledTask::spawn(runtime, async move {
                loop {
                    notify.notified().await;
                    run_blocking(&run, SyncTrigger::Foreground).await;
                }
            }));
        }

        Self { tasks, foreground }
    }

    /// Requests a cycle because the application returned to the foreground.
    pub fn notify_foreground(&self) {
        self.foreground.notify_one();
    }

    /// Stops every trigger.
    pub fn stop(&self) {
        for task in &self.tasks {
            task.cancel();
        }
    }
}

async fn run_blocking<R>(run: &Arc<R>, trigger: SyncTrigger)
where
    R: Fn(SyncTrigger) + Send + Sync + 'static,
{
    let run = run.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || run(trigger)).await {
        error!(trigger = trigger.as_str(), error = %e, "sync trigger panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn cancelled_task_never_runs() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let task = ScheduledTask::after(&Handle::current(), Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        task.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(task.is_finished());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn debouncer_runs_last_submission() {
        let debouncer = Debouncer::new(Handle::current(), Duration::from_millis(50));
        let seen = Arc::new(Mutex::new(Vec::new()));

        for value in 0..3 {
            let seen = seen.clone();
            debouncer.submit("doc", move || seen.lock().push(value));
        }
        assert_eq!(debouncer.pending(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*seen.lock(), vec![2]);
        assert_eq!(debouncer.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reading_progress_is_coalesced() {
        let queue = Arc::new(MutationQueue::in_memory(RetryConfig::default()).unwrap());
        let debouncer = ReadingProgressDebouncer::new(
            queue.clone(),
            Handle::current(),
            Duration::from_millis(50),
        );

        for page in 1..=10 {
            debouncer.record("doc-1", json!({ "page": page }));
        }
        debouncer.record("doc-2", json!({ "page": 3 }));

        tokio::time::sleep(Duration::from_millis(300)).await;

        let jobs = queue.jobs();
        assert_eq!(jobs.len(), 2);
        let doc1 = jobs.iter().find(|j| j.entity_id == "doc-1").unwrap();
        assert_eq!(doc1.payload, json!({ "page": 10 }));
        assert_eq!(doc1.kind.to_string(), "update_reading_progress");
    }

    #[tokio::test]
    async fn flush_enqueues_immediately() {
        let queue = Arc::new(MutationQueue::in_memory(RetryConfig::default()).unwrap());
        let debouncer = ReadingProgressDebouncer::new(
            queue.clone(),
            Handle::current(),
            Duration::from_secs(60),
        );

        debouncer.record("doc-1", json!({ "page": 4 }));
        assert_eq!(debouncer.pending(), 1);
        assert_eq!(debouncer.flush().unwrap(), 1);
        assert_eq!(debouncer.pending(), 0);
        assert_eq!(queue.jobs().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connectivity_restore_triggers_cycle() {
        let (tx, rx) = watch::channel(false);
        let fired = Arc::new(Mutex::new(Vec::new()));
        let log = fired.clone();

        let triggers = SyncTriggers::start(
            &Handle::current(),
            move |trigger| log.lock().push(trigger),
            rx,
            None,
        );

        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        triggers.notify_foreground();
        tokio::time::sleep(Duration::from_millis(100)).await;
        triggers.stop();

        assert_eq!(
            *fired.lock(),
            vec![SyncTrigger::ConnectivityRestored, SyncTrigger::Foreground]
        );
    }
}
