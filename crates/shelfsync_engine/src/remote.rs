//! Remote API abstraction.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shelfsync_protocol::{DeltaCursor, EntitySnapshot, EntityType, Job, MutationOp, RemoteDelta};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use thiserror::Error;

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Failures reported by a [`RemoteApi`] implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// Connection-level failure.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the call can be retried.
        retryable: bool,
    },

    /// The call exceeded its timeout.
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    /// The server failed (5xx).
    #[error("server error {status}: {message}")]
    Server {
        /// HTTP-like status code.
        status: u16,
        /// Error message.
        message: String,
    },

    /// The remote entity has moved on since the job's base version.
    #[error("version conflict")]
    VersionConflict {
        /// The server's current state, if the response carried it.
        server: Option<Box<EntitySnapshot>>,
    },

    /// The server refused the request permanently (4xx other than conflict).
    #[error("rejected with {status}: {message}")]
    Rejected {
        /// HTTP-like status code.
        status: u16,
        /// Error message.
        message: String,
    },
}

impl RemoteError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a version conflict carrying the server's state.
    pub fn conflict_with(server: EntitySnapshot) -> Self {
        Self::VersionConflict {
            server: Some(Box::new(server)),
        }
    }

    /// Returns true if the call can be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Transport { retryable, .. } => *retryable,
            RemoteError::Timeout(_) => true,
            RemoteError::Server { .. } => true,
            RemoteError::VersionConflict { .. } | RemoteError::Rejected { .. } => false,
        }
    }

    /// Returns true if this is a semantic version conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, RemoteError::VersionConflict { .. })
    }
}

/// Client for the authoritative remote store.
///
/// Implementations own transport, authentication and token refresh. Every
/// call takes a timeout; exceeding it must surface as
/// [`RemoteError::Timeout`].
pub trait RemoteApi: Send + Sync {
    /// Applies a job's mutation and returns the acknowledged entity state.
    fn apply(&self, job: &Job, timeout: Duration) -> RemoteResult<EntitySnapshot>;

    /// Lists changes made after `since`, in feed order, at most `limit`.
    ///
    /// With `after`, only changes positioned after that cursor are listed;
    /// pages are requested by passing back the previous page's cursor.
    fn changes_since(
        &self,
        since: Option<DateTime<Utc>>,
        after: Option<&DeltaCursor>,
        limit: u32,
        timeout: Duration,
    ) -> RemoteResult<RemoteDelta>;

    /// Fetches the server's current state of one entity.
    fn fetch_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        timeout: Duration,
    ) -> RemoteResult<Option<EntitySnapshot>>;
}

/// Counts of calls made against a [`MockRemote`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteCalls {
    /// `apply` calls.
    pub apply: u64,
    /// `changes_since` calls.
    pub changes_since: u64,
    /// `fetch_entity` calls.
    pub fetch_entity: u64,
}

impl RemoteCalls {
    /// Total number of network calls.
    pub fn total(&self) -> u64 {
        self.apply + self.changes_since + self.fetch_entity
    }
}

#[derive(Default)]
struct MockState {
    entities: BTreeMap<(EntityType, String), EntitySnapshot>,
    feed: Vec<EntitySnapshot>,
    scripted: VecDeque<RemoteError>,
    pull_failure: Option<RemoteError>,
    applied: Vec<Job>,
    calls: RemoteCalls,
    latency: Duration,
    apply_latency: Option<Duration>,
    server_time: Option<DateTime<Utc>>,
}

/// An in-memory remote store for testing.
///
/// Successful applies update the mock's entity table and bump versions.
/// Jobs carrying a base snapshot whose version is behind the table are
/// rejected with [`RemoteError::VersionConflict`]. Failures can be scripted
/// and are consumed one per `apply` call.
#[derive(Default)]
pub struct MockRemote {
    state: Mutex<MockState>,
}

impl MockRemote {
    /// Creates an empty mock remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a failure for the next `apply` call.
    pub fn script_failure(&self, error: RemoteError) {
        self.state.lock().scripted.push_back(error);
    }

    /// Queues the same failure for the next `count` `apply` calls.
    pub fn script_failures(&self, error: RemoteError, count: usize) {
        let mut state = self.state.lock();
        state
            .scripted
            .extend(std::iter::repeat(error).take(count));
    }

    /// Makes every delta pull fail until cleared with `None`.
    pub fn set_pull_failure(&self, error: Option<RemoteError>) {
        self.state.lock().pull_failure = error;
    }

    /// Simulates network latency; calls with a shorter timeout fail.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Overrides the simulated latency of `apply` calls only.
    pub fn set_apply_latency(&self, latency: Option<Duration>) {
        self.state.lock().apply_latency = latency;
    }

    /// Fixes the server clock reported with deltas.
    pub fn set_server_time(&self, time: DateTime<Utc>) {
        self.state.lock().server_time = Some(time);
    }

    /// Records a change made by another client: stores it and publishes it
    /// on the delta feed.
    pub fn push_remote_change(&self, snapshot: EntitySnapshot) {
        let mut state = self.state.lock();
        state.entities.insert(
            (snapshot.entity_type, snapshot.entity_id.clone()),
            snapshot.clone(),
        );
        state.feed.push(snapshot);
    }

    /// Seeds the entity table without publishing a change.
    pub fn put_entity(&self, snapshot: EntitySnapshot) {
        self.state
            .lock()
            .entities
            .insert((snapshot.entity_type, snapshot.entity_id.clone()), snapshot);
    }

    /// Returns the stored state of an entity.
    pub fn entity(&self, entity_type: EntityType, entity_id: &str) -> Option<EntitySnapshot> {
        self.state
            .lock()
            .entities
            .get(&(entity_type, entity_id.to_string()))
            .cloned()
    }

    /// Jobs applied successfully, in order.
    pub fn applied(&self) -> Vec<Job> {
        self.state.lock().applied.clone()
    }

    /// Call counters.
    pub fn calls(&self) -> RemoteCalls {
        self.state.lock().calls
    }

    fn check_latency(latency: Duration, timeout: Duration) -> RemoteResult<()> {
        if latency > timeout {
            return Err(RemoteError::Timeout(timeout));
        }
        Ok(())
    }
}

impl RemoteApi for MockRemote {
    fn apply(&self, job: &Job, timeout: Duration) -> RemoteResult<EntitySnapshot> {
        let mut state = self.state.lock();
        state.calls.apply += 1;
        Self::check_latency(state.apply_latency.unwrap_or(state.latency), timeout)?;

        if let Some(error) = state.scripted.pop_front() {
            return Err(error);
        }

        let key = (job.entity_type(), job.entity_id.clone());
        let current = state.entities.get(&key).cloned();

        if let (Some(current), Some(base)) = (&current, &job.base) {
            if current.version > base.version {
                return Err(RemoteError::conflict_with(current.clone()));
            }
        }

        let now = state.server_time.unwrap_or_else(Utc::now);
        let version = current.as_ref().map_or(0, |c| c.version) + 1;
        let mut next = current.unwrap_or_else(|| {
            EntitySnapshot::new(job.entity_type(), job.entity_id.clone(), now)
        });
        match job.kind.op {
            MutationOp::Delete => next.deleted = true,
            MutationOp::Create | MutationOp::Update => {
                next.deleted = false;
                next.fields.extend(job.intended_state().fields);
            }
        }
        next.version = version;
        next.updated_at = now;

        state.entities.insert(key, next.clone());
        state.applied.push(job.clone());
        Ok(next)
    }

    fn changes_since(
        &self,
        since: Option<DateTime<Utc>>,
        after: Option<&DeltaCursor>,
        limit: u32,
        timeout: Duration,
    ) -> RemoteResult<RemoteDelta> {
        let mut state = self.state.lock();
        state.calls.changes_since += 1;
        Self::check_latency(state.latency, timeout)?;

        if let Some(error) = &state.pull_failure {
            return Err(error.clone());
        }

        let mut newer: Vec<(DeltaCursor, &EntitySnapshot)> = state
            .feed
            .iter()
            .filter(|c| since.map_or(true, |s| c.updated_at > s))
            .map(|c| (DeltaCursor::of(c), c))
            .filter(|(cursor, _)| after.map_or(true, |a| cursor > a))
            .collect();
        newer.sort_by(|a, b| a.0.cmp(&b.0));

        let limit = limit.max(1) as usize;
        let has_more = newer.len() > limit;
        newer.truncate(limit);
        let next_cursor = newer.last().map(|(cursor, _)| cursor.clone());

        Ok(RemoteDelta {
            changes: newer.into_iter().map(|(_, c)| c.clone()).collect(),
            server_time: Some(state.server_time.unwrap_or_else(Utc::now)),
            has_more,
            next_cursor,
        })
    }

    fn fetch_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        timeout: Duration,
    ) -> RemoteResult<Option<EntitySnapshot>> {
        let mut state = self.state.lock();
        state.calls.fetch_entity += 1;
        Self::check_latency(state.latency, timeout)?;
        Ok(state
            .entities
            .get(&(entity_type, entity_id.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shelfsync_protocol::{JobId, JobKind};

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn job(id: u64, op: MutationOp, entity: &str) -> Job {
        Job::new(
            JobId(id),
            entity.to_string(),
            JobKind::new(op, EntityType::Bookmark),
            json!({"title": "Chapter 1"}),
            None,
            Utc::now(),
        )
    }

    #[test]
    fn retryable_errors() {
        assert!(RemoteError::transport_retryable("connection refused").is_retryable());
        assert!(!RemoteError::transport_fatal("bad certificate").is_retryable());
        assert!(RemoteError::Timeout(TIMEOUT).is_retryable());
        assert!(RemoteError::Server {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(!RemoteError::VersionConflict { server: None }.is_retryable());
        assert!(!RemoteError::Rejected {
            status: 422,
            message: "bad".into()
        }
        .is_retryable());
    }

    #[test]
    fn apply_bumps_versions() {
        let remote = MockRemote::new();
        let first = remote.apply(&job(1, MutationOp::Create, "b1"), TIMEOUT).unwrap();
        let second = remote.apply(&job(2, MutationOp::Update, "b1"), TIMEOUT).unwrap();

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(second.fields.get("title"), Some(&json!("Chapter 1")));
        assert_eq!(remote.calls().apply, 2);
        assert_eq!(remote.applied().len(), 2);
    }

    #[test]
    fn stale_base_is_a_conflict() {
        let remote = MockRemote::new();
        let t = Utc::now();
        remote.put_entity(EntitySnapshot::new(EntityType::Bookmark, "b1", t).with_version(3));

        let mut stale = job(1, MutationOp::Update, "b1");
        stale.base = Some(EntitySnapshot::new(EntityType::Bookmark, "b1", t).with_version(2));

        let err = remote.apply(&stale, TIMEOUT).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn scripted_failures_are_consumed_in_order() {
        let remote = MockRemote::new();
        remote.script_failures(RemoteError::transport_retryable("down"), 2);

        assert!(remote.apply(&job(1, MutationOp::Create, "b1"), TIMEOUT).is_err());
        assert!(remote.apply(&job(1, MutationOp::Create, "b1"), TIMEOUT).is_err());
        assert!(remote.apply(&job(1, MutationOp::Create, "b1"), TIMEOUT).is_ok());
    }

    #[test]
    fn latency_beyond_timeout_fails() {
        let remote = MockRemote::new();
        remote.set_latency(Duration::from_secs(5));

        let err = remote.apply(&job(1, MutationOp::Create, "b1"), TIMEOUT).unwrap_err();
        assert_eq!(err, RemoteError::Timeout(TIMEOUT));
    }

    #[test]
    fn changes_since_pages() {
        let remote = MockRemote::new();
        let t = Utc::now();
        for i in 0..5 {
            remote.push_remote_change(EntitySnapshot::new(
                EntityType::Tag,
                format!("t{i}"),
                t + chrono::Duration::seconds(i),
            ));
        }

        let page = remote.changes_since(None, None, 3, TIMEOUT).unwrap();
        assert_eq!(page.changes.len(), 3);
        assert!(page.has_more);

        let rest = remote
            .changes_since(None, page.next_cursor.as_ref(), 3, TIMEOUT)
            .unwrap();
        assert_eq!(rest.changes.len(), 2);
        assert!(!rest.has_more);
        assert_eq!(remote.calls().changes_since, 2);

        let since = remote
            .changes_since(Some(t + chrono::Duration::seconds(2)), None, 10, TIMEOUT)
            .unwrap();
        assert_eq!(since.changes.len(), 2);
    }

    #[test]
    fn cursor_resumes_inside_equal_timestamps() {
        let remote = MockRemote::new();
        let t = Utc::now();
        for id in ["t0", "t1", "t2"] {
            remote.push_remote_change(EntitySnapshot::new(EntityType::Tag, id, t));
        }

        let first = remote.changes_since(None, None, 2, TIMEOUT).unwrap();
        assert!(first.has_more);
        let second = remote
            .changes_since(None, first.next_cursor.as_ref(), 2, TIMEOUT)
            .unwrap();

        let ids: Vec<String> = first
            .changes
            .iter()
            .chain(&second.changes)
            .map(|c| c.entity_id.clone())
            .collect();
        assert_eq!(ids, ["t0", "t1", "t2"]);
        assert!(!second.has_more);
    }
}
