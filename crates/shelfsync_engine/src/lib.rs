//! # shelfsync engine
//!
//! Offline-first synchronization for a reading-library client.
//!
//! Local mutations are captured as durable [`Job`](shelfsync_protocol::Job)s
//! in a [`MutationQueue`] backed by a journal. A [`SyncOrchestrator`] cycle
//! pulls remote changes, drains eligible jobs against a [`RemoteApi`] and
//! records conflicts for the [`ConflictResolver`]. [`SyncService`] wires the
//! pieces together and publishes a [`CombinedSyncStatus`].
//!
//! ## Guarantees
//!
//! - A job is acknowledged to the caller only after it is durable
//! - Jobs for one entity are pushed in creation order
//! - A cycle with nothing to do makes no remote calls
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use shelfsync_engine::{
//!     ManualConnectivity, MemoryLocalStore, MockRemote, MutationQueue, RetryConfig,
//!     SyncConfig, SyncService,
//! };
//! use shelfsync_protocol::MutationRequest;
//!
//! let queue = Arc::new(MutationQueue::in_memory(RetryConfig::default()).unwrap());
//! let service = SyncService::new(
//!     SyncConfig::default(),
//!     queue,
//!     Arc::new(MockRemote::new()),
//!     Arc::new(MemoryLocalStore::new()),
//!     Arc::new(ManualConnectivity::new(true)),
//! );
//!
//! service
//!     .enqueue(MutationRequest::new("b1", "create_bookmark", json!({"page": 12})))
//!     .unwrap();
//! let report = service.force_sync_now().unwrap();
//! assert_eq!(report.completed, 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connectivity;
mod error;
mod local;
mod observable;
mod orchestrator;
mod progress;
mod queue;
mod remote;
mod resolver;
mod scheduler;
mod service;
mod status;
mod store;

pub use config::{RetryConfig, SyncConfig};
pub use connectivity::{ConnectivityMonitor, ManualConnectivity};
pub use error::{SyncError, SyncResult};
pub use local::{LocalStore, MemoryLocalStore};
pub use observable::Observable;
pub use orchestrator::{CycleOutcome, CycleReport, SyncOrchestrator, SyncTrigger};
pub use progress::{SyncProgress, SyncStatus};
pub use queue::{JobQueueStatus, MutationQueue};
pub use remote::{MockRemote, RemoteApi, RemoteCalls, RemoteError, RemoteResult};
pub use resolver::{ConflictResolver, ResolutionOutcome};
pub use scheduler::{Debouncer, ReadingProgressDebouncer, ScheduledTask, SyncTriggers};
pub use service::SyncService;
pub use status::{CombinedSyncStatus, HealthStatus, StatusAggregator};
pub use store::{JobStore, JobStoreConfig, LoadedState, StoreRecord, DEFAULT_JOURNAL_FILE};
