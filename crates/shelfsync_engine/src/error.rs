//! Error types for the sync engine.

use crate::remote::RemoteError;
use shelfsync_protocol::{JobId, JobStatus, ProtocolError};
use shelfsync_storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors raised by the queue, the orchestrator and the service.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The durable store failed. Fatal to the triggering call.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A record could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    /// The remote API failed.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// A mutation request failed validation.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// The mutation kind is not recognized.
    #[error("unrecognized mutation kind: {0:?}")]
    UnknownKind(String),

    /// No job with this id exists.
    #[error("job {0} not found")]
    JobNotFound(JobId),

    /// The job is not in a state that allows the transition.
    #[error("job {job_id} is {actual}, expected {expected}")]
    InvalidJobState {
        /// The job.
        job_id: JobId,
        /// Its current status.
        actual: JobStatus,
        /// The status the operation requires.
        expected: JobStatus,
    },

    /// Another job for the same entity is already processing.
    #[error("entity {entity_id:?} already has job {processing} in flight")]
    EntityBusy {
        /// The entity.
        entity_id: String,
        /// The job currently processing.
        processing: JobId,
    },

    /// Only pending jobs can be cancelled.
    #[error("job {job_id} cannot be cancelled while {status}")]
    NotCancellable {
        /// The job.
        job_id: JobId,
        /// Its current status.
        status: JobStatus,
    },

    /// The job has no outstanding conflict.
    #[error("no pending conflict for job {0}")]
    ConflictNotFound(JobId),

    /// Another open store holds the journal's lock file.
    #[error("journal is locked by another process: {}", .0.display())]
    Locked(PathBuf),
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnknownKind(kind) => SyncError::UnknownKind(kind),
            ProtocolError::InvalidRequest(msg) => SyncError::InvalidJob(msg),
            other => SyncError::Protocol(other),
        }
    }
}

impl SyncError {
    /// Returns true if this error came from the durable store.
    pub fn is_durability_failure(&self) -> bool {
        matches!(self, SyncError::Storage(_))
    }
}
