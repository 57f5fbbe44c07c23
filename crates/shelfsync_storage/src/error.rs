//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// A journal record before the tail failed validation.
    #[error("journal corrupted at offset {offset}: {reason}")]
    Corrupted {
        /// Offset of the offending record.
        offset: u64,
        /// What was wrong with it.
        reason: String,
    },

    /// The backend refused the write.
    #[error("write rejected: {0}")]
    WriteRejected(String),

    /// A record is too large to be framed.
    #[error("record payload too large: {0} bytes")]
    RecordTooLarge(usize),
}

impl StorageError {
    /// Creates a corruption error.
    pub fn corrupted(offset: u64, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            reason: reason.into(),
        }
    }
}
