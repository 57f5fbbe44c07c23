//! # shelfsync storage
//!
//! Durable byte stores and the record journal that the mutation queue
//! persists its jobs into.
//!
//! Backends are **opaque byte stores**: they append, read back, sync and
//! atomically replace bytes. The [`Journal`] layers framed, checksummed
//! records on top of a backend and knows how to recover from a torn write at
//! the tail.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests; can be told to reject writes
//! - [`FileBackend`] - Persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use shelfsync_storage::{InMemoryBackend, Journal};
//!
//! let journal = Journal::new(Box::new(InMemoryBackend::new()), true);
//! journal.append(1, b"hello").unwrap();
//! let replay = journal.replay().unwrap();
//! assert_eq!(replay.records[0].payload, b"hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod journal;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use journal::{
    compute_crc32, Journal, JournalRecord, JournalReplay, JOURNAL_MAGIC, JOURNAL_VERSION,
    MAX_RECORD_SIZE,
};
pub use memory::InMemoryBackend;
