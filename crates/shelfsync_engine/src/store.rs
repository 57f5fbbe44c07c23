//! Durable job store.
//!
//! Jobs are persisted as records in a [`Journal`]:
//!
//! | type | record | payload (CBOR) |
//! |------|--------|----------------|
//! | 1 | put job | full [`Job`] after every state change |
//! | 2 | remove job | [`JobId`] |
//! | 3 | bookmark | last-sync timestamp |
//! | 4 | id floor | next job id, written on compaction |
//!
//! Replay folds the records in order; the last record for a job wins.
//!
//! A store opened from a directory holds an advisory lock file next to the
//! journal (`<journal>.lock`) for as long as it lives, so a second writer
//! cannot open the same journal. Read-only opens take no lock.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::Serialize;
use shelfsync_protocol::{from_cbor, to_cbor, Job, JobId, ProtocolResult};
use shelfsync_storage::{
    FileBackend, InMemoryBackend, Journal, JournalReplay, StorageBackend, StorageError,
};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const RECORD_PUT_JOB: u8 = 1;
const RECORD_REMOVE_JOB: u8 = 2;
const RECORD_BOOKMARK: u8 = 3;
const RECORD_ID_FLOOR: u8 = 4;

/// Default journal file name inside a data directory.
pub const DEFAULT_JOURNAL_FILE: &str = "jobs.sjrn";

/// Configuration for the job store.
#[derive(Debug, Clone)]
pub struct JobStoreConfig {
    /// Sync every record before the write returns.
    pub sync_on_write: bool,
    /// Journal file name used by [`JobStore::open_dir`].
    pub file_name: String,
}

impl JobStoreConfig {
    /// Creates a durable configuration.
    pub fn new() -> Self {
        Self {
            sync_on_write: true,
            file_name: DEFAULT_JOURNAL_FILE.to_string(),
        }
    }

    /// Enables or disables syncing on every write.
    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    /// Sets the journal file name.
    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = name.into();
        self
    }

    /// Path of the journal inside `dir`.
    pub fn journal_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.file_name)
    }

    /// Path of the lock file guarding the journal inside `dir`.
    pub fn lock_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.lock", self.file_name))
    }
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// One decoded journal record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum StoreRecord {
    /// A job's current state.
    PutJob {
        /// The job.
        job: Box<Job>,
    },
    /// A job was removed.
    RemoveJob {
        /// The removed job.
        job_id: JobId,
    },
    /// The last successful sync.
    Bookmark {
        /// Sync timestamp.
        last_sync: DateTime<Utc>,
    },
    /// Lower bound for the next assigned id.
    IdFloor {
        /// Next id.
        next_id: u64,
    },
}

impl StoreRecord {
    fn decode(offset: u64, record_type: u8, payload: &[u8]) -> SyncResult<Self> {
        let record = match record_type {
            RECORD_PUT_JOB => StoreRecord::PutJob {
                job: Box::new(from_cbor(payload)?),
            },
            RECORD_REMOVE_JOB => StoreRecord::RemoveJob {
                job_id: from_cbor(payload)?,
            },
            RECORD_BOOKMARK => StoreRecord::Bookmark {
                last_sync: from_cbor(payload)?,
            },
            RECORD_ID_FLOOR => StoreRecord::IdFloor {
                next_id: from_cbor(payload)?,
            },
            other => {
                return Err(
                    StorageError::corrupted(offset, format!("unknown record type {other}")).into(),
                )
            }
        };
        Ok(record)
    }
}

/// State rebuilt by replaying the journal.
#[derive(Debug, Default)]
pub struct LoadedState {
    /// Live jobs by id.
    pub jobs: BTreeMap<JobId, Job>,
    /// Last recorded sync.
    pub last_sync: Option<DateTime<Utc>>,
    /// Next id to assign; above every id ever recorded.
    pub next_id: u64,
    /// Bytes dropped from a torn tail.
    pub truncated_bytes: u64,
}

/// Journal-backed persistence for jobs and the sync bookmark.
pub struct JobStore {
    journal: Journal,
    /// Held for the store's lifetime when opened from a directory.
    _lock: Option<File>,
}

impl JobStore {
    /// Opens a store over `backend` and replays it.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal is corrupted before its tail or a
    /// record cannot be decoded.
    pub fn open(
        backend: Box<dyn StorageBackend>,
        config: &JobStoreConfig,
    ) -> SyncResult<(Self, LoadedState)> {
        Self::open_locked(backend, config, None)
    }

    /// Opens a store in `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Locked`] if another store already holds the
    /// journal, or an error if the file cannot be opened or replayed.
    pub fn open_dir(dir: &Path, config: &JobStoreConfig) -> SyncResult<(Self, LoadedState)> {
        std::fs::create_dir_all(dir).map_err(StorageError::from)?;
        let lock = acquire_lock(&config.lock_path(dir))?;
        let backend = FileBackend::open(&config.journal_path(dir))?;
        Self::open_locked(Box::new(backend), config, Some(lock))
    }

    /// Opens the store in `dir` for inspection.
    ///
    /// The journal is read once into memory and nothing is ever written
    /// back: no lock is taken, a torn tail is reported but kept, and every
    /// write fails. This works while another process owns the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal file cannot be read or is corrupted.
    pub fn open_read_only(
        dir: &Path,
        config: &JobStoreConfig,
    ) -> SyncResult<(Self, LoadedState)> {
        let bytes = std::fs::read(config.journal_path(dir)).map_err(StorageError::from)?;
        let backend = InMemoryBackend::with_data(bytes);
        backend.set_reject_writes(true);

        let store = Self {
            journal: Journal::new(Box::new(backend), false),
            _lock: None,
        };
        let state = fold(store.journal.scan()?)?;
        Ok((store, state))
    }

    fn open_locked(
        backend: Box<dyn StorageBackend>,
        config: &JobStoreConfig,
        lock: Option<File>,
    ) -> SyncResult<(Self, LoadedState)> {
        let store = Self {
            journal: Journal::new(backend, config.sync_on_write),
            _lock: lock,
        };
        let state = fold(store.journal.replay()?)?;
        Ok((store, state))
    }

    /// Opens an empty in-memory store.
    pub fn in_memory() -> SyncResult<(Self, LoadedState)> {
        Self::open(Box::new(InMemoryBackend::new()), &JobStoreConfig::default())
    }

    /// Decodes every intact record in append order without repairing the
    /// journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read or is corrupted.
    pub fn records(&self) -> SyncResult<Vec<(u64, StoreRecord)>> {
        self.journal
            .scan()?
            .records
            .into_iter()
            .map(|r| -> SyncResult<(u64, StoreRecord)> {
                Ok((r.offset, StoreRecord::decode(r.offset, r.record_type, &r.payload)?))
            })
            .collect()
    }

    /// Persists a job's current state.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is not durably written.
    pub fn put_job(&self, job: &Job) -> SyncResult<()> {
        self.put_jobs(std::slice::from_ref(job))
    }

    /// Persists several jobs with one journal write; none is written if the
    /// write fails.
    ///
    /// # Errors
    ///
    /// Returns an error if the records are not durably written.
    pub fn put_jobs(&self, jobs: &[Job]) -> SyncResult<()> {
        let encoded = jobs
            .iter()
            .map(to_cbor)
            .collect::<ProtocolResult<Vec<Vec<u8>>>>()?;
        let offset = self
            .journal
            .append_batch(encoded.iter().map(|p| (RECORD_PUT_JOB, p.as_slice())))?;
        for job in jobs {
            debug!(job_id = %job.id, status = %job.status, offset, "job persisted");
        }
        Ok(())
    }

    /// Persists a job removal.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is not durably written.
    pub fn remove_job(&self, job_id: JobId) -> SyncResult<()> {
        self.journal.append(RECORD_REMOVE_JOB, &to_cbor(&job_id)?)?;
        Ok(())
    }

    /// Persists the last-sync bookmark.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is not durably written.
    pub fn set_last_sync(&self, at: DateTime<Utc>) -> SyncResult<()> {
        self.journal.append(RECORD_BOOKMARK, &to_cbor(&at)?)?;
        Ok(())
    }

    /// Rewrites the journal so it holds only the given live state.
    ///
    /// # Errors
    ///
    /// Returns an error if the rewrite fails; the old journal is then intact.
    pub fn compact<'a>(
        &self,
        jobs: impl IntoIterator<Item = &'a Job>,
        last_sync: Option<DateTime<Utc>>,
        next_id: u64,
    ) -> SyncResult<()> {
        let mut encoded: Vec<(u8, Vec<u8>)> = vec![(RECORD_ID_FLOOR, to_cbor(&next_id)?)];
        if let Some(at) = last_sync {
            encoded.push((RECORD_BOOKMARK, to_cbor(&at)?));
        }
        for job in jobs {
            encoded.push((RECORD_PUT_JOB, to_cbor(job)?));
        }

        let before = self.journal.size()?;
        self.journal
            .rewrite(encoded.iter().map(|(t, p)| (*t, p.as_slice())))?;
        info!(before, after = self.journal.size()?, "job journal compacted");
        Ok(())
    }

    /// Journal size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn size(&self) -> SyncResult<u64> {
        Ok(self.journal.size()?)
    }
}

/// Folds replayed records into the live state; the last record for a job
/// wins.
fn fold(replay: JournalReplay) -> SyncResult<LoadedState> {
    let mut state = LoadedState {
        truncated_bytes: replay.truncated_bytes,
        next_id: 1,
        ..LoadedState::default()
    };

    for record in replay.records {
        match StoreRecord::decode(record.offset, record.record_type, &record.payload)? {
            StoreRecord::PutJob { job } => {
                state.next_id = state.next_id.max(job.id.0 + 1);
                state.jobs.insert(job.id, *job);
            }
            StoreRecord::RemoveJob { job_id } => {
                state.next_id = state.next_id.max(job_id.0 + 1);
                state.jobs.remove(&job_id);
            }
            StoreRecord::Bookmark { last_sync } => state.last_sync = Some(last_sync),
            StoreRecord::IdFloor { next_id } => state.next_id = state.next_id.max(next_id),
        }
    }

    info!(
        jobs = state.jobs.len(),
        next_id = state.next_id,
        truncated = state.truncated_bytes,
        "job store loaded"
    );
    Ok(state)
}

/// Takes the advisory lock guarding a journal.
fn acquire_lock(path: &Path) -> SyncResult<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(StorageError::from)?;

    if file.try_lock_exclusive().is_err() {
        return Err(SyncError::Locked(path.to_path_buf()));
    }
    Ok(file)
}
