//! Append-only record journal.
//!
//! Every record is framed as:
//!
//! ```text
//! magic "SJRN" (4) | version u16 (2) | record type u8 (1) | length u32 (4) | payload | crc32 (4)
//! ```
//!
//! All integers are little-endian; the CRC covers every byte before it.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Magic bytes identifying a journal record.
pub const JOURNAL_MAGIC: [u8; 4] = *b"SJRN";

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 1;

/// Largest payload a single record may carry.
///
/// A header announcing more than this is treated as damaged rather than as
/// a record still being written.
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

const HEADER_SIZE: usize = 11;
const CRC_SIZE: usize = 4;

/// A decoded journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    /// Offset of the record in the backend.
    pub offset: u64,
    /// Caller-defined record type.
    pub record_type: u8,
    /// Record payload.
    pub payload: Vec<u8>,
}

/// Result of replaying a journal.
#[derive(Debug, Default)]
pub struct JournalReplay {
    /// Intact records in append order.
    pub records: Vec<JournalRecord>,
    /// Bytes dropped from a torn tail, if any.
    pub truncated_bytes: u64,
}

/// A checksummed, append-only journal over a [`StorageBackend`].
pub struct Journal {
    backend: Mutex<Box<dyn StorageBackend>>,
    sync_on_write: bool,
}

impl Journal {
    /// Creates a journal over `backend`.
    ///
    /// With `sync_on_write`, every append is synced before it returns.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_write: bool) -> Self {
        Self {
            backend: Mutex::new(backend),
            sync_on_write,
        }
    }

    /// Frames a record without writing it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::RecordTooLarge`] if the payload is larger
    /// than [`MAX_RECORD_SIZE`].
    pub fn frame(record_type: u8, payload: &[u8]) -> StorageResult<Vec<u8>> {
        if payload.len() > MAX_RECORD_SIZE {
            return Err(StorageError::RecordTooLarge(payload.len()));
        }
        let len =
            u32::try_from(payload.len()).map_err(|_| StorageError::RecordTooLarge(payload.len()))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&JOURNAL_MAGIC);
        data.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        data.push(record_type);
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(payload);

        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    /// Appends one record and returns its offset.
    ///
    /// The record is written with a single backend append, so a crash can
    /// only ever leave a torn record at the tail.
    ///
    /// # Errors
    ///
    /// Returns an error if framing, writing or syncing fails. A failed sync
    /// means the record must be treated as not persisted.
    pub fn append(&self, record_type: u8, payload: &[u8]) -> StorageResult<u64> {
        let data = Self::frame(record_type, payload)?;

        let mut backend = self.backend.lock();
        let offset = backend.append(&data)?;
        if self.sync_on_write {
            backend.sync()?;
        }
        Ok(offset)
    }

    /// Appends several records with a single backend write and returns the
    /// offset of the first.
    ///
    /// Either every record is written or, on error, none is. A crash can
    /// still tear the tail, in which case replay keeps a prefix of the batch.
    ///
    /// # Errors
    ///
    /// Returns an error if framing, writing or syncing fails.
    pub fn append_batch<'a, I>(&self, records: I) -> StorageResult<u64>
    where
        I: IntoIterator<Item = (u8, &'a [u8])>,
    {
        let mut data = Vec::new();
        for (record_type, payload) in records {
            data.extend_from_slice(&Self::frame(record_type, payload)?);
        }

        let mut backend = self.backend.lock();
        let offset = backend.append(&data)?;
        if self.sync_on_write {
            backend.sync()?;
        }
        Ok(offset)
    }

    /// Reads every intact record, dropping a torn tail.
    ///
    /// A damaged region is only treated as a torn tail when no intact record
    /// follows it; anything else is reported rather than truncated.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupted`] if a record that is followed by
    /// more data fails validation; that cannot be explained by a crash.
    pub fn replay(&self) -> StorageResult<JournalReplay> {
        let mut backend = self.backend.lock();
        let bytes = backend.read_all()?;
        let (records, valid_end) = scan_records(&bytes)?;

        let mut replay = JournalReplay {
            records,
            truncated_bytes: 0,
        };
        if valid_end < bytes.len() {
            let dropped = (bytes.len() - valid_end) as u64;
            warn!(offset = valid_end, dropped, "truncating incomplete journal tail");
            backend.truncate(valid_end as u64)?;
            backend.sync()?;
            replay.truncated_bytes = dropped;
        }

        debug!(records = replay.records.len(), "journal replayed");
        Ok(replay)
    }

    /// Reads every intact record without repairing anything.
    ///
    /// A torn tail is reported in `truncated_bytes` but left in place, so
    /// this is safe to run against a journal another process is appending
    /// to.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupted`] under the same conditions as
    /// [`Journal::replay`].
    pub fn scan(&self) -> StorageResult<JournalReplay> {
        let bytes = self.backend.lock().read_all()?;
        let (records, valid_end) = scan_records(&bytes)?;
        Ok(JournalReplay {
            records,
            truncated_bytes: (bytes.len() - valid_end) as u64,
        })
    }

    /// Atomically rewrites the journal so it holds exactly `records`.
    ///
    /// # Errors
    ///
    /// Returns an error if framing or the backend replace fails; the
    /// previous contents are then still in place.
    pub fn rewrite<'a, I>(&self, records: I) -> StorageResult<()>
    where
        I: IntoIterator<Item = (u8, &'a [u8])>,
    {
        let mut data = Vec::new();
        for (record_type, payload) in records {
            data.extend_from_slice(&Self::frame(record_type, payload)?);
        }
        self.backend.lock().replace(&data)
    }

    /// Returns the journal size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn size(&self) -> StorageResult<u64> {
        self.backend.lock().size()
    }

    /// Forces all appended records to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> StorageResult<()> {
        self.backend.lock().sync()
    }
}

enum ParseFailure {
    Incomplete,
    Invalid { reason: String, end: usize },
}

impl ParseFailure {
    fn reason(&self) -> &str {
        match self {
            ParseFailure::Incomplete => "incomplete record",
            ParseFailure::Invalid { reason, .. } => reason,
        }
    }
}

/// Parses records from the start of `bytes`.
///
/// Returns the intact records and the offset where they end. Everything past
/// that offset is a torn tail.
fn scan_records(bytes: &[u8]) -> StorageResult<(Vec<JournalRecord>, usize)> {
    let mut records = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let failure = match parse_record(bytes, pos) {
            Ok((record_type, payload, next)) => {
                records.push(JournalRecord {
                    offset: pos as u64,
                    record_type,
                    payload,
                });
                pos = next;
                continue;
            }
            Err(failure) => failure,
        };

        if let ParseFailure::Invalid { reason, end } = &failure {
            if *end < bytes.len() {
                return Err(StorageError::corrupted(pos as u64, reason.clone()));
            }
        }
        if let Some(intact) = next_intact_record(bytes, pos + 1) {
            return Err(StorageError::corrupted(
                pos as u64,
                format!("{}; intact record follows at offset {intact}", failure.reason()),
            ));
        }
        warn!(offset = pos, reason = failure.reason(), "dropping torn journal tail");
        break;
    }

    Ok((records, pos))
}

/// Finds the first offset at or after `from` holding a record that parses
/// and passes its checksum.
fn next_intact_record(bytes: &[u8], from: usize) -> Option<usize> {
    let mut pos = from;
    while pos + HEADER_SIZE <= bytes.len() {
        let found = bytes[pos..]
            .windows(JOURNAL_MAGIC.len())
            .position(|window| window == JOURNAL_MAGIC)?;
        pos += found;
        if parse_record(bytes, pos).is_ok() {
            return Some(pos);
        }
        pos += 1;
    }
    None
}

fn parse_record(bytes: &[u8], pos: usize) -> Result<(u8, Vec<u8>, usize), ParseFailure> {
    let header_end = pos + HEADER_SIZE;
    if header_end > bytes.len() {
        return Err(ParseFailure::Incomplete);
    }

    let header = &bytes[pos..header_end];
    if header[0..4] != JOURNAL_MAGIC {
        return Err(ParseFailure::Invalid {
            reason: "bad magic".into(),
            end: header_end,
        });
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    let record_type = header[6];
    let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
    if len > MAX_RECORD_SIZE {
        return Err(ParseFailure::Invalid {
            reason: format!("record length {len} exceeds limit"),
            end: bytes.len(),
        });
    }

    let payload_end = header_end.saturating_add(len);
    let record_end = payload_end.saturating_add(CRC_SIZE);
    if record_end > bytes.len() {
        return Err(ParseFailure::Incomplete);
    }

    let stored = u32::from_le_bytes([
        bytes[payload_end],
        bytes[payload_end + 1],
        bytes[payload_end + 2],
        bytes[payload_end + 3],
    ]);
    if compute_crc32(&bytes[pos..payload_end]) != stored {
        return Err(ParseFailure::Invalid {
            reason: "checksum mismatch".into(),
            end: record_end,
        });
    }

    if version != JOURNAL_VERSION {
        return Err(ParseFailure::Invalid {
            reason: format!("unsupported journal version {version}"),
            end: record_end,
        });
    }

    Ok((record_type, bytes[header_end..payload_end].to_vec(), record_end))
}

const CRC32_TABLE: [u32; 256] = build_crc32_table();

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Computes the IEEE CRC32 of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    !data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        (crc >> 8) ^ CRC32_TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBackend;
    use proptest::prelude::*;

    fn journal_over(backend: &InMemoryBackend) -> Journal {
        Journal::new(Box::new(backend.clone()), true)
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn append_then_replay() {
        let backend = InMemoryBackend::new();
        let journal = journal_over(&backend);

        journal.append(1, b"first").unwrap();
        journal.append(2, b"second").unwrap();

        let replay = journal_over(&backend).replay().unwrap();
        assert_eq!(replay.records.len(), 2);
        assert_eq!(replay.records[0].record_type, 1);
        assert_eq!(replay.records[1].payload, b"second");
        assert_eq!(replay.truncated_bytes, 0);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let backend = InMemoryBackend::new();
        let journal = journal_over(&backend);
        journal.append(1, b"complete").unwrap();
        let good_len = backend.data().len();

        let framed = Journal::frame(1, b"half written").unwrap();
        let mut raw = backend.clone();
        raw.append(&framed[..framed.len() - 3]).unwrap();

        let replay = journal_over(&backend).replay().unwrap();
        assert_eq!(replay.records.len(), 1);
        assert!(replay.truncated_bytes > 0);
        assert_eq!(backend.data().len(), good_len);
    }

    #[test]
    fn corrupt_tail_checksum_is_dropped() {
        let backend = InMemoryBackend::new();
        let journal = journal_over(&backend);
        journal.append(1, b"ok").unwrap();

        let mut framed = Journal::frame(1, b"flipped").unwrap();
        let last = framed.len() - 1;
        framed[last] ^= 0xFF;
        let mut raw = backend.clone();
        raw.append(&framed).unwrap();

        let replay = journal_over(&backend).replay().unwrap();
        assert_eq!(replay.records.len(), 1);
    }

    #[test]
    fn corruption_before_tail_is_an_error() {
        let backend = InMemoryBackend::new();
        let journal = journal_over(&backend);
        journal.append(1, b"one").unwrap();
        journal.append(1, b"two").unwrap();

        let mut bytes = backend.data();
        bytes[HEADER_SIZE] ^= 0xFF;
        let damaged = InMemoryBackend::with_data(bytes);

        let result = journal_over(&damaged).replay();
        assert!(matches!(result, Err(StorageError::Corrupted { offset: 0, .. })));
    }

    #[test]
    fn damaged_length_with_intact_records_after_is_an_error() {
        let backend = InMemoryBackend::new();
        let journal = journal_over(&backend);
        for payload in [&b"first"[..], b"second", b"third"] {
            journal.append(1, payload).unwrap();
        }

        let mut bytes = backend.data();
        bytes[10] = 0x7f;
        let damaged = InMemoryBackend::with_data(bytes.clone());

        let result = journal_over(&damaged).replay();
        assert!(matches!(result, Err(StorageError::Corrupted { offset: 0, .. })));
        assert_eq!(damaged.data(), bytes);
    }

    #[test]
    fn oversized_length_at_tail_is_dropped() {
        let backend = InMemoryBackend::new();
        let journal = journal_over(&backend);
        journal.append(1, b"kept").unwrap();
        let good_len = backend.data().len();

        let mut framed = Journal::frame(1, b"lost").unwrap();
        framed[10] = 0xff;
        let mut raw = backend.clone();
        raw.append(&framed).unwrap();

        let replay = journal_over(&backend).replay().unwrap();
        assert_eq!(replay.records.len(), 1);
        assert_eq!(backend.data().len(), good_len);
    }

    #[test]
    fn scan_leaves_torn_tail_in_place() {
        let backend = InMemoryBackend::new();
        let journal = journal_over(&backend);
        journal.append(1, b"complete").unwrap();

        let framed = Journal::frame(1, b"in flight").unwrap();
        let mut raw = backend.clone();
        raw.append(&framed[..5]).unwrap();
        let before = backend.data();

        let scanned = journal_over(&backend).scan().unwrap();
        assert_eq!(scanned.records.len(), 1);
        assert_eq!(scanned.truncated_bytes, 5);
        assert_eq!(backend.data(), before);
    }

    #[test]
    fn oversized_payload_is_refused() {
        let payload = vec![0u8; MAX_RECORD_SIZE + 1];
        assert!(matches!(
            Journal::frame(1, &payload),
            Err(StorageError::RecordTooLarge(_))
        ));
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let backend = InMemoryBackend::new();
        let journal = journal_over(&backend);
        journal.append(1, b"before").unwrap();

        backend.set_reject_writes(true);
        assert!(journal
            .append_batch(vec![(1u8, &b"a"[..]), (2u8, &b"b"[..])])
            .is_err());
        backend.set_reject_writes(false);
        assert_eq!(journal.replay().unwrap().records.len(), 1);

        journal
            .append_batch(vec![(1u8, &b"a"[..]), (2u8, &b"b"[..])])
            .unwrap();
        let types: Vec<u8> = journal
            .replay()
            .unwrap()
            .records
            .iter()
            .map(|r| r.record_type)
            .collect();
        assert_eq!(types, vec![1, 1, 2]);
    }

    #[test]
    fn rewrite_replaces_contents() {
        let backend = InMemoryBackend::new();
        let journal = journal_over(&backend);
        for i in 0..5u8 {
            journal.append(1, &[i]).unwrap();
        }

        journal.rewrite(vec![(3u8, &b"only"[..])]).unwrap();

        let replay = journal.replay().unwrap();
        assert_eq!(replay.records.len(), 1);
        assert_eq!(replay.records[0].record_type, 3);
    }

    #[test]
    fn failed_append_reports_error() {
        let backend = InMemoryBackend::new();
        let journal = journal_over(&backend);
        backend.set_reject_writes(true);

        assert!(journal.append(1, b"lost").is_err());
        backend.set_reject_writes(false);
        assert!(journal.replay().unwrap().records.is_empty());
    }

    proptest! {
        #[test]
        fn any_prefix_replays_to_whole_records(
            payloads in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..64),
                1..8,
            ),
            cut in 0usize..1024,
        ) {
            let backend = InMemoryBackend::new();
            let journal = journal_over(&backend);
            for p in &payloads {
                journal.append(7, p).unwrap();
            }

            let bytes = backend.data();
            let cut = cut.min(bytes.len());
            let prefix = InMemoryBackend::with_data(bytes[..cut].to_vec());
            let replay = journal_over(&prefix).replay().unwrap();

            prop_assert!(replay.records.len() <= payloads.len());
            for (record, payload) in replay.records.iter().zip(&payloads) {
                prop_assert_eq!(&record.payload, payload);
            }
        }
    }
}
