//! In-memory storage backend for tests.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An in-memory storage backend.
///
/// Clones share the same bytes, which lets a test "restart" a component by
/// building a new one over a clone of the old backend. Writes can be made to
/// fail on demand to exercise durability error paths.
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
    reject_writes: Arc<AtomicBool>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend holding pre-existing bytes.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
            reject_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a copy of all bytes in the backend.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Makes every subsequent write fail (or succeed again).
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.reject_writes.load(Ordering::SeqCst) {
            Err(StorageError::WriteRejected(
                "in-memory backend is rejecting writes".into(),
            ))
        } else {
            Ok(())
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let start = offset as usize;
        let end = start.saturating_add(len);

        if offset > size || end > data.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(data[start..end].to_vec())
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        self.check_writable()?;
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.check_writable()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.check_writable()?;
        let mut data = self.data.write();
        if new_size > data.len() as u64 {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "truncate beyond end",
            )));
        }
        data.truncate(new_size as usize);
        Ok(())
    }

    fn replace(&mut self, new_data: &[u8]) -> StorageResult<()> {
        self.check_writable()?;
        *self.data.write() = new_data.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_bytes() {
        let mut backend = InMemoryBackend::new();
        let view = backend.clone();

        backend.append(b"abc").unwrap();
        assert_eq!(view.data(), b"abc");
    }

    #[test]
    fn rejected_writes_leave_data_untouched() {
        let mut backend = InMemoryBackend::with_data(b"keep".to_vec());
        backend.set_reject_writes(true);

        assert!(matches!(
            backend.append(b"x"),
            Err(StorageError::WriteRejected(_))
        ));
        assert!(backend.replace(b"gone").is_err());
        assert!(backend.sync().is_err());
        assert_eq!(backend.data(), b"keep");

        backend.set_reject_writes(false);
        assert_eq!(backend.append(b"!").unwrap(), 4);
    }

    #[test]
    fn read_past_end() {
        let backend = InMemoryBackend::with_data(vec![1, 2, 3]);
        assert!(backend.read_at(2, 5).is_err());
        assert_eq!(backend.read_at(1, 2).unwrap(), vec![2, 3]);
    }
}
