//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Sentinel meaning "no append failure is armed".
const NOT_ARMED: u64 = u64::MAX;

/// An in-memory storage backend.
///
/// The byte buffer lives behind an `Arc`, so [`InMemoryBackend::share`]
/// hands out a second view of the same bytes. Tests use that to "restart"
/// a database over the log an earlier instance wrote.
///
/// Appends can be made to fail on demand with [`InMemoryBackend::fail_appends_after`],
/// and syncs with [`InMemoryBackend::fail_syncs`], which is how durability
/// failures are simulated. Successful syncs are counted.
///
/// # Example
///
/// ```rust
/// use docbase_storage::{StorageBackend, InMemoryBackend};
///
/// let mut backend = InMemoryBackend::new();
/// let reopened = backend.share();
/// backend.append(b"tick").unwrap();
/// assert_eq!(reopened.size().unwrap(), 4);
/// ```
#[derive(Debug)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
    /// Remaining successful appends before failures start.
    appends_until_failure: Arc<AtomicU64>,
    fail_syncs: Arc<AtomicBool>,
    syncs: Arc<AtomicU64>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            data: Arc::new(RwLock::new(Vec::new())),
            appends_until_failure: Arc::new(AtomicU64::new(NOT_ARMED)),
            fail_syncs: Arc::new(AtomicBool::new(false)),
            syncs: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend over pre-existing bytes, e.g. a captured log.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
            ..Self::default()
        }
    }

    /// Returns a second handle onto the same bytes, fault switches and
    /// sync counter.
    #[must_use]
    pub fn share(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            appends_until_failure: Arc::clone(&self.appends_until_failure),
            fail_syncs: Arc::clone(&self.fail_syncs),
            syncs: Arc::clone(&self.syncs),
        }
    }

    /// Returns a copy of all bytes in the backend.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Lets `successes` more appends through, then fails every append after.
    pub fn fail_appends_after(&self, successes: u64) {
        self.appends_until_failure.store(successes, Ordering::SeqCst);
    }

    /// Makes every sync fail while `fail` is set.
    pub fn fail_syncs(&self, fail: bool) {
        self.fail_syncs.store(fail, Ordering::SeqCst);
    }

    /// Number of successful syncs so far.
    #[must_use]
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::SeqCst)
    }

    /// Disarms pending append and sync failures.
    pub fn heal(&self) {
        self.appends_until_failure.store(NOT_ARMED, Ordering::SeqCst);
        self.fail_syncs.store(false, Ordering::SeqCst);
    }

    fn check_fault(&self) -> StorageResult<()> {
        let remaining = self.appends_until_failure.load(Ordering::SeqCst);
        if remaining == NOT_ARMED {
            return Ok(());
        }
        if remaining == 0 {
            return Err(StorageError::Injected("append rejected".to_string()));
        }
        self.appends_until_failure
            .store(remaining - 1, Ordering::SeqCst);
        Ok(())
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let start = usize::try_from(offset).map_err(|_| StorageError::ReadPastEnd {
            offset,
            len,
            size,
        })?;
        let end = start.saturating_add(len);

        if end > data.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(data[start..end].to_vec())
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        self.check_fault()?;
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.fail_syncs.load(Ordering::SeqCst) {
            return Err(StorageError::Injected("sync rejected".to_string()));
        }
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        if new_size > size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size,
            });
        }
        data.truncate(new_size as usize);
        Ok(())
    }
}
