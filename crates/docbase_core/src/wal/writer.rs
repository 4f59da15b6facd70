//! WAL writer and reader.

use crate::error::{CoreError, CoreResult};
use crate::types::{CollectionId, FileId, Tick};
use crate::wal::record::{compute_crc32, WalRecord, WAL_MAGIC, WAL_VERSION};
use crate::wal::{WalRecordIterator, CRC_SIZE, HEADER_SIZE};
use docbase_storage::StorageBackend;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where an appended record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalPosition {
    /// Tick stamped on the record.
    pub tick: Tick,
    /// Logical datafile holding it.
    pub fid: FileId,
    /// Byte offset in the log.
    pub offset: u64,
}

#[derive(Debug, Clone, Default)]
struct LogState {
    last_tick: Tick,
    /// Datafile currently accepting records.
    open_fid: Option<FileId>,
    max_fid: FileId,
    /// Bytes written to the open datafile.
    logfile_bytes: u64,
    uncollected: HashMap<CollectionId, usize>,
}

impl LogState {
    fn observe(&mut self, record: &WalRecord, frame_len: u64) {
        self.last_tick = self.last_tick.max(record.tick());
        self.logfile_bytes += frame_len;
        match record {
            WalRecord::LogfileHeader { fid, .. } => {
                self.open_fid = Some(*fid);
                self.max_fid = self.max_fid.max(*fid);
                self.logfile_bytes = frame_len;
            }
            WalRecord::LogfileFooter { .. } => {
                self.open_fid = None;
                self.logfile_bytes = 0;
            }
            WalRecord::Document { cid, .. } | WalRecord::Tombstone { cid, .. } => {
                *self.uncollected.entry(*cid).or_default() += 1;
            }
            _ => {}
        }
    }
}

/// Append-only marker log on top of a [`StorageBackend`].
///
/// Every record gets the next tick. Records are grouped into logical
/// datafiles: once the open datafile would grow past `logfile_size`, a
/// footer closes it and a header opens the next one.
pub struct WalManager {
    backend: Arc<Mutex<Box<dyn StorageBackend>>>,
    /// Lock order: `state` before `backend`.
    state: Mutex<LogState>,
    sync_on_write: bool,
    logfile_size: u64,
}

fn frame(record: &WalRecord) -> CoreResult<Vec<u8>> {
    let payload = record.encode_payload()?;
    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::bad_parameter("WAL record payload too large"))?;

    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    data.extend_from_slice(&WAL_MAGIC);
    data.extend_from_slice(&WAL_VERSION.to_le_bytes());
    data.push(record.record_type().as_byte());
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(&payload);
    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

impl WalManager {
    /// Opens a log, restoring the tick, datafile and per-collection counters
    /// from the records already in `backend`.
    ///
    /// A torn tail left by a crash is cut off.
    ///
    /// # Errors
    ///
    /// Returns `ChecksumMismatch` or `WalCorruption` if a complete record is
    /// damaged, or a storage error.
    pub fn open(
        backend: Box<dyn StorageBackend>,
        sync_on_write: bool,
        logfile_size: u64,
    ) -> CoreResult<Self> {
        let wal = Self {
            backend: Arc::new(Mutex::new(backend)),
            state: Mutex::new(LogState::default()),
            sync_on_write,
            logfile_size,
        };

        let size = wal.size()?;
        let mut state = LogState::default();
        let valid_end = {
            let mut records = wal.iter()?;
            let mut end = 0;
            while let Some(item) = records.next() {
                let (_, record) = item?;
                let next = records.offset();
                state.observe(&record, next - end);
                end = next;
            }
            end
        };
        if valid_end < size {
            warn!(valid_end, size, "cutting torn WAL tail");
            wal.backend.lock().truncate(valid_end)?;
        }
        debug!(last_tick = %state.last_tick, fid = %state.max_fid, "WAL opened");
        *wal.state.lock() = state;
        Ok(wal)
    }

    fn write(
        &self,
        backend: &mut dyn StorageBackend,
        state: &mut LogState,
        mut record: WalRecord,
    ) -> CoreResult<WalPosition> {
        let tick = state.last_tick.next();
        record.set_tick(tick);
        let data = frame(&record)?;
        let offset = backend.append(&data)?;
        state.observe(&record, data.len() as u64);
        Ok(WalPosition {
            tick,
            fid: state.open_fid.unwrap_or(state.max_fid),
            offset,
        })
    }

    /// Appends a record and returns its tick.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails; nothing is then counted.
    pub fn append(&self, record: WalRecord) -> CoreResult<Tick> {
        self.append_located(record, false).map(|p| p.tick)
    }

    /// Appends a record, syncing it to stable storage if `sync` or
    /// `sync_on_write` is set.
    ///
    /// On failure the log is cut back to its size before the call and the
    /// tick and counters are restored, so a failed append leaves nothing
    /// behind for recovery to replay.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write or sync fails.
    pub fn append_located(&self, record: WalRecord, sync: bool) -> CoreResult<WalPosition> {
        let mut state = self.state.lock();
        let mut guard = self.backend.lock();
        let backend: &mut dyn StorageBackend = &mut **guard;

        let start = backend.size()?;
        let snapshot = state.clone();
        let result = self.append_framed(backend, &mut state, record, sync || self.sync_on_write);
        if let Err(err) = &result {
            match backend.truncate(start) {
                Ok(()) => *state = snapshot,
                Err(cut) => warn!(
                    offset = start,
                    error = %err,
                    truncate_error = %cut,
                    "failed WAL append could not be cut off"
                ),
            }
        }
        result
    }

    fn append_framed(
        &self,
        backend: &mut dyn StorageBackend,
        state: &mut LogState,
        record: WalRecord,
        sync: bool,
    ) -> CoreResult<WalPosition> {
        let needed = frame(&record)?.len() as u64;
        let open = state.open_fid;
        match open {
            None => {
                let fid = FileId::new(state.max_fid.as_u64() + 1);
                let header = WalRecord::LogfileHeader {
                    tick: Tick::default(),
                    fid,
                };
                self.write(backend, state, header)?;
            }
            Some(fid) if state.logfile_bytes + needed > self.logfile_size => {
                let footer = WalRecord::LogfileFooter {
                    tick: Tick::default(),
                    fid,
                };
                self.write(backend, state, footer)?;
                let next = FileId::new(state.max_fid.as_u64() + 1);
                self.write(
                    backend,
                    state,
                    WalRecord::LogfileHeader {
                        tick: Tick::default(),
                        fid: next,
                    },
                )?;
                debug!(closed = %fid, opened = %next, "WAL datafile rotated");
            }
            Some(_) => {}
        }

        let position = self.write(backend, state, record)?;
        if sync {
            backend.flush()?;
            backend.sync()?;
        }
        Ok(position)
    }

    /// Highest tick handed out so far.
    pub fn last_tick(&self) -> Tick {
        self.state.lock().last_tick
    }

    /// Datafile that receives the next record.
    pub fn current_fid(&self) -> FileId {
        let state = self.state.lock();
        state.open_fid.unwrap_or(FileId::new(state.max_fid.as_u64() + 1))
    }

    /// Number of document and tombstone markers logged for `cid`.
    pub fn uncollected_entries(&self, cid: CollectionId) -> usize {
        self.state.lock().uncollected.get(&cid).copied().unwrap_or(0)
    }

    /// Forgets the counters of a dropped collection.
    pub fn forget_collection(&self, cid: CollectionId) {
        self.state.lock().uncollected.remove(&cid);
    }

    /// Flushes all pending writes and syncs them to durable storage.
    pub fn flush(&self) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        backend.flush()?;
        backend.sync()?;
        Ok(())
    }

    /// Returns the current WAL size.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }

    /// Returns a streaming iterator over WAL records.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be accessed.
    pub fn iter(&self) -> CoreResult<WalRecordIterator<'_>> {
        WalRecordIterator::new(self.backend.lock(), 0)
    }

    /// Calls `callback` for each record until it returns `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the callback returns an error.
    pub fn for_each_streaming<F>(&self, mut callback: F) -> CoreResult<()>
    where
        F: FnMut(u64, WalRecord) -> CoreResult<bool>,
    {
        for result in self.iter()? {
            let (offset, record) = result?;
            if !callback(offset, record)? {
                break;
            }
        }
        Ok(())
    }

    /// Reads all records from the WAL.
    ///
    /// # Errors
    ///
    /// Returns the first read or corruption error.
    pub fn read_all(&self) -> CoreResult<Vec<(u64, WalRecord)>> {
        self.iter()?.collect()
    }
}

impl std::fmt::Debug for WalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalManager")
            .field("sync_on_write", &self.sync_on_write)
            .field("logfile_size", &self.logfile_size)
            .finish_non_exhaustive()
    }
}
