//! Streaming WAL reader.

use crate::error::{CoreError, CoreResult};
use crate::wal::record::{compute_crc32, WalRecord, WalRecordType, WAL_MAGIC, WAL_VERSION};
use crate::wal::{CRC_SIZE, HEADER_SIZE};
use docbase_storage::StorageBackend;
use parking_lot::MutexGuard;

/// Bytes fetched from the backend per refill.
const READ_BUFFER_SIZE: usize = 64 * 1024; // 64 KB

/// Iterator over `(offset, record)` pairs of a WAL.
///
/// Holds the backend lock for its lifetime, so appends wait until the
/// iterator is dropped.
///
/// - a truncated header or payload ends iteration cleanly
/// - a CRC mismatch yields `ChecksumMismatch` and ends iteration
/// - bad magic, a newer version or an unknown type yields `WalCorruption`
pub struct WalRecordIterator<'a> {
    backend: MutexGuard<'a, Box<dyn StorageBackend>>,
    total_size: u64,
    /// WAL offset of `buffer[0]`.
    buffer_offset: u64,
    buffer: Vec<u8>,
    /// Next unread byte in `buffer`.
    position: usize,
    finished: bool,
}

impl<'a> WalRecordIterator<'a> {
    /// Starts reading at `start_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn new(
        backend: MutexGuard<'a, Box<dyn StorageBackend>>,
        start_offset: u64,
    ) -> CoreResult<Self> {
        let total_size = backend.size()?;
        Ok(Self {
            backend,
            total_size,
            buffer_offset: start_offset,
            buffer: Vec::new(),
            position: 0,
            finished: false,
        })
    }

    /// Offset of the next unread byte; after a record, where it ended.
    pub fn offset(&self) -> u64 {
        self.buffer_offset + self.position as u64
    }

    /// Makes `wanted` bytes available at `position`; false at end of log.
    fn fill(&mut self, wanted: usize) -> CoreResult<bool> {
        let available = self.buffer.len() - self.position;
        if available >= wanted {
            return Ok(true);
        }
        let remaining = self.total_size.saturating_sub(self.offset());
        if remaining < wanted as u64 {
            return Ok(false);
        }

        self.buffer.drain(..self.position);
        self.buffer_offset += self.position as u64;
        self.position = 0;

        let to_read = usize::try_from(remaining)
            .unwrap_or(usize::MAX)
            .min(wanted.max(READ_BUFFER_SIZE))
            - available;
        let read_at = self.buffer_offset + available as u64;
        let data = self.backend.read_at(read_at, to_read)?;
        self.buffer.extend_from_slice(&data);
        Ok(self.buffer.len() >= wanted)
    }

    fn read_next(&mut self) -> CoreResult<Option<(u64, WalRecord)>> {
        let start = self.offset();
        if !self.fill(HEADER_SIZE)? {
            return Ok(None);
        }

        let header = &self.buffer[self.position..self.position + HEADER_SIZE];
        if header[0..4] != WAL_MAGIC {
            return Err(CoreError::wal_corruption(format!("invalid magic at offset {start}")));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > WAL_VERSION {
            return Err(CoreError::wal_corruption(format!(
                "unsupported version {version} at offset {start}"
            )));
        }
        let type_byte = header[6];
        let record_type = WalRecordType::from_byte(type_byte).ok_or_else(|| {
            CoreError::wal_corruption(format!("unknown record type {type_byte} at offset {start}"))
        })?;
        let payload_len =
            u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;

        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if !self.fill(total_len)? {
            return Ok(None);
        }

        let frame = &self.buffer[self.position..self.position + total_len];
        let body_end = HEADER_SIZE + payload_len;
        let stored = u32::from_le_bytes([
            frame[body_end],
            frame[body_end + 1],
            frame[body_end + 2],
            frame[body_end + 3],
        ]);
        let computed = compute_crc32(&frame[..body_end]);
        if stored != computed {
            return Err(CoreError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let record = WalRecord::decode_payload(record_type, &frame[HEADER_SIZE..body_end])?;
        self.position += total_len;
        Ok(Some((start, record)))
    }
}

impl Iterator for WalRecordIterator<'_> {
    type Item = CoreResult<(u64, WalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let result = self.read_next();
        if !matches!(result, Ok(Some(_))) {
            self.finished = true;
        }
        result.transpose()
    }
}
