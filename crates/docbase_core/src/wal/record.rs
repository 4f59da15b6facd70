//! WAL markers and their payload encoding.

use crate::error::{CoreError, CoreResult};
use crate::index::IndexDefinition;
use crate::types::{CollectionId, FileId, IndexId, Revision, Tick, TransactionId};

/// Magic bytes opening every WAL record.
pub const WAL_MAGIC: [u8; 4] = *b"DWAL";

/// Current WAL format version.
pub const WAL_VERSION: u16 = 1;

/// Type byte of a WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WalRecordType {
    /// Start of a logical datafile.
    LogfileHeader = 1,
    /// End of a logical datafile.
    LogfileFooter = 2,
    /// A collection was created.
    CollectionHeader = 3,
    /// A document version.
    Document = 4,
    /// A deletion.
    Tombstone = 5,
    /// An index was created.
    CreateIndex = 6,
    /// An index was dropped.
    DropIndex = 7,
}

impl WalRecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::LogfileHeader),
            2 => Some(Self::LogfileFooter),
            3 => Some(Self::CollectionHeader),
            4 => Some(Self::Document),
            5 => Some(Self::Tombstone),
            6 => Some(Self::CreateIndex),
            7 => Some(Self::DropIndex),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One marker in the write-ahead log.
///
/// Every marker carries the tick the WAL stamped on it at append time;
/// callers build markers with `Tick::default()` and the log overwrites it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Opens logical datafile `fid`.
    LogfileHeader {
        /// Stamped tick.
        tick: Tick,
        /// Datafile being opened.
        fid: FileId,
    },

    /// Closes logical datafile `fid`.
    LogfileFooter {
        /// Stamped tick.
        tick: Tick,
        /// Datafile being closed.
        fid: FileId,
    },

    /// Collection `cid` was created.
    CollectionHeader {
        /// Stamped tick.
        tick: Tick,
        /// New collection.
        cid: CollectionId,
    },

    /// A full document version.
    Document {
        /// Stamped tick.
        tick: Tick,
        /// Writing transaction.
        tid: TransactionId,
        /// Owning collection.
        cid: CollectionId,
        /// Document key.
        key: String,
        /// Revision of this version.
        rev: Revision,
        /// CBOR-encoded document body.
        body: Vec<u8>,
    },

    /// Deletion of a key.
    Tombstone {
        /// Stamped tick.
        tick: Tick,
        /// Writing transaction.
        tid: TransactionId,
        /// Owning collection.
        cid: CollectionId,
        /// Removed key.
        key: String,
        /// Revision of the removal.
        rev: Revision,
    },

    /// An index was created.
    CreateIndex {
        /// Stamped tick.
        tick: Tick,
        /// Owning collection.
        cid: CollectionId,
        /// New index.
        iid: IndexId,
        /// Its definition.
        definition: IndexDefinition,
    },

    /// An index was dropped.
    DropIndex {
        /// Stamped tick.
        tick: Tick,
        /// Owning collection.
        cid: CollectionId,
        /// Dropped index.
        iid: IndexId,
    },
}

impl WalRecord {
    /// Maximum payload size; the envelope stores the length in four bytes.
    pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize;

    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> WalRecordType {
        match self {
            Self::LogfileHeader { .. } => WalRecordType::LogfileHeader,
            Self::LogfileFooter { .. } => WalRecordType::LogfileFooter,
            Self::CollectionHeader { .. } => WalRecordType::CollectionHeader,
            Self::Document { .. } => WalRecordType::Document,
            Self::Tombstone { .. } => WalRecordType::Tombstone,
            Self::CreateIndex { .. } => WalRecordType::CreateIndex,
            Self::DropIndex { .. } => WalRecordType::DropIndex,
        }
    }

    /// Returns the stamped tick.
    #[must_use]
    pub fn tick(&self) -> Tick {
        match self {
            Self::LogfileHeader { tick, .. }
            | Self::LogfileFooter { tick, .. }
            | Self::CollectionHeader { tick, .. }
            | Self::Document { tick, .. }
            | Self::Tombstone { tick, .. }
            | Self::CreateIndex { tick, .. }
            | Self::DropIndex { tick, .. } => *tick,
        }
    }

    pub(crate) fn set_tick(&mut self, value: Tick) {
        match self {
            Self::LogfileHeader { tick, .. }
            | Self::LogfileFooter { tick, .. }
            | Self::CollectionHeader { tick, .. }
            | Self::Document { tick, .. }
            | Self::Tombstone { tick, .. }
            | Self::CreateIndex { tick, .. }
            | Self::DropIndex { tick, .. } => *tick = value,
        }
    }

    /// Returns the collection this record belongs to, if any.
    #[must_use]
    pub fn collection(&self) -> Option<CollectionId> {
        match self {
            Self::LogfileHeader { .. } | Self::LogfileFooter { .. } => None,
            Self::CollectionHeader { cid, .. }
            | Self::Document { cid, .. }
            | Self::Tombstone { cid, .. }
            | Self::CreateIndex { cid, .. }
            | Self::DropIndex { cid, .. } => Some(*cid),
        }
    }

    /// True for document versions and tombstones.
    #[must_use]
    pub fn is_document_marker(&self) -> bool {
        matches!(self, Self::Document { .. } | Self::Tombstone { .. })
    }

    /// True for markers that only exist for datafile bookkeeping.
    #[must_use]
    pub fn is_bookkeeping(&self) -> bool {
        matches!(
            self,
            Self::LogfileHeader { .. } | Self::LogfileFooter { .. } | Self::CollectionHeader { .. }
        )
    }

    /// Serializes the record payload (without envelope).
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` if a variable-length field does not fit its
    /// four-byte length prefix.
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.tick().as_u64().to_le_bytes());

        match self {
            Self::LogfileHeader { fid, .. } | Self::LogfileFooter { fid, .. } => {
                buf.extend_from_slice(&fid.as_u64().to_le_bytes());
            }

            Self::CollectionHeader { cid, .. } => {
                buf.extend_from_slice(&cid.as_u64().to_le_bytes());
            }

            Self::Document {
                tid,
                cid,
                key,
                rev,
                body,
                ..
            } => {
                buf.extend_from_slice(&tid.as_u64().to_le_bytes());
                buf.extend_from_slice(&cid.as_u64().to_le_bytes());
                put_bytes(&mut buf, key.as_bytes())?;
                buf.extend_from_slice(&rev.as_u64().to_le_bytes());
                put_bytes(&mut buf, body)?;
            }

            Self::Tombstone {
                tid, cid, key, rev, ..
            } => {
                buf.extend_from_slice(&tid.as_u64().to_le_bytes());
                buf.extend_from_slice(&cid.as_u64().to_le_bytes());
                put_bytes(&mut buf, key.as_bytes())?;
                buf.extend_from_slice(&rev.as_u64().to_le_bytes());
            }

            Self::CreateIndex {
                cid,
                iid,
                definition,
                ..
            } => {
                buf.extend_from_slice(&cid.as_u64().to_le_bytes());
                buf.extend_from_slice(&iid.as_u64().to_le_bytes());
                put_bytes(&mut buf, &serde_json::to_vec(definition)?)?;
            }

            Self::DropIndex { cid, iid, .. } => {
                buf.extend_from_slice(&cid.as_u64().to_le_bytes());
                buf.extend_from_slice(&iid.as_u64().to_le_bytes());
            }
        }

        Ok(buf)
    }

    /// Deserializes a record from its type and payload.
    ///
    /// # Errors
    ///
    /// Returns `WalCorruption` for short, oversized or malformed payloads.
    pub fn decode_payload(record_type: WalRecordType, payload: &[u8]) -> CoreResult<Self> {
        let mut reader = PayloadReader { payload, cursor: 0 };
        let tick = Tick::new(reader.u64()?);

        let record = match record_type {
            WalRecordType::LogfileHeader => Self::LogfileHeader {
                tick,
                fid: FileId::new(reader.u64()?),
            },
            WalRecordType::LogfileFooter => Self::LogfileFooter {
                tick,
                fid: FileId::new(reader.u64()?),
            },
            WalRecordType::CollectionHeader => Self::CollectionHeader {
                tick,
                cid: CollectionId::new(reader.u64()?),
            },
            WalRecordType::Document => Self::Document {
                tick,
                tid: TransactionId::new(reader.u64()?),
                cid: CollectionId::new(reader.u64()?),
                key: reader.string()?,
                rev: Revision::new(reader.u64()?),
                body: reader.bytes()?.to_vec(),
            },
            WalRecordType::Tombstone => Self::Tombstone {
                tick,
                tid: TransactionId::new(reader.u64()?),
                cid: CollectionId::new(reader.u64()?),
                key: reader.string()?,
                rev: Revision::new(reader.u64()?),
            },
            WalRecordType::CreateIndex => Self::CreateIndex {
                tick,
                cid: CollectionId::new(reader.u64()?),
                iid: IndexId::new(reader.u64()?),
                definition: serde_json::from_slice(reader.bytes()?).map_err(|e| {
                    CoreError::wal_corruption(format!("bad index definition: {e}"))
                })?,
            },
            WalRecordType::DropIndex => Self::DropIndex {
                tick,
                cid: CollectionId::new(reader.u64()?),
                iid: IndexId::new(reader.u64()?),
            },
        };

        // Validate no trailing bytes
        if reader.cursor != payload.len() {
            return Err(CoreError::wal_corruption(format!(
                "trailing bytes in {record_type:?} record: expected {} bytes, got {}",
                reader.cursor,
                payload.len()
            )));
        }
        Ok(record)
    }
}

fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) -> CoreResult<()> {
    let len = u32::try_from(data.len()).map_err(|_| {
        CoreError::bad_parameter(format!(
            "marker field too large: {} bytes exceeds maximum of {} bytes",
            data.len(),
            WalRecord::MAX_PAYLOAD_SIZE
        ))
    })?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(data);
    Ok(())
}

struct PayloadReader<'a> {
    payload: &'a [u8],
    cursor: usize,
}

impl<'a> PayloadReader<'a> {
    fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .cursor
            .checked_add(len)
            .filter(|end| *end <= self.payload.len())
            .ok_or_else(|| CoreError::wal_corruption("unexpected end of payload"))?;
        let slice = &self.payload[self.cursor..end];
        self.cursor = end;
        Ok(slice)
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let bytes: [u8; 8] = self
            .take(8)?
            .try_into()
            .map_err(|_| CoreError::wal_corruption("invalid u64"))?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let bytes: [u8; 4] = self
            .take(4)?
            .try_into()
            .map_err(|_| CoreError::wal_corruption("invalid u32"))?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn bytes(&mut self) -> CoreResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> CoreResult<String> {
        String::from_utf8(self.bytes()?.to_vec())
            .map_err(|_| CoreError::wal_corruption("key is not valid UTF-8"))
    }
}

/// Computes CRC32 checksum for data.
pub fn compute_crc32(data: &[u8]) -> u32 {
    // IEEE polynomial, reflected
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
