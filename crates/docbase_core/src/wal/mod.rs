//! Write-ahead log of document and index markers.
//!
//! Every mutation is appended here before it is acknowledged. The log is
//! the only persistent copy of document state; opening a collection replays
//! it.
//!
//! ## Record Format
//!
//! ```text
//! | magic "DWAL" (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! Every payload starts with the 8-byte tick the log stamped on it.
//!
//! ## Logical Datafiles
//!
//! Records are grouped into datafiles delimited by `LogfileHeader` and
//! `LogfileFooter` markers. The log rotates to a new datafile once the open
//! one would exceed the configured size. Datafile ids feed per-datafile
//! statistics.
//!
//! ## Recovery Policy
//!
//! - a truncated header or payload at the end is a clean end of log
//! - a CRC mismatch, bad magic, unknown type or newer version is fatal

mod iterator;
mod record;
mod writer;

pub use iterator::WalRecordIterator;
pub use record::{compute_crc32, WalRecord, WalRecordType, WAL_MAGIC, WAL_VERSION};
pub use writer::{WalManager, WalPosition};

/// magic (4) + version (2) + type (1) + length (4)
pub(crate) const HEADER_SIZE: usize = 11;

pub(crate) const CRC_SIZE: usize = 4;
