//! Liveness accounting and collection figures.

use crate::types::{FileId, Tick};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Rounds a marker size up to the 8-byte marker alignment.
#[must_use]
pub const fn aligned_size(size: usize) -> i64 {
    ((size as i64) + 7) & !7
}

/// Alive and dead marker counters of one logical datafile.
///
/// Counters are signed: a replayed deletion may retire a version whose
/// datafile statistics were never loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatafileStatistics {
    /// Markers holding a current document version.
    pub number_alive: i64,
    /// Markers superseded by a later version or a deletion.
    pub number_dead: i64,
    /// Deletion markers.
    pub number_deletions: i64,
    /// Bytes of alive markers.
    pub size_alive: i64,
    /// Bytes of dead markers.
    pub size_dead: i64,
}

impl DatafileStatistics {
    /// Counts a new current version of `size` bytes.
    pub fn add_alive(&mut self, size: usize) {
        self.number_alive += 1;
        self.size_alive += aligned_size(size);
    }

    /// Moves a version of `size` bytes from alive to dead.
    pub fn retire(&mut self, size: usize) {
        let size = aligned_size(size);
        self.number_alive -= 1;
        self.size_alive -= size;
        self.number_dead += 1;
        self.size_dead += size;
    }

    /// Counts a deletion marker.
    pub fn add_deletion(&mut self) {
        self.number_deletions += 1;
    }

    /// Adds `other` into `self`.
    pub fn merge(&mut self, other: &Self) {
        self.number_alive += other.number_alive;
        self.number_dead += other.number_dead;
        self.number_deletions += other.number_deletions;
        self.size_alive += other.size_alive;
        self.size_dead += other.size_dead;
    }
}

/// Statistics of every datafile a collection has markers in.
#[derive(Debug, Clone, Default)]
pub struct DatafileStatisticsMap {
    files: HashMap<FileId, DatafileStatistics>,
}

impl DatafileStatisticsMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Statistics of `fid`, created on first use.
    pub fn file(&mut self, fid: FileId) -> &mut DatafileStatistics {
        self.files.entry(fid).or_default()
    }

    /// Statistics of `fid`, if any were recorded.
    #[must_use]
    pub fn get(&self, fid: FileId) -> Option<&DatafileStatistics> {
        self.files.get(&fid)
    }

    /// Sum over all datafiles.
    #[must_use]
    pub fn all(&self) -> DatafileStatistics {
        let mut total = DatafileStatistics::default();
        for stats in self.files.values() {
            total.merge(stats);
        }
        total
    }

    /// Number of datafiles with statistics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Datafile ids, ascending.
    #[must_use]
    pub fn file_ids(&self) -> Vec<FileId> {
        let mut ids: Vec<_> = self.files.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Last message left by the compactor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactionStatus {
    /// What the compactor did or why it skipped.
    pub message: String,
    /// Seconds since the Unix epoch.
    pub time: u64,
}

impl CompactionStatus {
    /// Stamps `message` with the current time.
    #[must_use]
    pub fn now(message: impl Into<String>) -> Self {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            message: message.into(),
            time,
        }
    }
}

/// Count and byte size pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountAndSize {
    /// Number of items.
    pub count: i64,
    /// Bytes.
    pub size: i64,
}

/// Dead marker figures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeadFigures {
    /// Superseded markers.
    pub count: i64,
    /// Bytes of superseded markers.
    pub size: i64,
    /// Deletion markers.
    pub deletion: i64,
}

/// Snapshot of a collection's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Figures {
    /// Current versions.
    pub alive: CountAndSize,
    /// Superseded versions and deletions.
    pub dead: DeadFigures,
    /// Indexes, primary included, and their memory.
    pub indexes: CountAndSize,
    /// Document and deletion markers of this collection in the log.
    pub uncollected_logfile_entries: usize,
    /// Tick of the newest document, deletion or index marker.
    pub last_tick: Tick,
    /// Live documents.
    pub document_count: usize,
    /// Datafiles holding markers of this collection.
    pub datafiles: usize,
    /// Last compactor message.
    pub compaction_status: Option<CompactionStatus>,
}
