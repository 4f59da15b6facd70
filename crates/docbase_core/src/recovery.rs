//! Rebuilding collection state from the log.
//!
//! The database streams the log once, in tick order, and hands each marker
//! of a collection to that collection's [`RecoveryReplayer`]. The replayer
//! rebuilds the primary index, the datafile statistics and the revision and
//! tick high-water marks. Secondary indexes are only populated in
//! [`RecoveryReplayer::finish`], from the complete primary index, unless the
//! whole database is still in recovery, in which case population is deferred
//! until the collection is first used.
//!
//! A marker that cannot be applied is logged and skipped. Out-of-memory and
//! storage corruption abort the replay.

use crate::collection::{Collection, CollectionState};
use crate::document::Document;
use crate::error::CoreResult;
use crate::handle::DocumentHandle;
use crate::types::{FileId, Revision, Tick};
use crate::wal::WalRecord;
use parking_lot::RwLockWriteGuard;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// What a replay did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStats {
    /// Document markers for keys not seen before.
    pub documents: usize,
    /// Document markers that superseded an earlier version.
    pub updates: usize,
    /// Tombstones that removed a live document.
    pub deletions: usize,
    /// Tombstones for keys that were never seen.
    pub missing_deletions: usize,
    /// Markers that could not be applied.
    pub skipped: usize,
    /// Live documents after replay.
    pub alive: usize,
    /// Highest revision replayed.
    pub max_revision: Revision,
    /// Tick of the newest document, deletion or index marker.
    pub last_tick: Tick,
}

/// Replays the markers of one collection.
///
/// Holds the collection's state lock from construction until
/// [`finish`](Self::finish).
pub struct RecoveryReplayer<'a> {
    collection: &'a Collection,
    state: RwLockWriteGuard<'a, CollectionState>,
    stats: RecoveryStats,
}

impl<'a> RecoveryReplayer<'a> {
    /// Starts replaying into `collection`.
    #[must_use]
    pub fn new(collection: &'a Collection) -> Self {
        Self {
            collection,
            state: collection.state().write(),
            stats: RecoveryStats::default(),
        }
    }

    /// Applies one marker stored in datafile `fid`. Markers of other
    /// collections and bookkeeping markers are ignored.
    ///
    /// # Errors
    ///
    /// Only errors that abort recovery are returned; anything else skips
    /// the marker.
    pub fn apply(&mut self, record: &WalRecord, fid: FileId) -> CoreResult<()> {
        if record.collection() != Some(self.collection.id()) {
            return Ok(());
        }
        let result = match record {
            WalRecord::Document {
                tick,
                key,
                rev,
                body,
                ..
            } => self.apply_document(key, *rev, body, *tick, fid),
            WalRecord::Tombstone { tick, key, rev, .. } => {
                self.apply_tombstone(key, *rev, *tick, fid);
                Ok(())
            }
            WalRecord::CreateIndex { tick, .. } | WalRecord::DropIndex { tick, .. } => {
                self.state.last_tick = self.state.last_tick.max(*tick);
                Ok(())
            }
            _ => Ok(()),
        };
        match result {
            Err(err) if err.aborts_recovery() => Err(err),
            Err(err) => {
                warn!(
                    collection = %self.collection.name(),
                    tick = %record.tick(),
                    error = %err,
                    "skipping marker that cannot be replayed"
                );
                self.stats.skipped += 1;
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn observe(&mut self, key: &str, rev: Revision, tick: Tick) {
        self.collection.clock().observe(rev);
        self.collection.key_generator().track(key);
        self.state.revision = self.state.revision.max(rev);
        self.state.last_tick = self.state.last_tick.max(tick);
    }

    fn apply_document(
        &mut self,
        key: &str,
        rev: Revision,
        body: &[u8],
        tick: Tick,
        fid: FileId,
    ) -> CoreResult<()> {
        let document = Arc::new(Document::decode(body)?);
        self.observe(key, rev, tick);

        let state = &mut *self.state;
        let primary = state.indexes.primary_mut();
        let handle = DocumentHandle::new(document, rev, tick, fid);
        let size = handle.marker_size();
        match primary.lookup_key(key) {
            None => {
                let id = primary.allocate(handle)?;
                if let Err(err) = primary.insert_key(key, id) {
                    primary.release(id);
                    return Err(err);
                }
                self.stats.documents += 1;
            }
            Some(id) => {
                if let Some(slot) = primary.handle_mut(id) {
                    state.statistics.file(slot.fid).retire(slot.marker_size());
                    *slot = handle;
                }
                self.stats.updates += 1;
            }
        }
        state.statistics.file(fid).add_alive(size);
        Ok(())
    }

    fn apply_tombstone(&mut self, key: &str, rev: Revision, tick: Tick, fid: FileId) {
        self.observe(key, rev, tick);

        let state = &mut *self.state;
        let primary = state.indexes.primary_mut();
        match primary.remove_key(key) {
            Some(id) => {
                if let Some(old) = primary.release(id) {
                    state.statistics.file(old.fid).retire(old.marker_size());
                }
                self.stats.deletions += 1;
            }
            None => self.stats.missing_deletions += 1,
        }
        state.statistics.file(fid).add_deletion();
    }

    /// Ends the replay, populating secondary indexes unless the database
    /// is still in recovery.
    ///
    /// # Errors
    ///
    /// Returns the first index population error.
    pub fn finish(self) -> CoreResult<RecoveryStats> {
        let Self {
            collection,
            mut state,
            mut stats,
        } = self;
        stats.alive = state.indexes.primary().count();
        stats.max_revision = state.revision;
        stats.last_tick = state.last_tick;

        if !collection.config().in_recovery {
            collection.fill_pending(&mut state)?;
        }
        info!(
            collection = %collection.name(),
            alive = stats.alive,
            deletions = stats.deletions,
            skipped = stats.skipped,
            last_tick = %stats.last_tick,
            "collection recovered"
        );
        Ok(stats)
    }
}
