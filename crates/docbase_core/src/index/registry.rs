//! Ordered index set of a collection.

use super::{Index, IndexDefinition, IndexKind, PrimaryIndex};
use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::handle::HandleId;
use crate::types::IndexId;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Snapshot of one index for callers outside the collection lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDescriptor {
    /// Persisted definition.
    #[serde(flatten)]
    pub definition: IndexDefinition,
    /// Number of indexed documents.
    pub entries: usize,
    /// Approximate memory used, in bytes.
    pub memory_usage: usize,
}

impl IndexDescriptor {
    /// Describes `index`.
    #[must_use]
    pub fn of(index: &dyn Index) -> Self {
        Self {
            definition: index.definition(),
            entries: index.len(),
            memory_usage: index.memory_usage(),
        }
    }

    /// Index id.
    #[must_use]
    pub fn id(&self) -> IndexId {
        self.definition.id
    }
}

/// The primary index followed by the secondary indexes in registration
/// order.
///
/// The cleanup and persistent counters are maintained on every add and
/// remove.
#[derive(Debug, Default)]
pub struct IndexRegistry {
    primary: PrimaryIndex,
    secondaries: Vec<Box<dyn Index>>,
    cleanup_count: usize,
    persistent_count: usize,
}

impl IndexRegistry {
    /// Creates a registry holding only an empty primary index.
    #[must_use]
    pub fn new() -> Self {
        Self {
            primary: PrimaryIndex::new(),
            ..Self::default()
        }
    }

    /// The primary index.
    #[must_use]
    pub fn primary(&self) -> &PrimaryIndex {
        &self.primary
    }

    /// The primary index, mutably.
    pub fn primary_mut(&mut self) -> &mut PrimaryIndex {
        &mut self.primary
    }

    /// Secondary indexes in registration order.
    pub fn secondaries(&self) -> impl Iterator<Item = &dyn Index> {
        self.secondaries.iter().map(|i| i.as_ref())
    }

    /// Registers a populated secondary index.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` for a primary index or a taken id, and
    /// `OutOfMemory` if the list cannot grow.
    pub fn add(&mut self, index: Box<dyn Index>) -> CoreResult<()> {
        if index.kind() == IndexKind::Primary || index.id().is_primary() {
            return Err(CoreError::bad_parameter("slot 0 is reserved for the primary index"));
        }
        if self.lookup(index.id()).is_some() {
            return Err(CoreError::bad_parameter(format!(
                "index id {} is already in use",
                index.id()
            )));
        }
        self.secondaries.try_reserve(1)?;
        if index.needs_cleanup() {
            self.cleanup_count += 1;
        }
        if index.is_persistent() {
            self.persistent_count += 1;
        }
        self.secondaries.push(index);
        Ok(())
    }

    /// Unregisters an index. The primary index and indexes that refuse to
    /// be dropped are never removed.
    pub fn remove(&mut self, id: IndexId) -> Option<Box<dyn Index>> {
        if id.is_primary() {
            return None;
        }
        let position = self.secondaries.iter().position(|i| i.id() == id)?;
        if !self.secondaries[position].can_be_dropped() {
            return None;
        }
        let index = self.secondaries.remove(position);
        if index.needs_cleanup() {
            self.cleanup_count -= 1;
        }
        if index.is_persistent() {
            self.persistent_count -= 1;
        }
        Some(index)
    }

    /// Looks up an index by id; id 0 is the primary index.
    #[must_use]
    pub fn lookup(&self, id: IndexId) -> Option<&dyn Index> {
        if id.is_primary() {
            return Some(&self.primary as &dyn Index);
        }
        self.secondaries
            .iter()
            .find(|i| i.id() == id)
            .map(|i| i.as_ref())
    }

    /// All indexes, primary first.
    #[must_use]
    pub fn all(&self) -> Vec<&dyn Index> {
        std::iter::once(&self.primary as &dyn Index)
            .chain(self.secondaries())
            .collect()
    }

    /// Finds a secondary index equivalent to `definition`.
    #[must_use]
    pub fn find_matching(&self, definition: &IndexDefinition) -> Option<&dyn Index> {
        self.secondaries()
            .find(|i| i.definition().matches(definition))
    }

    /// Number of indexes, primary included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.secondaries.len() + 1
    }

    /// Always false: the primary index is always present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Number of indexes that want periodic cleanup.
    #[must_use]
    pub fn cleanup_count(&self) -> usize {
        self.cleanup_count
    }

    /// Number of persistent-backed indexes.
    #[must_use]
    pub fn persistent_count(&self) -> usize {
        self.persistent_count
    }

    /// Largest id in use.
    #[must_use]
    pub fn max_id(&self) -> IndexId {
        self.secondaries
            .iter()
            .map(|i| i.id())
            .max()
            .unwrap_or(IndexId::PRIMARY)
    }

    /// Descriptors of all indexes, primary first.
    #[must_use]
    pub fn descriptors(&self) -> Vec<IndexDescriptor> {
        self.all().into_iter().map(IndexDescriptor::of).collect()
    }

    /// Total memory of all indexes.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.all().iter().map(|i| i.memory_usage()).sum()
    }

    /// Inserts `doc` into every secondary index.
    ///
    /// On failure the indexes already updated are unwound before the error
    /// is returned.
    ///
    /// # Errors
    ///
    /// Returns the first index error.
    pub fn insert_secondaries(&mut self, handle: HandleId, doc: &Document) -> CoreResult<()> {
        for position in 0..self.secondaries.len() {
            if let Err(err) = self.secondaries[position].insert(handle, doc, false) {
                for index in self.secondaries[..position].iter_mut().rev() {
                    if let Err(undo) = index.remove(handle, doc, true) {
                        warn!(
                            index = %index.id(),
                            error = %undo,
                            "rollback of index insert failed"
                        );
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Removes `doc` from every secondary index.
    ///
    /// On failure the indexes already updated get the document back before
    /// the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first index error.
    pub fn remove_secondaries(&mut self, handle: HandleId, doc: &Document) -> CoreResult<()> {
        for position in 0..self.secondaries.len() {
            if let Err(err) = self.secondaries[position].remove(handle, doc, false) {
                self.restore_secondaries(position, handle, doc);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Reinserts `doc` into the first `upto` secondary indexes with the
    /// rollback flag set.
    pub fn restore_secondaries(&mut self, upto: usize, handle: HandleId, doc: &Document) {
        let upto = upto.min(self.secondaries.len());
        for index in self.secondaries[..upto].iter_mut().rev() {
            if let Err(undo) = index.insert(handle, doc, true) {
                warn!(index = %index.id(), error = %undo, "rollback of index removal failed");
            }
        }
    }

    /// Takes `doc` out of every secondary index with the rollback flag set.
    /// Failures are logged and skipped.
    pub fn discard_secondaries(&mut self, handle: HandleId, doc: &Document) {
        for index in self.secondaries.iter_mut().rev() {
            if let Err(undo) = index.remove(handle, doc, true) {
                warn!(index = %index.id(), error = %undo, "rollback of index insert failed");
            }
        }
    }

    /// Runs `cleanup` on every index that needs it.
    ///
    /// # Errors
    ///
    /// Returns the first cleanup error.
    pub fn cleanup(&mut self) -> CoreResult<usize> {
        if self.cleanup_count == 0 {
            return Ok(0);
        }
        let mut cleaned = 0;
        for index in self.secondaries.iter_mut().filter(|i| i.needs_cleanup()) {
            index.cleanup()?;
            cleaned += 1;
        }
        Ok(cleaned)
    }
}
