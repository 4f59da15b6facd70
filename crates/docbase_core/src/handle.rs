//! Document handles and the arena that owns them.
//!
//! A handle points at the current stored version of one key. The primary
//! index owns the [`HandleArena`]; secondary indexes keep [`HandleId`]s,
//! which are plain slot numbers and never own anything. Repointing a handle
//! at a newer version is therefore visible through every index at once.

use crate::document::Document;
use crate::error::CoreResult;
use crate::types::{FileId, Revision, Tick};
use std::fmt;
use std::sync::Arc;

/// Stable slot number of a handle in its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(pub usize);

impl HandleId {
    /// Returns the slot index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h:{}", self.0)
    }
}

/// Location and content of the current version of a document.
#[derive(Debug, Clone)]
pub struct DocumentHandle {
    /// Revision of the version pointed at.
    pub revision: Revision,
    /// Log tick of the marker holding this version.
    pub tick: Tick,
    /// Logical datafile holding the marker.
    pub fid: FileId,
    /// The stored document.
    pub document: Arc<Document>,
}

impl DocumentHandle {
    /// Creates a handle for a freshly stored version.
    #[must_use]
    pub fn new(document: Arc<Document>, revision: Revision, tick: Tick, fid: FileId) -> Self {
        Self {
            revision,
            tick,
            fid,
            document,
        }
    }

    /// Approximate size of the stored marker in bytes.
    #[must_use]
    pub fn marker_size(&self) -> usize {
        self.document.byte_size()
    }
}

/// Slab of document handles addressed by [`HandleId`].
///
/// Released slots are reused; a [`HandleId`] is only meaningful while the
/// primary index maps a key to it.
#[derive(Debug, Default)]
pub struct HandleArena {
    slots: Vec<Option<DocumentHandle>>,
    free: Vec<usize>,
    live: usize,
}

impl HandleArena {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `handle` and returns its slot.
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if the arena cannot grow.
    pub fn allocate(&mut self, handle: DocumentHandle) -> CoreResult<HandleId> {
        let id = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(handle);
                index
            }
            None => {
                self.slots.try_reserve(1)?;
                self.slots.push(Some(handle));
                self.slots.len() - 1
            }
        };
        self.live += 1;
        Ok(HandleId(id))
    }

    /// Frees a slot and returns what it held.
    pub fn release(&mut self, id: HandleId) -> Option<DocumentHandle> {
        let handle = self.slots.get_mut(id.0)?.take()?;
        self.free.push(id.0);
        self.live -= 1;
        Some(handle)
    }

    /// Returns the handle in `id`.
    #[must_use]
    pub fn get(&self, id: HandleId) -> Option<&DocumentHandle> {
        self.slots.get(id.0)?.as_ref()
    }

    /// Returns the handle in `id` for repointing.
    pub fn get_mut(&mut self, id: HandleId) -> Option<&mut DocumentHandle> {
        self.slots.get_mut(id.0)?.as_mut()
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Returns true if no slot is occupied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Pre-allocates room for `additional` more handles.
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if the reservation fails.
    pub fn reserve(&mut self, additional: usize) -> CoreResult<()> {
        self.slots.try_reserve(additional.saturating_sub(self.free.len()))?;
        Ok(())
    }

    /// Iterates occupied slots in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (HandleId, &DocumentHandle)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|h| (HandleId(i), h)))
    }

    /// Approximate memory held by the arena.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.slots.capacity() * std::mem::size_of::<Option<DocumentHandle>>()
            + self.free.capacity() * std::mem::size_of::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handle(rev: u64) -> DocumentHandle {
        let doc = Document::from_value(json!({"_key": "k", "_rev": rev.to_string()})).unwrap();
        DocumentHandle::new(Arc::new(doc), Revision::new(rev), Tick::new(rev), FileId::new(1))
    }

    #[test]
    fn allocate_and_release() {
        let mut arena = HandleArena::new();
        let a = arena.allocate(handle(1)).unwrap();
        let b = arena.allocate(handle(2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(arena.len(), 2);

        let released = arena.release(a).unwrap();
        assert_eq!(released.revision, Revision::new(1));
        assert!(arena.get(a).is_none());
        assert!(arena.release(a).is_none());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut arena = HandleArena::new();
        let a = arena.allocate(handle(1)).unwrap();
        arena.allocate(handle(2)).unwrap();
        arena.release(a);
        let c = arena.allocate(handle(3)).unwrap();
        assert_eq!(a, c);
        assert_eq!(arena.get(c).unwrap().revision, Revision::new(3));
    }

    #[test]
    fn repoint_in_place() {
        let mut arena = HandleArena::new();
        let id = arena.allocate(handle(1)).unwrap();
        *arena.get_mut(id).unwrap() = handle(9);
        assert_eq!(arena.get(id).unwrap().tick, Tick::new(9));
        assert_eq!(arena.iter().count(), 1);
    }
}
