//! The primary `_key` index.

use super::{unsupported, Index, IndexDefinition, IndexKind, IndexLookup};
use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::handle::{DocumentHandle, HandleArena, HandleId};
use crate::types::IndexId;
use serde_json::Value;
use std::collections::HashMap;

/// Unique `_key` → handle index that owns the handle arena.
///
/// Slots are only freed through [`release`](Self::release), after the key
/// mapping is gone.
#[derive(Debug)]
pub struct PrimaryIndex {
    arena: HandleArena,
    keys: HashMap<String, HandleId>,
    fields: Vec<String>,
}

impl PrimaryIndex {
    /// Creates an empty primary index.
    #[must_use]
    pub fn new() -> Self {
        Self {
            arena: HandleArena::new(),
            keys: HashMap::new(),
            fields: vec![crate::document::KEY.to_string()],
        }
    }

    /// Returns the handle slot of `key`.
    #[must_use]
    pub fn lookup_key(&self, key: &str) -> Option<HandleId> {
        self.keys.get(key).copied()
    }

    /// Returns the handle stored in `id`.
    #[must_use]
    pub fn handle(&self, id: HandleId) -> Option<&DocumentHandle> {
        self.arena.get(id)
    }

    /// Returns the handle stored in `id` for repointing.
    pub fn handle_mut(&mut self, id: HandleId) -> Option<&mut DocumentHandle> {
        self.arena.get_mut(id)
    }

    /// Returns the current handle of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&DocumentHandle> {
        self.lookup_key(key).and_then(|id| self.arena.get(id))
    }

    /// Stores a handle without publishing a key for it.
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if the arena cannot grow.
    pub fn allocate(&mut self, handle: DocumentHandle) -> CoreResult<HandleId> {
        self.arena.allocate(handle)
    }

    /// Publishes `key` → `id`.
    ///
    /// # Errors
    ///
    /// Returns `UniqueConstraintViolated` if the key is already present.
    pub fn insert_key(&mut self, key: &str, id: HandleId) -> CoreResult<()> {
        if self.keys.contains_key(key) {
            return Err(CoreError::UniqueConstraintViolated {
                index: IndexId::PRIMARY,
                key: key.to_string(),
            });
        }
        self.keys.try_reserve(1)?;
        self.keys.insert(key.to_string(), id);
        Ok(())
    }

    /// Unpublishes `key`, returning its slot. The slot stays allocated.
    pub fn remove_key(&mut self, key: &str) -> Option<HandleId> {
        self.keys.remove(key)
    }

    /// Frees a slot whose key is no longer published.
    pub fn release(&mut self, id: HandleId) -> Option<DocumentHandle> {
        self.arena.release(id)
    }

    /// Number of published keys.
    #[must_use]
    pub fn count(&self) -> usize {
        self.keys.len()
    }

    /// Pre-allocates room for `additional` documents.
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if the reservation fails.
    pub fn reserve(&mut self, additional: usize) -> CoreResult<()> {
        self.arena.reserve(additional)?;
        self.keys.try_reserve(additional)?;
        Ok(())
    }

    /// Iterates live handles.
    pub fn iter(&self) -> impl Iterator<Item = (HandleId, &DocumentHandle)> {
        self.keys
            .values()
            .filter_map(|id| self.arena.get(*id).map(|h| (*id, h)))
    }

    /// Iterates published keys in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }
}

impl Default for PrimaryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl Index for PrimaryIndex {
    fn id(&self) -> IndexId {
        IndexId::PRIMARY
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Primary
    }

    fn fields(&self) -> &[String] {
        &self.fields
    }

    fn is_unique(&self) -> bool {
        true
    }

    fn is_sparse(&self) -> bool {
        false
    }

    fn can_be_dropped(&self) -> bool {
        false
    }

    fn insert(&mut self, handle: HandleId, doc: &Document, is_rollback: bool) -> CoreResult<()> {
        let key = doc.key().ok_or(CoreError::DocumentKeyMissing)?;
        match self.insert_key(key, handle) {
            Err(err) if is_rollback && err.is_unique_violation() => Ok(()),
            other => other,
        }
    }

    fn remove(&mut self, handle: HandleId, doc: &Document, is_rollback: bool) -> CoreResult<()> {
        let key = doc.key().ok_or(CoreError::DocumentKeyMissing)?;
        match self.keys.get(key) {
            Some(found) if *found == handle => {
                self.keys.remove(key);
                Ok(())
            }
            _ if is_rollback => Ok(()),
            _ => Err(CoreError::not_found(key)),
        }
    }

    fn lookup(&self, query: &IndexLookup) -> CoreResult<Vec<HandleId>> {
        match query {
            IndexLookup::Equal(values) if values.len() == 1 => Ok(values[0]
                .as_str()
                .and_then(|key| self.lookup_key(key))
                .into_iter()
                .collect()),
            IndexLookup::Equal(values) if values.iter().all(Value::is_string) => Ok(Vec::new()),
            other => Err(unsupported(IndexKind::Primary, other)),
        }
    }

    fn size_hint(&mut self, documents: usize) {
        let _ = self.reserve(documents.saturating_sub(self.count()));
    }

    fn memory_usage(&self) -> usize {
        self.arena.memory_usage()
            + self
                .keys
                .keys()
                .map(|k| k.capacity() + std::mem::size_of::<(String, HandleId)>())
                .sum::<usize>()
    }

    fn len(&self) -> usize {
        self.count()
    }

    fn definition(&self) -> IndexDefinition {
        IndexDefinition::primary()
    }
}
