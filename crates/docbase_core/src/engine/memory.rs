//! Map-backed storage engine.

use super::{CollectionInfo, StorageEngine};
use crate::collection::CollectionParameters;
use crate::error::{CoreError, CoreResult};
use crate::index::IndexDefinition;
use crate::types::{CollectionId, IndexId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Keeps collection metadata in memory.
///
/// Clones share the same map, so a test can hand one clone to a database,
/// drop the database and reopen it from another clone.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEngine {
    collections: Arc<RwLock<BTreeMap<CollectionId, CollectionInfo>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryEngine {
    /// Creates an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every mutating call fail with an I/O error while set.
    pub fn fail_writes(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> CoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CoreError::Io(io::Error::other("engine write failure injected")));
        }
        Ok(())
    }

    fn with_collection<T>(
        &self,
        cid: CollectionId,
        f: impl FnOnce(&mut CollectionInfo) -> T,
    ) -> CoreResult<T> {
        self.check_writable()?;
        let mut collections = self.collections.write();
        let info = collections
            .get_mut(&cid)
            .ok_or_else(|| CoreError::collection_not_found(cid.to_string()))?;
        Ok(f(info))
    }
}

impl StorageEngine for InMemoryEngine {
    fn create_collection(&self, parameters: &CollectionParameters) -> CoreResult<()> {
        self.check_writable()?;
        let mut collections = self.collections.write();
        if collections.contains_key(&parameters.cid) {
            return Err(CoreError::DuplicateName {
                name: parameters.name.clone(),
            });
        }
        collections.insert(
            parameters.cid,
            CollectionInfo {
                parameters: parameters.clone(),
                indexes: Vec::new(),
            },
        );
        Ok(())
    }

    fn rename_collection(&self, cid: CollectionId, name: &str) -> CoreResult<()> {
        self.with_collection(cid, |info| info.parameters.name = name.to_string())
    }

    fn change_collection(&self, parameters: &CollectionParameters) -> CoreResult<()> {
        self.with_collection(parameters.cid, |info| info.parameters = parameters.clone())
    }

    fn get_collection_info(&self, cid: CollectionId) -> CoreResult<CollectionInfo> {
        self.collections
            .read()
            .get(&cid)
            .cloned()
            .ok_or_else(|| CoreError::collection_not_found(cid.to_string()))
    }

    fn create_index(&self, cid: CollectionId, definition: &IndexDefinition) -> CoreResult<()> {
        self.with_collection(cid, |info| {
            info.indexes.retain(|d| d.id != definition.id);
            info.indexes.push(definition.clone());
            info.indexes.sort_by_key(|d| d.id);
        })
    }

    fn drop_index(&self, cid: CollectionId, iid: IndexId) -> CoreResult<()> {
        self.with_collection(cid, |info| info.indexes.retain(|d| d.id != iid))
    }

    fn drop_collection(&self, cid: CollectionId) -> CoreResult<()> {
        self.check_writable()?;
        self.collections
            .write()
            .remove(&cid)
            .map(|_| ())
            .ok_or_else(|| CoreError::collection_not_found(cid.to_string()))
    }

    fn collections(&self) -> CoreResult<Vec<CollectionId>> {
        Ok(self.collections.read().keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CollectionType;

    fn params(cid: u64, name: &str) -> CollectionParameters {
        let mut p = CollectionParameters::new(name, CollectionType::Document);
        p.cid = CollectionId::new(cid);
        p
    }

    #[test]
    fn create_and_load() {
        let engine = InMemoryEngine::new();
        engine.create_collection(&params(1, "a")).unwrap();
        engine
            .create_index(CollectionId::new(1), &IndexDefinition::hash(&["x"], false, false))
            .unwrap();

        let info = engine.get_collection_info(CollectionId::new(1)).unwrap();
        assert_eq!(info.parameters.name, "a");
        assert_eq!(info.indexes.len(), 1);
        assert_eq!(engine.collections().unwrap(), vec![CollectionId::new(1)]);
    }

    #[test]
    fn duplicate_id_rejected() {
        let engine = InMemoryEngine::new();
        engine.create_collection(&params(1, "a")).unwrap();
        assert!(matches!(
            engine.create_collection(&params(1, "b")),
            Err(CoreError::DuplicateName { .. })
        ));
    }

    #[test]
    fn clones_share_state() {
        let engine = InMemoryEngine::new();
        let other = engine.clone();
        engine.create_collection(&params(3, "c")).unwrap();
        other.rename_collection(CollectionId::new(3), "d").unwrap();
        assert_eq!(
            engine.get_collection_info(CollectionId::new(3)).unwrap().parameters.name,
            "d"
        );
    }

    #[test]
    fn injected_failures() {
        let engine = InMemoryEngine::new();
        engine.create_collection(&params(1, "a")).unwrap();
        engine.fail_writes(true);
        assert!(engine.rename_collection(CollectionId::new(1), "b").is_err());
        assert!(engine.get_collection_info(CollectionId::new(1)).is_ok());
        engine.fail_writes(false);
        engine.drop_collection(CollectionId::new(1)).unwrap();
        assert!(matches!(
            engine.get_collection_info(CollectionId::new(1)),
            Err(CoreError::CollectionNotFound { .. })
        ));
    }
}
