//! Storage-engine collaborator.
//!
//! The engine persists collection metadata: the parameter block and the
//! definitions of secondary indexes. Document data lives in the WAL; the
//! engine never sees it.
//!
//! [`InMemoryEngine`] keeps everything in a map and is what tests use.
//! [`FileEngine`] lays metadata out on disk as
//!
//! ```text
//! <root>/
//! ├─ LOCK                      # exclusive while the engine is open
//! ├─ journal.wal               # write-ahead log (opened by the database)
//! └─ collection-<cid>/
//!    ├─ parameter.json
//!    └─ index-<iid>.json
//! ```

#[cfg(feature = "std")]
mod file;
mod memory;

#[cfg(feature = "std")]
pub use file::FileEngine;
pub use memory::InMemoryEngine;

use crate::collection::CollectionParameters;
use crate::error::CoreResult;
use crate::index::IndexDefinition;
use crate::types::{CollectionId, IndexId};

/// Persisted metadata of one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionInfo {
    /// Parameter block.
    pub parameters: CollectionParameters,
    /// Secondary index definitions, ordered by id.
    pub indexes: Vec<IndexDefinition>,
}

/// Persistence of collection and index metadata.
pub trait StorageEngine: Send + Sync + std::fmt::Debug {
    /// Stores the metadata of a new collection.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateName` if the id is taken, or an I/O error.
    fn create_collection(&self, parameters: &CollectionParameters) -> CoreResult<()>;

    /// Changes the stored name of a collection.
    ///
    /// # Errors
    ///
    /// Returns `CollectionNotFound` or an I/O error.
    fn rename_collection(&self, cid: CollectionId, name: &str) -> CoreResult<()>;

    /// Overwrites the stored parameter block.
    ///
    /// # Errors
    ///
    /// Returns `CollectionNotFound` or an I/O error.
    fn change_collection(&self, parameters: &CollectionParameters) -> CoreResult<()>;

    /// Loads the metadata of a collection.
    ///
    /// # Errors
    ///
    /// Returns `CollectionNotFound`, a codec error or an I/O error.
    fn get_collection_info(&self, cid: CollectionId) -> CoreResult<CollectionInfo>;

    /// Stores an index definition.
    ///
    /// # Errors
    ///
    /// Returns `CollectionNotFound` or an I/O error.
    fn create_index(&self, cid: CollectionId, definition: &IndexDefinition) -> CoreResult<()>;

    /// Removes an index definition. Removing an unknown index succeeds.
    ///
    /// # Errors
    ///
    /// Returns `CollectionNotFound` or an I/O error.
    fn drop_index(&self, cid: CollectionId, iid: IndexId) -> CoreResult<()>;

    /// Removes all metadata of a collection.
    ///
    /// # Errors
    ///
    /// Returns `CollectionNotFound` or an I/O error.
    fn drop_collection(&self, cid: CollectionId) -> CoreResult<()>;

    /// Ids of all stored collections, ascending.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the listing fails.
    fn collections(&self) -> CoreResult<Vec<CollectionId>>;
}
