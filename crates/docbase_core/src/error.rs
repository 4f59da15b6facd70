//! Error types for docbase core.

use crate::types::{CollectionId, IndexId, Revision};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Coarse classification of a [`CoreError`].
///
/// Callers use this to decide on a policy (retry the transaction, report a
/// client error, abort) without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input; rejected before any lock or index mutation.
    Validation,
    /// Revision mismatch or duplicate key.
    Conflict,
    /// The addressed document, collection or index does not exist.
    NotFound,
    /// Deadlock or lock timeout; retry the whole transaction.
    Concurrency,
    /// Out of memory or key space.
    Resource,
    /// The write-ahead log or the storage engine failed.
    Durability,
    /// A change that would break a placement invariant.
    Invariant,
    /// Unsupported or forbidden operation.
    Internal,
}

/// Errors that can occur in docbase core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] docbase_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Document body or metadata could not be (de)serialized.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// WAL is corrupted or invalid.
    #[error("WAL corruption: {message}")]
    WalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Another process holds the database directory.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// A parameter is out of range or inconsistent.
    #[error("bad parameter: {message}")]
    BadParameter {
        /// Description of the problem.
        message: String,
    },

    /// Collection name does not follow the naming rules.
    #[error("illegal name: {name:?}")]
    IllegalName {
        /// The rejected name.
        name: String,
    },

    /// A collection with this name already exists.
    #[error("duplicate name: {name:?}")]
    DuplicateName {
        /// The clashing name.
        name: String,
    },

    /// Collection not found.
    #[error("collection not found: {name}")]
    CollectionNotFound {
        /// Name or id of the collection.
        name: String,
    },

    /// Index not found.
    #[error("index not found: {id}")]
    IndexNotFound {
        /// The index id that was looked up.
        id: IndexId,
    },

    /// Feature or index type not implemented.
    #[error("not implemented: {message}")]
    NotImplemented {
        /// What was requested.
        message: String,
    },

    /// Operation is not allowed on this object.
    #[error("forbidden: {message}")]
    Forbidden {
        /// Why the operation was refused.
        message: String,
    },

    /// `_from` or `_to` is missing or not a valid document id.
    #[error("invalid edge attribute: {message}")]
    InvalidEdgeAttribute {
        /// Which attribute failed and why.
        message: String,
    },

    /// The document body is not an object.
    #[error("document is not an object")]
    DocumentTypeInvalid,

    /// A selector did not carry a usable `_key`.
    #[error("invalid document handle: {message}")]
    DocumentHandleBad {
        /// Description of the problem.
        message: String,
    },

    /// Key contains characters outside the allowed set or is too long.
    #[error("illegal document key: {key:?}")]
    DocumentKeyBad {
        /// The rejected key.
        key: String,
    },

    /// The key generator does not accept user-supplied keys.
    #[error("collection does not allow user-defined keys: {key:?}")]
    DocumentKeyUnexpected {
        /// The rejected key.
        key: String,
    },

    /// The key generator cannot generate keys and none was supplied.
    #[error("document key missing")]
    DocumentKeyMissing,

    /// `_rev` is present but malformed.
    #[error("illegal document revision: {message}")]
    DocumentRevBad {
        /// Description of the problem.
        message: String,
    },

    /// Document not found.
    #[error("document not found: {key:?}")]
    DocumentNotFound {
        /// The key that was looked up.
        key: String,
    },

    /// A unique index already holds this value.
    #[error("unique constraint violated on index {index} for document {key:?}")]
    UniqueConstraintViolated {
        /// Index that rejected the document.
        index: IndexId,
        /// Key of the rejected document.
        key: String,
    },

    /// Expected revision does not match the stored one.
    #[error("conflict on {key:?}: expected revision {expected}, found {actual}")]
    Conflict {
        /// Document key.
        key: String,
        /// Revision supplied by the caller.
        expected: Revision,
        /// Revision currently stored.
        actual: Revision,
    },

    /// Update or replace would move the document to another shard.
    #[error("must not change sharding attribute {attribute:?}")]
    MustNotChangeShardingAttributes {
        /// The shard key attribute whose value changed.
        attribute: String,
    },

    /// The lock wait graph contains a cycle.
    #[error("deadlock detected while locking collection {collection}")]
    Deadlock {
        /// Collection whose lock was requested.
        collection: CollectionId,
    },

    /// Timed lock acquisition gave up.
    #[error("lock timeout on collection {collection} after {waited_ms} ms")]
    LockTimeout {
        /// Collection whose lock was requested.
        collection: CollectionId,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// A bookkeeping allocation failed.
    #[error("out of memory: {message}")]
    OutOfMemory {
        /// What could not be allocated.
        message: String,
    },

    /// The key generator ran out of keys.
    #[error("out of keys")]
    OutOfKeys,
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a WAL corruption error.
    pub fn wal_corruption(message: impl Into<String>) -> Self {
        Self::WalCorruption {
            message: message.into(),
        }
    }

    /// Creates a bad-parameter error.
    pub fn bad_parameter(message: impl Into<String>) -> Self {
        Self::BadParameter {
            message: message.into(),
        }
    }

    /// Creates a not-implemented error.
    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::NotImplemented {
            message: message.into(),
        }
    }

    /// Creates a forbidden error.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Creates an invalid-edge-attribute error.
    pub fn invalid_edge(message: impl Into<String>) -> Self {
        Self::InvalidEdgeAttribute {
            message: message.into(),
        }
    }

    /// Creates an out-of-memory error.
    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::OutOfMemory {
            message: message.into(),
        }
    }

    /// Creates a document-not-found error.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::DocumentNotFound { key: key.into() }
    }

    /// Creates a collection-not-found error.
    pub fn collection_not_found(name: impl Into<String>) -> Self {
        Self::CollectionNotFound { name: name.into() }
    }

    /// Returns the error's class.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadParameter { .. }
            | Self::IllegalName { .. }
            | Self::InvalidEdgeAttribute { .. }
            | Self::DocumentTypeInvalid
            | Self::DocumentHandleBad { .. }
            | Self::DocumentKeyBad { .. }
            | Self::DocumentKeyUnexpected { .. }
            | Self::DocumentKeyMissing
            | Self::DocumentRevBad { .. } => ErrorKind::Validation,
            Self::Conflict { .. }
            | Self::UniqueConstraintViolated { .. }
            | Self::DuplicateName { .. } => ErrorKind::Conflict,
            Self::DocumentNotFound { .. }
            | Self::CollectionNotFound { .. }
            | Self::IndexNotFound { .. } => ErrorKind::NotFound,
            Self::Deadlock { .. } | Self::LockTimeout { .. } => ErrorKind::Concurrency,
            Self::OutOfMemory { .. } | Self::OutOfKeys => ErrorKind::Resource,
            Self::Storage(_)
            | Self::Io(_)
            | Self::Codec { .. }
            | Self::WalCorruption { .. }
            | Self::ChecksumMismatch { .. } => ErrorKind::Durability,
            Self::MustNotChangeShardingAttributes { .. } => ErrorKind::Invariant,
            Self::NotImplemented { .. } | Self::Forbidden { .. } | Self::DatabaseLocked => {
                ErrorKind::Internal
            }
        }
    }

    /// Returns true if replay must stop instead of skipping the marker.
    #[must_use]
    pub fn aborts_recovery(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory { .. }
                | Self::Storage(_)
                | Self::Io(_)
                | Self::WalCorruption { .. }
                | Self::ChecksumMismatch { .. }
        )
    }

    /// Returns true for a unique-constraint violation.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueConstraintViolated { .. })
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::codec(err.to_string())
    }
}

impl From<std::collections::TryReserveError> for CoreError {
    fn from(err: std::collections::TryReserveError) -> Self {
        Self::out_of_memory(err.to_string())
    }
}
