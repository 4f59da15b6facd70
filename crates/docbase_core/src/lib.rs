//! # docbase core
//!
//! Transactional document storage core.
//!
//! This crate provides:
//! - Collection locks with deadlock detection
//! - Document keys and hybrid-logical-clock revisions
//! - Primary and secondary indexes (hash, skiplist, edge, geo, fulltext)
//! - The insert/update/replace/remove pipeline with undo on failure
//! - A write-ahead log and recovery replay
//! - Metadata persistence through a pluggable [`StorageEngine`]
//!
//! ## Example
//!
//! ```rust
//! use docbase_core::{CollectionParameters, CollectionType, Database, OperationOptions};
//! use serde_json::json;
//!
//! let db = Database::open_in_memory().unwrap();
//! let users = db
//!     .create_collection(CollectionParameters::new("users", CollectionType::Document))
//!     .unwrap();
//! let trx = db.begin_transaction();
//! let result = users
//!     .insert(&trx, json!({"_key": "alice", "age": 31}), &OperationOptions::default())
//!     .unwrap();
//! assert_eq!(result.id, format!("{}/alice", users.id().as_u64()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod collection;
mod config;
mod database;
pub mod document;
pub mod engine;
mod error;
pub mod handle;
pub mod index;
pub mod keygen;
pub mod lock;
pub mod recovery;
mod transaction;
mod types;
pub mod wal;

pub use clock::RevisionClock;
pub use collection::{
    Collection, CollectionParameters, DocumentOperation, DocumentSelector, Figures,
    OperationKind, OperationOptions, OperationResult,
};
pub use config::{ServerRole, StoreConfig, DEFAULT_LOCK_TIMEOUT};
pub use database::Database;
pub use document::Document;
pub use engine::{CollectionInfo, InMemoryEngine, StorageEngine};
#[cfg(feature = "std")]
pub use engine::FileEngine;
pub use error::{CoreError, CoreResult, ErrorKind};
pub use index::{IndexDefinition, IndexDescriptor, IndexKind, IndexLookup};
pub use keygen::{KeyGenerator, KeyGeneratorKind, KeyOptions};
pub use lock::{CollectionLock, DeadlockDetector, LockMode};
pub use recovery::{RecoveryReplayer, RecoveryStats};
pub use transaction::Transaction;
pub use types::{CollectionId, CollectionType, FileId, IndexId, Revision, Tick, TransactionId};
pub use wal::{WalManager, WalRecord};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
