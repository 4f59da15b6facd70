//! Database facade and recovery.

use crate::clock::RevisionClock;
use crate::collection::{is_allowed_name, Collection, CollectionParameters, Services};
use crate::config::StoreConfig;
use crate::engine::{InMemoryEngine, StorageEngine};
use crate::error::{CoreError, CoreResult};
use crate::lock::DeadlockDetector;
use crate::recovery::{RecoveryReplayer, RecoveryStats};
use crate::transaction::Transaction;
use crate::types::{CollectionId, FileId, Tick, TransactionId};
use crate::wal::{WalManager, WalRecord};
use docbase_storage::{InMemoryBackend, StorageBackend};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The main database handle.
///
/// `Database` owns the services every collection shares: the deadlock
/// detector, the revision clock, the write-ahead log and the storage
/// engine. It provides:
/// - Collection management (create, rename, drop)
/// - Transactions
/// - Recovery of every collection at open time
///
/// # Opening a Database
///
/// ```rust,ignore
/// use docbase_core::{Database, StoreConfig};
/// use std::path::Path;
///
/// let db = Database::open_dir(Path::new("my_database"), StoreConfig::default())?;
/// let users = db.create_collection(CollectionParameters::new("users", CollectionType::Document))?;
/// let trx = db.begin_transaction();
/// users.insert(&trx, json!({"name": "alice"}), &OperationOptions::default())?;
/// ```
///
/// # In-Memory Databases
///
/// For testing, use `Database::open_in_memory()`.
pub struct Database {
    /// Configuration.
    config: Arc<StoreConfig>,
    /// Shared by every collection lock.
    detector: Arc<DeadlockDetector>,
    /// Revision source of every collection.
    clock: Arc<RevisionClock>,
    /// WAL manager.
    wal: Arc<WalManager>,
    /// Metadata persistence.
    engine: Arc<dyn StorageEngine>,
    /// Live collections by name.
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    next_cid: AtomicU64,
    next_tid: AtomicU64,
    /// Replay results of the open call, by collection name.
    recovery: Vec<(String, RecoveryStats)>,
}

impl Database {
    /// Opens a database over a log backend and a storage engine, replaying
    /// the log into every collection the engine knows.
    ///
    /// Collections marked deleted are removed from the engine and not
    /// loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the log is corrupt (`ChecksumMismatch`, `WalCorruption`)
    /// - stored metadata cannot be read
    /// - replay runs out of memory
    /// - a secondary index cannot be populated
    pub fn open(
        config: StoreConfig,
        wal_backend: Box<dyn StorageBackend>,
        engine: Arc<dyn StorageEngine>,
    ) -> CoreResult<Self> {
        let config = Arc::new(config);
        let wal = Arc::new(WalManager::open(
            wal_backend,
            config.sync_on_write,
            config.logfile_size,
        )?);
        let detector = Arc::new(DeadlockDetector::new());
        let clock = Arc::new(RevisionClock::new());
        let services = Services {
            detector: Arc::clone(&detector),
            clock: Arc::clone(&clock),
            wal: Arc::clone(&wal),
            engine: Arc::clone(&engine),
            config: Arc::clone(&config),
        };

        let mut max_cid = 0;
        let mut loaded = Vec::new();
        for cid in engine.collections()? {
            max_cid = max_cid.max(cid.as_u64());
            let info = engine.get_collection_info(cid)?;
            if info.parameters.deleted {
                debug!(%cid, name = %info.parameters.name, "removing deleted collection");
                if let Err(err) = engine.drop_collection(cid) {
                    warn!(%cid, error = %err, "cannot remove deleted collection");
                }
                continue;
            }
            loaded.push(Arc::new(Collection::open(info, services.clone())?));
        }

        let mut max_tid = 0;
        let mut recovery = Vec::with_capacity(loaded.len());
        {
            let mut replayers: BTreeMap<CollectionId, RecoveryReplayer<'_>> = loaded
                .iter()
                .map(|c| (c.id(), RecoveryReplayer::new(c)))
                .collect();
            let mut fid = FileId::default();
            wal.for_each_streaming(|_, record| {
                match &record {
                    WalRecord::LogfileHeader { fid: opened, .. } => fid = *opened,
                    WalRecord::Document { tid, .. } | WalRecord::Tombstone { tid, .. } => {
                        max_tid = max_tid.max(tid.as_u64());
                    }
                    _ => {}
                }
                if let Some(cid) = record.collection() {
                    // markers of dropped collections keep their ids taken
                    max_cid = max_cid.max(cid.as_u64());
                    if let Some(replayer) = replayers.get_mut(&cid) {
                        replayer.apply(&record, fid)?;
                    }
                }
                Ok(true)
            })?;
            for (cid, replayer) in replayers {
                let stats = replayer.finish()?;
                if let Some(collection) = loaded.iter().find(|c| c.id() == cid) {
                    recovery.push((collection.name(), stats));
                }
            }
        }

        let collections = loaded
            .into_iter()
            .map(|c| (c.name(), c))
            .collect::<HashMap<_, _>>();
        info!(
            collections = collections.len(),
            last_tick = %wal.last_tick(),
            "database opened"
        );
        Ok(Self {
            config,
            detector,
            clock,
            wal,
            engine,
            collections: RwLock::new(collections),
            next_cid: AtomicU64::new(max_cid + 1),
            next_tid: AtomicU64::new(max_tid + 1),
            recovery,
        })
    }

    /// Opens an empty in-memory database.
    ///
    /// # Errors
    ///
    /// Does not fail in practice; the signature matches [`open`](Self::open).
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open(
            StoreConfig::default(),
            Box::new(InMemoryBackend::new()),
            Arc::new(InMemoryEngine::new()),
        )
    }

    /// Opens (or creates) a database directory: metadata through a
    /// [`FileEngine`](crate::engine::FileEngine), the log in
    /// `journal.wal`.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseLocked` if another process has the directory open,
    /// or any error of [`open`](Self::open).
    #[cfg(feature = "std")]
    pub fn open_dir(path: &std::path::Path, config: StoreConfig) -> CoreResult<Self> {
        let engine = crate::engine::FileEngine::open(path)?;
        let backend = docbase_storage::FileBackend::open(&engine.wal_path())?;
        Self::open(config, Box::new(backend), Arc::new(engine))
    }

    /// Creates a collection with a fresh id.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` or `IllegalName` for invalid parameters,
    /// `DuplicateName` if the name is taken, or an engine or log error (in
    /// which case nothing is left behind).
    pub fn create_collection(
        &self,
        parameters: CollectionParameters,
    ) -> CoreResult<Arc<Collection>> {
        let mut parameters = parameters;
        parameters.validate(false)?;
        parameters.deleted = false;

        let mut collections = self.collections.write();
        if collections.contains_key(&parameters.name) {
            return Err(CoreError::DuplicateName {
                name: parameters.name,
            });
        }
        let cid = CollectionId::new(self.next_cid.fetch_add(1, Ordering::SeqCst));
        parameters.cid = cid;

        let collection = Arc::new(Collection::create(parameters, self.services())?);
        self.engine.create_collection(&collection.properties())?;
        let header = WalRecord::CollectionHeader {
            tick: Tick::default(),
            cid,
        };
        if let Err(err) = self.wal.append(header) {
            if let Err(undo) = self.engine.drop_collection(cid) {
                warn!(%cid, error = %undo, "rollback of collection creation failed");
            }
            return Err(err);
        }

        let name = collection.name();
        info!(collection = %name, %cid, kind = ?collection.collection_type(), "collection created");
        collections.insert(name, Arc::clone(&collection));
        Ok(collection)
    }

    /// Looks up a collection by name.
    ///
    /// # Errors
    ///
    /// Returns `CollectionNotFound`.
    pub fn collection(&self, name: &str) -> CoreResult<Arc<Collection>> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::collection_not_found(name))
    }

    /// Looks up a collection by id.
    ///
    /// # Errors
    ///
    /// Returns `CollectionNotFound`.
    pub fn collection_by_id(&self, cid: CollectionId) -> CoreResult<Arc<Collection>> {
        self.collections
            .read()
            .values()
            .find(|c| c.id() == cid)
            .cloned()
            .ok_or_else(|| CoreError::collection_not_found(cid.to_string()))
    }

    /// All live collections, sorted by name.
    #[must_use]
    pub fn collections(&self) -> Vec<Arc<Collection>> {
        let mut all: Vec<_> = self.collections.read().values().cloned().collect();
        all.sort_by_key(|c| c.name());
        all
    }

    /// Renames a collection.
    ///
    /// # Errors
    ///
    /// Returns `CollectionNotFound`, `IllegalName`, `DuplicateName`, or the
    /// engine error, in which case the old name is kept.
    pub fn rename_collection(&self, old_name: &str, new_name: &str) -> CoreResult<()> {
        let mut collections = self.collections.write();
        let collection = collections
            .get(old_name)
            .cloned()
            .ok_or_else(|| CoreError::collection_not_found(old_name))?;
        if old_name == new_name {
            return Ok(());
        }
        if !is_allowed_name(collection.properties().is_system, new_name) {
            return Err(CoreError::IllegalName {
                name: new_name.to_string(),
            });
        }
        if collections.contains_key(new_name) {
            return Err(CoreError::DuplicateName {
                name: new_name.to_string(),
            });
        }

        collection.set_name(new_name);
        if let Err(err) = self.engine.rename_collection(collection.id(), new_name) {
            collection.set_name(old_name);
            return Err(err);
        }
        collections.remove(old_name);
        collections.insert(new_name.to_string(), collection);
        info!(from = old_name, to = new_name, "collection renamed");
        Ok(())
    }

    /// Drops a collection. System collections need `force`.
    ///
    /// The collection is first marked deleted in the engine, so an
    /// interrupted drop finishes at the next open.
    ///
    /// # Errors
    ///
    /// Returns `CollectionNotFound`, `Forbidden`, or an engine error.
    pub fn drop_collection(&self, name: &str, force: bool) -> CoreResult<()> {
        let mut collections = self.collections.write();
        let collection = collections
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::collection_not_found(name))?;
        let mut parameters = collection.properties();
        if parameters.is_system && !force {
            return Err(CoreError::forbidden(format!(
                "cannot drop system collection {name:?}"
            )));
        }

        parameters.deleted = true;
        self.engine.change_collection(&parameters)?;
        collection.mark_deleted();
        collections.remove(name);
        self.wal.forget_collection(collection.id());
        self.engine.drop_collection(collection.id())?;
        info!(collection = name, cid = %collection.id(), "collection dropped");
        Ok(())
    }

    /// Starts a transaction with a fresh id.
    #[must_use]
    pub fn begin_transaction(&self) -> Transaction {
        Transaction::new(TransactionId::new(
            self.next_tid.fetch_add(1, Ordering::SeqCst),
        ))
    }

    /// Flushes the log and syncs it to durable storage.
    ///
    /// # Errors
    ///
    /// Returns the storage error.
    pub fn flush(&self) -> CoreResult<()> {
        self.wal.flush()
    }

    /// Persists every collection's count, then flushes and syncs the log.
    ///
    /// # Errors
    ///
    /// Returns the first engine or storage error.
    pub fn close(self) -> CoreResult<()> {
        for collection in self.collections() {
            collection.unload()?;
        }
        self.wal.flush()?;
        debug!("database closed");
        Ok(())
    }

    /// The write-ahead log.
    #[must_use]
    pub fn wal(&self) -> &WalManager {
        &self.wal
    }

    /// The storage engine.
    #[must_use]
    pub fn engine(&self) -> &dyn StorageEngine {
        self.engine.as_ref()
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The shared deadlock detector.
    #[must_use]
    pub fn detector(&self) -> &Arc<DeadlockDetector> {
        &self.detector
    }

    /// The shared revision clock.
    #[must_use]
    pub fn clock(&self) -> &RevisionClock {
        &self.clock
    }

    /// Replay results of the open call, by collection name.
    #[must_use]
    pub fn recovery_report(&self) -> &[(String, RecoveryStats)] {
        &self.recovery
    }

    fn services(&self) -> Services {
        Services {
            detector: Arc::clone(&self.detector),
            clock: Arc::clone(&self.clock),
            wal: Arc::clone(&self.wal),
            engine: Arc::clone(&self.engine),
            config: Arc::clone(&self.config),
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("collections", &self.collections.read().len())
            .field("wal", &self.wal)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
