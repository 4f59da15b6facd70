//! Collections: parameters, document pipeline and index management.
//!
//! A [`Collection`] owns its primary index, its secondary indexes and the
//! per-datafile statistics behind one [`CollectionLock`]. Document
//! mutations go through [`Collection::execute`]; recovery rebuilds the
//! in-memory state from the log through [`RecoveryReplayer`](crate::recovery::RecoveryReplayer).
//!
//! Two locks are involved. The [`CollectionLock`] is the transactional
//! reader/writer lock that takes part in deadlock detection and can be held
//! across calls by a [`Transaction`]. The internal state lock is only held
//! for the duration of one call.

mod figures;
mod operation;
mod parameters;
mod pipeline;

pub use figures::{
    aligned_size, CompactionStatus, CountAndSize, DatafileStatistics, DatafileStatisticsMap,
    DeadFigures, Figures,
};
pub use operation::{
    DocumentOperation, DocumentSelector, OperationKind, OperationOptions, OperationResult,
};
pub use parameters::{
    is_allowed_name, round_to_page, CollectionParameters, DEFAULT_INDEX_BUCKETS,
    DEFAULT_MAXIMAL_SIZE, JOURNAL_MINIMAL_SIZE, MAX_INDEX_BUCKETS, MAX_NAME_LENGTH, PAGE_SIZE,
    PARAMETERS_VERSION,
};

pub(crate) use operation::OperationRecord;

use crate::clock::RevisionClock;
use crate::config::StoreConfig;
use crate::document::Document;
use crate::engine::{CollectionInfo, StorageEngine};
use crate::error::{CoreError, CoreResult};
use crate::index::{
    create_index, fill_index, fill_indexes, EdgeIndex, FillPolicy, Index, IndexDefinition,
    IndexDescriptor, IndexKind, IndexLookup, IndexRegistry,
};
use crate::keygen::KeyGenerator;
use crate::lock::{CollectionLock, DeadlockDetector, LockGuard, LockMode};
use crate::transaction::Transaction;
use crate::types::{CollectionId, CollectionType, IndexId, Revision, Tick};
use crate::wal::{WalManager, WalRecord};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Id of the edge index of an edge collection.
pub const EDGE_INDEX_ID: IndexId = IndexId::new(1);

/// Database-wide services every collection shares.
#[derive(Debug, Clone)]
pub(crate) struct Services {
    pub(crate) detector: Arc<DeadlockDetector>,
    pub(crate) clock: Arc<RevisionClock>,
    pub(crate) wal: Arc<WalManager>,
    pub(crate) engine: Arc<dyn StorageEngine>,
    pub(crate) config: Arc<StoreConfig>,
}

/// In-memory state guarded by the collection's state lock.
#[derive(Debug)]
pub(crate) struct CollectionState {
    pub(crate) indexes: IndexRegistry,
    pub(crate) statistics: DatafileStatisticsMap,
    /// Highest revision stored in this collection.
    pub(crate) revision: Revision,
    /// Tick of the newest document, deletion or index marker.
    pub(crate) last_tick: Tick,
    /// Secondary indexes whose definitions are loaded but which have not
    /// been populated yet.
    pub(crate) unfilled: Vec<Box<dyn Index>>,
}

impl CollectionState {
    fn new() -> Self {
        Self {
            indexes: IndexRegistry::new(),
            statistics: DatafileStatisticsMap::new(),
            revision: Revision::default(),
            last_tick: Tick::default(),
            unfilled: Vec::new(),
        }
    }

    fn next_index_id(&self) -> IndexId {
        let pending = self.unfilled.iter().map(|i| i.id()).max();
        let max = pending.map_or(self.indexes.max_id(), |p| p.max(self.indexes.max_id()));
        IndexId::new(max.as_u64() + 1)
    }
}

/// A document or edge collection.
pub struct Collection {
    cid: CollectionId,
    parameters: RwLock<CollectionParameters>,
    lock: CollectionLock,
    state: RwLock<CollectionState>,
    key_generator: KeyGenerator,
    clock: Arc<RevisionClock>,
    wal: Arc<WalManager>,
    engine: Arc<dyn StorageEngine>,
    config: Arc<StoreConfig>,
    compaction: Mutex<Option<CompactionStatus>>,
}

fn build_index(definition: &IndexDefinition, buckets: usize) -> CoreResult<Box<dyn Index>> {
    match definition.kind {
        IndexKind::Edge => Ok(Box::new(EdgeIndex::new(definition.id))),
        _ => create_index(definition, buckets),
    }
}

impl Collection {
    fn with_state(
        mut parameters: CollectionParameters,
        state: CollectionState,
        services: Services,
    ) -> CoreResult<Self> {
        let key_generator = match &parameters.key_options {
            Some(options) => KeyGenerator::from_options(options)?,
            None => KeyGenerator::default(),
        };
        parameters.key_options = Some(key_generator.to_options());
        let lock = CollectionLock::new(
            parameters.cid,
            services.detector,
            services.config.lock_timeout,
            services.config.deadlock_check_interval,
        );
        Ok(Self {
            cid: parameters.cid,
            parameters: RwLock::new(parameters),
            lock,
            state: RwLock::new(state),
            key_generator,
            clock: services.clock,
            wal: services.wal,
            engine: services.engine,
            config: services.config,
            compaction: Mutex::new(None),
        })
    }

    /// Builds a new, empty collection. Edge collections get their edge
    /// index right away.
    pub(crate) fn create(parameters: CollectionParameters, services: Services) -> CoreResult<Self> {
        let mut state = CollectionState::new();
        if parameters.collection_type == CollectionType::Edge {
            state.indexes.add(Box::new(EdgeIndex::new(EDGE_INDEX_ID)))?;
        }
        Self::with_state(parameters, state, services)
    }

    /// Builds a collection from stored metadata. Secondary indexes are
    /// created empty and populated after replay.
    pub(crate) fn open(info: CollectionInfo, services: Services) -> CoreResult<Self> {
        let buckets = info.parameters.index_buckets as usize;
        let mut state = CollectionState::new();
        if info.parameters.collection_type == CollectionType::Edge {
            state.unfilled.push(Box::new(EdgeIndex::new(EDGE_INDEX_ID)));
        }
        for definition in &info.indexes {
            if definition.id.is_primary() || definition.kind == IndexKind::Edge {
                continue;
            }
            state.unfilled.push(build_index(definition, buckets)?);
        }
        debug!(
            collection = %info.parameters.name,
            indexes = state.unfilled.len(),
            "collection opened"
        );
        Self::with_state(info.parameters, state, services)
    }

    /// Collection id.
    #[must_use]
    pub fn id(&self) -> CollectionId {
        self.cid
    }

    /// Current name.
    #[must_use]
    pub fn name(&self) -> String {
        self.parameters.read().name.clone()
    }

    /// Document or edge.
    #[must_use]
    pub fn collection_type(&self) -> CollectionType {
        self.parameters.read().collection_type
    }

    /// The transactional collection lock.
    #[must_use]
    pub fn lock(&self) -> &CollectionLock {
        &self.lock
    }

    /// The key generator.
    #[must_use]
    pub fn key_generator(&self) -> &KeyGenerator {
        &self.key_generator
    }

    /// Highest revision stored in this collection.
    #[must_use]
    pub fn revision(&self) -> Revision {
        self.state.read().revision
    }

    /// Whether the collection was dropped.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.parameters.read().deleted
    }

    pub(crate) fn state(&self) -> &RwLock<CollectionState> {
        &self.state
    }

    pub(crate) fn clock(&self) -> &RevisionClock {
        &self.clock
    }

    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Takes the collection lock unless `trx` already holds it.
    pub(crate) fn guard(&self, trx: &Transaction, mode: LockMode) -> CoreResult<LockGuard<'_>> {
        let skip = trx.skips_lock(self.cid);
        self.lock
            .guard_timed(mode, skip, Duration::ZERO, self.config.lock_poll_interval)
    }

    fn fill_policy(&self) -> FillPolicy {
        FillPolicy::new(&self.config, self.parameters.read().index_buckets as usize)
    }

    /// Populates and registers indexes whose definitions were loaded at
    /// open time.
    pub(crate) fn fill_pending(&self, state: &mut CollectionState) -> CoreResult<()> {
        if state.unfilled.is_empty() {
            return Ok(());
        }
        let mut pending = std::mem::take(&mut state.unfilled);
        if let Err(err) = fill_indexes(&mut pending, state.indexes.primary(), self.fill_policy()) {
            // partially filled indexes are rebuilt empty for the next try
            let buckets = self.parameters.read().index_buckets as usize;
            for index in &pending {
                state.unfilled.push(build_index(&index.definition(), buckets)?);
            }
            warn!(collection = %self.name(), error = %err, "index population failed");
            return Err(err);
        }
        let filled = pending.len();
        for index in pending {
            state.indexes.add(index)?;
        }
        info!(
            collection = %self.name(),
            indexes = filled,
            documents = state.indexes.primary().count(),
            "secondary indexes populated"
        );
        Ok(())
    }

    fn ensure_filled(&self) -> CoreResult<()> {
        if self.state.read().unfilled.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write();
        self.fill_pending(&mut state)
    }

    /// Returns the parameter block, with the key generator state folded in.
    #[must_use]
    pub fn properties(&self) -> CollectionParameters {
        let mut parameters = self.parameters.read().clone();
        parameters.key_options = Some(self.key_generator.to_options());
        parameters
    }

    /// Changes `doCompact`, `waitForSync`, `journalSize`/`maximalSize` and
    /// `indexBuckets`, persisting the result.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` for an invalid patch, or the engine error;
    /// the stored parameters are unchanged in both cases.
    pub fn update_properties(&self, patch: &Value) -> CoreResult<CollectionParameters> {
        let mut parameters = self.parameters.write();
        let mut updated = parameters.clone();
        updated.apply_patch(patch)?;
        updated.key_options = Some(self.key_generator.to_options());
        self.engine.change_collection(&updated)?;
        *parameters = updated.clone();
        debug!(collection = %updated.name, "collection properties changed");
        Ok(updated)
    }

    /// Persists the current document count ahead of unloading.
    ///
    /// # Errors
    ///
    /// Returns the engine error.
    pub fn unload(&self) -> CoreResult<()> {
        let count = self.state.read().indexes.primary().count();
        let mut parameters = self.parameters.write();
        let mut updated = parameters.clone();
        updated.count = i64::try_from(count).unwrap_or(i64::MAX);
        updated.key_options = Some(self.key_generator.to_options());
        self.engine.change_collection(&updated)?;
        *parameters = updated;
        debug!(collection = %parameters.name, count, "collection unloaded");
        Ok(())
    }

    pub(crate) fn set_name(&self, name: &str) {
        self.parameters.write().name = name.to_string();
    }

    pub(crate) fn mark_deleted(&self) {
        self.parameters.write().deleted = true;
    }

    /// Records a compactor message for [`figures`](Self::figures).
    pub fn set_compaction_status(&self, message: impl Into<String>) {
        *self.compaction.lock() = Some(CompactionStatus::now(message));
    }

    /// Snapshot of the collection's counters.
    #[must_use]
    pub fn figures(&self) -> Figures {
        let state = self.state.read();
        let totals = state.statistics.all();
        let index_count = state.indexes.len() + state.unfilled.len();
        let index_memory = state.indexes.memory_usage()
            + state.unfilled.iter().map(|i| i.memory_usage()).sum::<usize>();
        Figures {
            alive: CountAndSize {
                count: totals.number_alive,
                size: totals.size_alive,
            },
            dead: DeadFigures {
                count: totals.number_dead,
                size: totals.size_dead,
                deletion: totals.number_deletions,
            },
            indexes: CountAndSize {
                count: i64::try_from(index_count).unwrap_or(i64::MAX),
                size: i64::try_from(index_memory).unwrap_or(i64::MAX),
            },
            uncollected_logfile_entries: self.wal.uncollected_entries(self.cid),
            last_tick: state.last_tick,
            document_count: state.indexes.primary().count(),
            datafiles: state.statistics.len(),
            compaction_status: self.compaction.lock().clone(),
        }
    }

    /// Per-datafile statistics.
    #[must_use]
    pub fn datafile_statistics(&self) -> DatafileStatisticsMap {
        self.state.read().statistics.clone()
    }

    /// Descriptors of all indexes, primary first.
    ///
    /// # Errors
    ///
    /// Returns the error of a deferred index population.
    pub fn indexes(&self) -> CoreResult<Vec<IndexDescriptor>> {
        self.ensure_filled()?;
        Ok(self.state.read().indexes.descriptors())
    }

    /// Returns an index equivalent to `definition`, creating, populating
    /// and persisting it if there is none. The flag is true if the index
    /// was created by this call.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` for primary and edge definitions, the first
    /// population error (for instance `UniqueConstraintViolated`), a lock
    /// error, or an engine or log error. Nothing is registered on failure.
    pub fn ensure_index(
        &self,
        trx: &Transaction,
        definition: IndexDefinition,
    ) -> CoreResult<(IndexDescriptor, bool)> {
        let _guard = self.guard(trx, LockMode::Write)?;
        let mut state = self.state.write();
        self.fill_pending(&mut state)?;

        if let Some(existing) = state.indexes.find_matching(&definition) {
            return Ok((IndexDescriptor::of(existing), false));
        }

        let mut definition = definition;
        definition.id = state.next_index_id();
        let mut index = create_index(&definition, self.parameters.read().index_buckets as usize)?;
        let mode = fill_index(index.as_mut(), state.indexes.primary(), self.fill_policy())?;

        self.engine.create_index(self.cid, &definition)?;
        let marker = WalRecord::CreateIndex {
            tick: Tick::default(),
            cid: self.cid,
            iid: definition.id,
            definition: definition.clone(),
        };
        let tick = match self.wal.append(marker) {
            Ok(tick) => tick,
            Err(err) => {
                if let Err(undo) = self.engine.drop_index(self.cid, definition.id) {
                    warn!(
                        index = %definition.id,
                        error = %undo,
                        "rollback of index creation failed"
                    );
                }
                return Err(err);
            }
        };

        let descriptor = IndexDescriptor::of(index.as_ref());
        state.indexes.add(index)?;
        state.last_tick = state.last_tick.max(tick);
        info!(
            collection = %self.name(),
            index = %definition.id,
            kind = definition.kind.as_str(),
            ?mode,
            entries = descriptor.entries,
            "index created"
        );
        Ok((descriptor, true))
    }

    /// Drops a secondary index. Returns false for the primary index.
    ///
    /// # Errors
    ///
    /// Returns `IndexNotFound`, `Forbidden` for the edge index, a lock
    /// error, or an engine or log error; the index stays registered on
    /// failure.
    pub fn drop_index(&self, trx: &Transaction, iid: IndexId) -> CoreResult<bool> {
        if iid.is_primary() {
            return Ok(false);
        }
        let _guard = self.guard(trx, LockMode::Write)?;
        let mut state = self.state.write();
        self.fill_pending(&mut state)?;

        let index = state
            .indexes
            .lookup(iid)
            .ok_or(CoreError::IndexNotFound { id: iid })?;
        if !index.can_be_dropped() {
            return Err(CoreError::forbidden(format!(
                "{} index {iid} cannot be dropped",
                index.kind().as_str()
            )));
        }
        let Some(index) = state.indexes.remove(iid) else {
            return Err(CoreError::IndexNotFound { id: iid });
        };
        let definition = index.definition();

        if let Err(err) = self.engine.drop_index(self.cid, iid) {
            if let Err(undo) = state.indexes.add(index) {
                warn!(index = %iid, error = %undo, "rollback of index drop failed");
            }
            return Err(err);
        }
        let marker = WalRecord::DropIndex {
            tick: Tick::default(),
            cid: self.cid,
            iid,
        };
        match self.wal.append(marker) {
            Ok(tick) => {
                state.last_tick = state.last_tick.max(tick);
                info!(collection = %self.name(), index = %iid, "index dropped");
                Ok(true)
            }
            Err(err) => {
                if let Err(undo) = self.engine.create_index(self.cid, &definition) {
                    warn!(index = %iid, error = %undo, "rollback of index drop failed");
                }
                if let Err(undo) = state.indexes.add(index) {
                    warn!(index = %iid, error = %undo, "rollback of index drop failed");
                }
                Err(err)
            }
        }
    }

    /// Documents matching `query` on index `iid`.
    ///
    /// # Errors
    ///
    /// Returns `IndexNotFound`, `NotImplemented` for a query the index
    /// kind cannot answer, or a lock error.
    pub fn lookup_by_index(
        &self,
        trx: &Transaction,
        iid: IndexId,
        query: &IndexLookup,
    ) -> CoreResult<Vec<Arc<Document>>> {
        let _guard = self.guard(trx, LockMode::Read)?;
        self.ensure_filled()?;
        let state = self.state.read();
        let index = state
            .indexes
            .lookup(iid)
            .ok_or(CoreError::IndexNotFound { id: iid })?;
        let primary = state.indexes.primary();
        Ok(index
            .lookup(query)?
            .into_iter()
            .filter_map(|handle| primary.handle(handle))
            .map(|handle| Arc::clone(&handle.document))
            .collect())
    }

    /// Runs cleanup on the indexes that need it. Returns how many ran.
    ///
    /// # Errors
    ///
    /// Returns the first cleanup error.
    pub fn cleanup_indexes(&self) -> CoreResult<usize> {
        let mut state = self.state.write();
        if state.indexes.cleanup_count() == 0 {
            return Ok(0);
        }
        let cleaned = state.indexes.cleanup()?;
        debug!(collection = %self.name(), cleaned, "index cleanup done");
        Ok(cleaned)
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parameters = self.parameters.read();
        f.debug_struct("Collection")
            .field("cid", &self.cid)
            .field("name", &parameters.name)
            .field("type", &parameters.collection_type)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::InMemoryEngine;
    use docbase_storage::InMemoryBackend;
    use serde_json::json;

    pub(crate) fn services() -> Services {
        let wal = WalManager::open(Box::new(InMemoryBackend::new()), false, 1 << 20).unwrap();
        Services {
            detector: Arc::new(DeadlockDetector::new()),
            clock: Arc::new(RevisionClock::new()),
            wal: Arc::new(wal),
            engine: Arc::new(InMemoryEngine::new()),
            config: Arc::new(StoreConfig::default()),
        }
    }

    pub(crate) fn collection(name: &str, collection_type: CollectionType) -> Collection {
        let services = services();
        let mut parameters = CollectionParameters::new(name, collection_type);
        parameters.cid = CollectionId::new(100);
        services.engine.create_collection(&parameters).unwrap();
        Collection::create(parameters, services).unwrap()
    }

    #[test]
    fn edge_collections_get_an_edge_index() {
        let edges = collection("links", CollectionType::Edge);
        let trx = Transaction::new(crate::types::TransactionId::new(1));
        let indexes = edges.indexes().unwrap();
        assert_eq!(indexes.len(), 2);
        assert_eq!(indexes[1].definition.kind, IndexKind::Edge);
        assert!(matches!(
            edges.drop_index(&trx, EDGE_INDEX_ID),
            Err(CoreError::Forbidden { .. })
        ));
        assert!(!edges.drop_index(&trx, IndexId::PRIMARY).unwrap());
    }

    #[test]
    fn ensure_index_is_idempotent() {
        let users = collection("users", CollectionType::Document);
        let trx = Transaction::new(crate::types::TransactionId::new(1));
        let (first, created) = users
            .ensure_index(&trx, IndexDefinition::hash(&["a", "b"], false, false))
            .unwrap();
        assert!(created);
        let (second, created) = users
            .ensure_index(&trx, IndexDefinition::hash(&["b", "a"], false, false))
            .unwrap();
        assert!(!created);
        assert_eq!(first.id(), second.id());
        assert_eq!(users.indexes().unwrap().len(), 2);
    }

    #[test]
    fn dropping_unknown_index_fails() {
        let users = collection("users", CollectionType::Document);
        let trx = Transaction::new(crate::types::TransactionId::new(1));
        assert!(matches!(
            users.drop_index(&trx, IndexId::new(42)),
            Err(CoreError::IndexNotFound { .. })
        ));
    }

    #[test]
    fn lookup_through_secondary_index() {
        let users = collection("users", CollectionType::Document);
        let trx = Transaction::new(crate::types::TransactionId::new(1));
        let options = OperationOptions::default();
        for (key, city) in [("a", "Oslo"), ("b", "Rome"), ("c", "Oslo")] {
            users
                .insert(&trx, json!({"_key": key, "city": city}), &options)
                .unwrap();
        }
        let (index, _) = users
            .ensure_index(&trx, IndexDefinition::skiplist(&["city"], false, false))
            .unwrap();
        let found = users
            .lookup_by_index(&trx, index.id(), &IndexLookup::Equal(vec![json!("Oslo")]))
            .unwrap();
        let mut keys: Vec<_> = found.iter().filter_map(|d| d.key()).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["a", "c"]);
    }

    #[test]
    fn update_properties_validates_and_persists() {
        let users = collection("users", CollectionType::Document);
        let updated = users
            .update_properties(&json!({"waitForSync": true, "indexBuckets": 16}))
            .unwrap();
        assert!(updated.wait_for_sync);
        assert_eq!(updated.index_buckets, 16);
        assert!(users
            .update_properties(&json!({"indexBuckets": 3}))
            .is_err());
        assert_eq!(users.properties().index_buckets, 16);
    }

    #[test]
    fn figures_track_alive_and_dead() {
        let users = collection("users", CollectionType::Document);
        let trx = Transaction::new(crate::types::TransactionId::new(1));
        let options = OperationOptions::default();
        users.insert(&trx, json!({"_key": "a", "n": 1}), &options).unwrap();
        users.insert(&trx, json!({"_key": "b", "n": 1}), &options).unwrap();
        users
            .update(&trx, DocumentSelector::key("a"), json!({"n": 2}), &options)
            .unwrap();
        users.remove(&trx, DocumentSelector::key("b"), &options).unwrap();

        let figures = users.figures();
        assert_eq!(figures.document_count, 1);
        assert_eq!(figures.alive.count, 1);
        assert_eq!(figures.dead.count, 2);
        assert_eq!(figures.dead.deletion, 1);
        assert_eq!(figures.uncollected_logfile_entries, 4);
        assert!(figures.last_tick > Tick::default());
        assert!(figures.compaction_status.is_none());

        users.set_compaction_status("nothing to compact");
        assert_eq!(
            users.figures().compaction_status.unwrap().message,
            "nothing to compact"
        );
    }

    #[test]
    fn unload_persists_count() {
        let services = services();
        let engine = Arc::clone(&services.engine);
        let mut parameters = CollectionParameters::new("users", CollectionType::Document);
        parameters.cid = CollectionId::new(7);
        engine.create_collection(&parameters).unwrap();
        let users = Collection::create(parameters, services).unwrap();
        let trx = Transaction::new(crate::types::TransactionId::new(1));
        users
            .insert(&trx, json!({"name": "x"}), &OperationOptions::default())
            .unwrap();
        users.unload().unwrap();
        let stored = engine.get_collection_info(CollectionId::new(7)).unwrap();
        assert_eq!(stored.parameters.count, 1);
        assert!(stored.parameters.key_options.unwrap().last_value.is_some());
    }
}
