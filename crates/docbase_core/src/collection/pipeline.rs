//! The document mutation pipeline.
//!
//! Every mutation runs `validate → lock → lookup → build → index → log`.
//! Revisions are taken from the clock only once the collection lock is
//! held, so a successor version always carries a larger `_rev` than its
//! predecessor. Index mutations are applied under the lock and the marker is
//! appended last; if the append fails the index mutations are unwound before
//! the error is returned, so callers never see a half-applied operation.

use super::{Collection, CollectionState, DocumentOperation, DocumentSelector, OperationKind};
use super::{OperationOptions, OperationRecord, OperationResult};
use crate::config::ServerRole;
use crate::document::{self, Document};
use crate::error::{CoreError, CoreResult};
use crate::handle::{DocumentHandle, HandleId};
use crate::lock::LockMode;
use crate::transaction::Transaction;
use crate::types::{CollectionType, FileId, IndexId, Revision, Tick};
use crate::wal::{WalPosition, WalRecord};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{trace, warn};

/// Canonical document of an insert, built under the collection lock.
struct PreparedInsert {
    key: String,
    revision: Revision,
    document: Arc<Document>,
    body: Vec<u8>,
}

fn as_object(value: &Value) -> CoreResult<&Map<String, Value>> {
    value.as_object().ok_or(CoreError::DocumentTypeInvalid)
}

fn check_revision(
    selector: &DocumentSelector,
    current: Revision,
    options: &OperationOptions,
) -> CoreResult<()> {
    if options.ignore_revisions {
        return Ok(());
    }
    match selector.revision {
        Some(expected) if expected != current => Err(CoreError::Conflict {
            key: selector.key.clone(),
            expected,
            actual: current,
        }),
        _ => Ok(()),
    }
}

fn current_handle(state: &CollectionState, key: &str) -> CoreResult<(HandleId, DocumentHandle)> {
    let primary = state.indexes.primary();
    let id = primary
        .lookup_key(key)
        .ok_or_else(|| CoreError::not_found(key))?;
    let handle = primary
        .handle(id)
        .cloned()
        .ok_or_else(|| CoreError::not_found(key))?;
    Ok((id, handle))
}

impl Collection {
    /// Runs one document mutation.
    ///
    /// # Errors
    ///
    /// - validation: `DocumentTypeInvalid`, `InvalidEdgeAttribute`,
    ///   `DocumentKeyBad`, `DocumentKeyUnexpected`, `DocumentKeyMissing`
    /// - `UniqueConstraintViolated` for a taken key or unique value
    /// - `DocumentNotFound` and `Conflict` for update, replace and remove
    /// - `MustNotChangeShardingAttributes` on shard servers
    /// - `Deadlock`, `LockTimeout`, `OutOfMemory`, `OutOfKeys`
    /// - log errors, after the index mutations were unwound
    pub fn execute(
        &self,
        trx: &Transaction,
        operation: DocumentOperation,
        options: &OperationOptions,
    ) -> CoreResult<OperationResult> {
        match operation {
            DocumentOperation::Insert(input) => self.run_insert(trx, &input, options),
            DocumentOperation::Update { selector, delta } => {
                self.run_modify(trx, OperationKind::Update, &selector, &delta, options)
            }
            DocumentOperation::Replace { selector, body } => {
                self.run_modify(trx, OperationKind::Replace, &selector, &body, options)
            }
            DocumentOperation::Remove(selector) => self.run_remove(trx, &selector, options),
        }
    }

    /// Stores a new document.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub fn insert(
        &self,
        trx: &Transaction,
        input: Value,
        options: &OperationOptions,
    ) -> CoreResult<OperationResult> {
        self.execute(trx, DocumentOperation::Insert(input), options)
    }

    /// Merges `delta` into the selected document.
    ///
    /// An empty `delta` writes nothing: the result carries the current
    /// revision as both `rev` and `old_rev`, and no tick.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub fn update(
        &self,
        trx: &Transaction,
        selector: DocumentSelector,
        delta: Value,
        options: &OperationOptions,
    ) -> CoreResult<OperationResult> {
        self.execute(trx, DocumentOperation::Update { selector, delta }, options)
    }

    /// Replaces the user attributes of the selected document.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub fn replace(
        &self,
        trx: &Transaction,
        selector: DocumentSelector,
        body: Value,
        options: &OperationOptions,
    ) -> CoreResult<OperationResult> {
        self.execute(trx, DocumentOperation::Replace { selector, body }, options)
    }

    /// Deletes the selected document.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub fn remove(
        &self,
        trx: &Transaction,
        selector: DocumentSelector,
        options: &OperationOptions,
    ) -> CoreResult<OperationResult> {
        self.execute(trx, DocumentOperation::Remove(selector), options)
    }

    /// Reads the current version of `key` through the primary index.
    ///
    /// # Errors
    ///
    /// Returns `DocumentNotFound` or a lock error.
    pub fn read(&self, trx: &Transaction, key: &str) -> CoreResult<Arc<Document>> {
        let _guard = self.guard(trx, LockMode::Read)?;
        let state = self.state.read();
        state
            .indexes
            .primary()
            .get(key)
            .map(|handle| Arc::clone(&handle.document))
            .ok_or_else(|| CoreError::not_found(key))
    }

    /// Reads `key` as a JSON value.
    ///
    /// # Errors
    ///
    /// Same as [`read`](Self::read).
    pub fn document(&self, trx: &Transaction, key: &str) -> CoreResult<Value> {
        self.read(trx, key).map(|doc| doc.to_value())
    }

    /// Number of live documents.
    ///
    /// # Errors
    ///
    /// Returns a lock error.
    pub fn count(&self, trx: &Transaction) -> CoreResult<usize> {
        let _guard = self.guard(trx, LockMode::Read)?;
        Ok(self.state.read().indexes.primary().count())
    }

    /// Keys of all live documents, sorted.
    ///
    /// # Errors
    ///
    /// Returns a lock error.
    pub fn all_keys(&self, trx: &Transaction) -> CoreResult<Vec<String>> {
        let _guard = self.guard(trx, LockMode::Read)?;
        let state = self.state.read();
        let mut keys: Vec<String> = state.indexes.primary().keys().map(str::to_string).collect();
        keys.sort_unstable();
        Ok(keys)
    }

    fn new_revision(&self, input: &Map<String, Value>, options: &OperationOptions) -> Revision {
        match input.get(document::REV) {
            Some(Value::String(text)) if options.is_restore => self.clock.restore(text).0,
            _ => self.clock.next(),
        }
    }

    fn prepare_insert(
        &self,
        input: &Value,
        options: &OperationOptions,
    ) -> CoreResult<PreparedInsert> {
        let input = as_object(input)?;
        let (collection_type, prefix) = {
            let parameters = self.parameters.read();
            let on_shard = self.config.server_role == ServerRole::DbServer;
            (
                parameters.collection_type,
                parameters.document_id_prefix(on_shard),
            )
        };
        let edge = match collection_type {
            CollectionType::Edge => Some(document::edge_ends(input)?),
            CollectionType::Document => None,
        };

        let key = match input.get(document::KEY) {
            Some(Value::String(key)) => {
                self.key_generator.validate(key, options.is_restore)?;
                key.clone()
            }
            Some(other) => {
                return Err(CoreError::DocumentKeyBad {
                    key: other.to_string(),
                })
            }
            None => self.key_generator.generate(self.wal.last_tick().as_u64())?,
        };

        let revision = self.new_revision(input, options);
        let id = format!("{}/{key}", prefix.as_u64());
        let document = document::new_for_insert(input, &key, &id, edge.as_ref(), revision);
        let body = document.encode()?;
        Ok(PreparedInsert {
            key,
            revision,
            document: Arc::new(document),
            body,
        })
    }

    fn run_insert(
        &self,
        trx: &Transaction,
        input: &Value,
        options: &OperationOptions,
    ) -> CoreResult<OperationResult> {
        let _guard = self.guard(trx, LockMode::Write)?;
        let prepared = self.prepare_insert(input, options)?;
        let mut state = self.state.write();
        self.fill_pending(&mut state)?;

        let primary = state.indexes.primary_mut();
        if primary.lookup_key(&prepared.key).is_some() {
            return Err(CoreError::UniqueConstraintViolated {
                index: IndexId::PRIMARY,
                key: prepared.key,
            });
        }
        let handle = primary.allocate(DocumentHandle::new(
            Arc::clone(&prepared.document),
            prepared.revision,
            Tick::default(),
            FileId::default(),
        ))?;
        if let Err(err) = primary.insert_key(&prepared.key, handle) {
            primary.release(handle);
            return Err(err);
        }
        if let Err(err) = state.indexes.insert_secondaries(handle, &prepared.document) {
            let primary = state.indexes.primary_mut();
            primary.remove_key(&prepared.key);
            primary.release(handle);
            return Err(err);
        }

        let marker = WalRecord::Document {
            tick: Tick::default(),
            tid: trx.id(),
            cid: self.cid,
            key: prepared.key.clone(),
            rev: prepared.revision,
            body: prepared.body,
        };
        let record = OperationRecord::new(
            OperationKind::Insert,
            prepared.key.clone(),
            handle,
            None,
            Some(Arc::clone(&prepared.document)),
            prepared.revision,
            marker,
        );
        let sync = self.wants_sync(options);
        let position = self.commit(&mut state, record, sync)?;
        drop(state);
        self.key_generator.track(&prepared.key);

        Ok(OperationResult {
            id: prepared.document.id().unwrap_or_default().to_string(),
            key: prepared.key,
            rev: prepared.revision,
            old_rev: None,
            old: None,
            new: options.return_new.then(|| prepared.document.to_value()),
            tick: Some(position.tick),
        })
    }

    fn run_modify(
        &self,
        trx: &Transaction,
        kind: OperationKind,
        selector: &DocumentSelector,
        input: &Value,
        options: &OperationOptions,
    ) -> CoreResult<OperationResult> {
        let input = as_object(input)?;
        let sharding_guard = self.config.server_role == ServerRole::DbServer;
        let shard_keys = if sharding_guard {
            self.parameters.read().shard_keys.clone()
        } else {
            Vec::new()
        };

        let _guard = self.guard(trx, LockMode::Write)?;
        let mut state = self.state.write();
        self.fill_pending(&mut state)?;

        let (handle, old) = current_handle(&state, &selector.key)?;
        check_revision(selector, old.revision, options)?;

        if kind == OperationKind::Update && document::is_empty_delta(input) {
            trace!(key = %selector.key, "empty update delta, nothing written");
            return Ok(OperationResult {
                key: selector.key.clone(),
                id: old.document.id().unwrap_or_default().to_string(),
                rev: old.revision,
                old_rev: Some(old.revision),
                old: options.return_old.then(|| old.document.to_value()),
                new: options.return_new.then(|| old.document.to_value()),
                tick: None,
            });
        }

        // minted under the lock so successors never sort before predecessors
        let revision = self.new_revision(input, options);
        let updated = match kind {
            OperationKind::Update => {
                document::merge_for_update(&old.document, input, revision, options.merge_policy())
            }
            _ => document::new_for_replace(&old.document, input, revision)?,
        };

        for attribute in &shard_keys {
            let path: Vec<&str> = attribute.split('.').collect();
            if old.document.get_path(&path) != updated.get_path(&path) {
                return Err(CoreError::MustNotChangeShardingAttributes {
                    attribute: attribute.clone(),
                });
            }
        }

        let body = updated.encode()?;
        let updated = Arc::new(updated);

        state.indexes.remove_secondaries(handle, &old.document)?;
        if let Some(slot) = state.indexes.primary_mut().handle_mut(handle) {
            *slot = DocumentHandle::new(Arc::clone(&updated), revision, old.tick, old.fid);
        }
        if let Err(err) = state.indexes.insert_secondaries(handle, &updated) {
            if let Some(slot) = state.indexes.primary_mut().handle_mut(handle) {
                *slot = old.clone();
            }
            state
                .indexes
                .restore_secondaries(usize::MAX, handle, &old.document);
            return Err(err);
        }

        let marker = WalRecord::Document {
            tick: Tick::default(),
            tid: trx.id(),
            cid: self.cid,
            key: selector.key.clone(),
            rev: revision,
            body,
        };
        let old_value = options.return_old.then(|| old.document.to_value());
        let old_rev = old.revision;
        let record = OperationRecord::new(
            kind,
            selector.key.clone(),
            handle,
            Some(old),
            Some(Arc::clone(&updated)),
            revision,
            marker,
        );
        let sync = self.wants_sync(options);
        let position = self.commit(&mut state, record, sync)?;

        Ok(OperationResult {
            key: selector.key.clone(),
            id: updated.id().unwrap_or_default().to_string(),
            rev: revision,
            old_rev: Some(old_rev),
            old: old_value,
            new: options.return_new.then(|| updated.to_value()),
            tick: Some(position.tick),
        })
    }

    fn run_remove(
        &self,
        trx: &Transaction,
        selector: &DocumentSelector,
        options: &OperationOptions,
    ) -> CoreResult<OperationResult> {
        let _guard = self.guard(trx, LockMode::Write)?;
        let mut state = self.state.write();
        self.fill_pending(&mut state)?;

        let (handle, old) = current_handle(&state, &selector.key)?;
        check_revision(selector, old.revision, options)?;
        let revision = self.clock.next();

        state.indexes.remove_secondaries(handle, &old.document)?;
        if state.indexes.primary_mut().remove_key(&selector.key).is_none() {
            state
                .indexes
                .restore_secondaries(usize::MAX, handle, &old.document);
            return Err(CoreError::not_found(selector.key.clone()));
        }

        let marker = WalRecord::Tombstone {
            tick: Tick::default(),
            tid: trx.id(),
            cid: self.cid,
            key: selector.key.clone(),
            rev: revision,
        };
        let id = old.document.id().unwrap_or_default().to_string();
        let old_value = options.return_old.then(|| old.document.to_value());
        let old_rev = old.revision;
        let record = OperationRecord::new(
            OperationKind::Remove,
            selector.key.clone(),
            handle,
            Some(old),
            None,
            revision,
            marker,
        );
        let sync = self.wants_sync(options);
        let position = self.commit(&mut state, record, sync)?;

        Ok(OperationResult {
            key: selector.key.clone(),
            id,
            rev: revision,
            old_rev: Some(old_rev),
            old: old_value,
            new: None,
            tick: Some(position.tick),
        })
    }

    fn wants_sync(&self, options: &OperationOptions) -> bool {
        options.wait_for_sync || self.parameters.read().wait_for_sync
    }

    /// Appends the marker of `record`; books it on success and unwinds
    /// its index mutations on failure.
    fn commit(
        &self,
        state: &mut CollectionState,
        mut record: OperationRecord,
        sync: bool,
    ) -> CoreResult<WalPosition> {
        let marker = record
            .take_marker()
            .ok_or_else(|| CoreError::bad_parameter("operation marker already consumed"))?;
        match self.wal.append_located(marker, sync) {
            Ok(position) => {
                trace!(
                    collection = %self.cid,
                    key = %record.key,
                    tick = %position.tick,
                    "marker logged"
                );
                record.finish(state, position);
                Ok(position)
            }
            Err(err) => {
                warn!(
                    collection = %self.cid,
                    key = %record.key,
                    error = %err,
                    "WAL append failed, unwinding operation"
                );
                record.revert(state);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::collection;
    use super::*;
    use crate::index::IndexDefinition;
    use crate::types::TransactionId;
    use serde_json::json;

    fn trx() -> Transaction {
        Transaction::new(TransactionId::new(1))
    }

    #[test]
    fn insert_builds_canonical_document() {
        let users = collection("users", CollectionType::Document);
        let result = users
            .insert(
                &trx(),
                json!({"_key": "alice", "_rev": "1", "age": 30}),
                &OperationOptions::default().return_new(true),
            )
            .unwrap();
        assert_eq!(result.key, "alice");
        assert_eq!(result.id, "100/alice");
        assert!(result.tick.is_some());

        let stored = users.document(&trx(), "alice").unwrap();
        let names: Vec<_> = stored.as_object().unwrap().keys().cloned().collect();
        assert_eq!(names, vec!["_key", "_id", "_rev", "age"]);
        assert_eq!(stored["_rev"], json!(result.rev.to_string()));
        assert_eq!(result.new.unwrap(), stored);
    }

    #[test]
    fn generated_keys_are_unique() {
        let users = collection("users", CollectionType::Document);
        let a = users.insert(&trx(), json!({}), &OperationOptions::default()).unwrap();
        let b = users.insert(&trx(), json!({}), &OperationOptions::default()).unwrap();
        assert_ne!(a.key, b.key);
        assert_eq!(users.count(&trx()).unwrap(), 2);
    }

    #[test]
    fn rejects_non_objects_and_bad_keys() {
        let users = collection("users", CollectionType::Document);
        assert!(matches!(
            users.insert(&trx(), json!([1, 2]), &OperationOptions::default()),
            Err(CoreError::DocumentTypeInvalid)
        ));
        assert!(matches!(
            users.insert(&trx(), json!({"_key": "a b"}), &OperationOptions::default()),
            Err(CoreError::DocumentKeyBad { .. })
        ));
        assert!(matches!(
            users.insert(&trx(), json!({"_key": 12}), &OperationOptions::default()),
            Err(CoreError::DocumentKeyBad { .. })
        ));
    }

    #[test]
    fn edges_need_valid_endpoints() {
        let links = collection("links", CollectionType::Edge);
        assert!(matches!(
            links.insert(&trx(), json!({"_from": "v/1"}), &OperationOptions::default()),
            Err(CoreError::InvalidEdgeAttribute { .. })
        ));
        let result = links
            .insert(
                &trx(),
                json!({"_from": "v/1", "_to": "v/2", "w": 1}),
                &OperationOptions::default(),
            )
            .unwrap();
        let stored = links.document(&trx(), &result.key).unwrap();
        assert_eq!(stored["_from"], json!("v/1"));
        assert_eq!(stored["_to"], json!("v/2"));
    }

    #[test]
    fn update_merges_and_keeps_system_attributes() {
        let users = collection("users", CollectionType::Document);
        let options = OperationOptions::default();
        let first = users
            .insert(&trx(), json!({"_key": "a", "x": 1, "nested": {"p": 1}}), &options)
            .unwrap();
        let second = users
            .update(
                &trx(),
                DocumentSelector::key("a"),
                json!({"y": 2, "nested": {"q": 2}, "_key": "other"}),
                &options.return_old(true),
            )
            .unwrap();
        assert!(second.rev > first.rev);
        assert_eq!(second.old_rev, Some(first.rev));
        assert_eq!(second.old.unwrap()["x"], json!(1));

        let stored = users.document(&trx(), "a").unwrap();
        assert_eq!(stored["_key"], json!("a"));
        assert_eq!(stored["y"], json!(2));
        assert_eq!(stored["nested"], json!({"p": 1, "q": 2}));
    }

    #[test]
    fn empty_delta_is_a_no_op() {
        let users = collection("users", CollectionType::Document);
        let options = OperationOptions::default();
        let first = users.insert(&trx(), json!({"_key": "a", "x": 1}), &options).unwrap();
        let result = users
            .update(&trx(), DocumentSelector::key("a"), json!({"_rev": "9"}), &options)
            .unwrap();
        assert_eq!(result.rev, first.rev);
        assert!(result.tick.is_none());
        assert_eq!(users.figures().uncollected_logfile_entries, 1);
    }

    #[test]
    fn replace_drops_old_attributes() {
        let users = collection("users", CollectionType::Document);
        let options = OperationOptions::default();
        users.insert(&trx(), json!({"_key": "a", "x": 1}), &options).unwrap();
        users
            .replace(&trx(), DocumentSelector::key("a"), json!({"y": 2}), &options)
            .unwrap();
        let stored = users.document(&trx(), "a").unwrap();
        assert!(stored.get("x").is_none());
        assert_eq!(stored["y"], json!(2));
    }

    #[test]
    fn revision_check_only_when_enabled() {
        let users = collection("users", CollectionType::Document);
        let options = OperationOptions::default();
        users.insert(&trx(), json!({"_key": "a", "x": 1}), &options).unwrap();
        let stale = DocumentSelector::key("a").with_revision(Revision::new(1));

        let err = users
            .update(
                &trx(),
                stale.clone(),
                json!({"x": 2}),
                &options.ignore_revisions(false),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));
        assert_eq!(users.document(&trx(), "a").unwrap()["x"], json!(1));

        users.update(&trx(), stale, json!({"x": 2}), &options).unwrap();
        assert_eq!(users.document(&trx(), "a").unwrap()["x"], json!(2));
    }

    #[test]
    fn remove_then_read_is_not_found() {
        let users = collection("users", CollectionType::Document);
        let options = OperationOptions::default();
        users.insert(&trx(), json!({"_key": "a"}), &options).unwrap();
        let removed = users
            .remove(&trx(), DocumentSelector::key("a"), &options.return_old(true))
            .unwrap();
        assert_eq!(removed.old.unwrap()["_key"], json!("a"));
        assert!(matches!(
            users.read(&trx(), "a"),
            Err(CoreError::DocumentNotFound { .. })
        ));
        assert!(matches!(
            users.remove(&trx(), DocumentSelector::key("a"), &options),
            Err(CoreError::DocumentNotFound { .. })
        ));
    }

    #[test]
    fn unique_violation_on_update_restores_previous_version() {
        let users = collection("users", CollectionType::Document);
        let options = OperationOptions::default();
        users
            .ensure_index(&trx(), IndexDefinition::hash(&["email"], true, false))
            .unwrap();
        users.insert(&trx(), json!({"_key": "a", "email": "a@x"}), &options).unwrap();
        users.insert(&trx(), json!({"_key": "b", "email": "b@x"}), &options).unwrap();

        let err = users
            .update(&trx(), DocumentSelector::key("b"), json!({"email": "a@x"}), &options)
            .unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(users.document(&trx(), "b").unwrap()["email"], json!("b@x"));

        // the old value is still indexed, so it can be taken by a third document
        assert!(users
            .insert(&trx(), json!({"_key": "c", "email": "b@x"}), &options)
            .unwrap_err()
            .is_unique_violation());
    }
}
