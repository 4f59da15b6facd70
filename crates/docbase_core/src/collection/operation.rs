//! Operation options, selectors and the in-flight operation record.

use super::figures::DatafileStatisticsMap;
use super::CollectionState;
use crate::document::{self, Document, MergePolicy};
use crate::error::{CoreError, CoreResult};
use crate::handle::{DocumentHandle, HandleId};
use crate::types::{Revision, Tick};
use crate::wal::{WalPosition, WalRecord};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// Per-call knobs of the document pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationOptions {
    /// Flush the log before returning.
    pub wait_for_sync: bool,
    /// Skip the expected-revision check.
    pub ignore_revisions: bool,
    /// Store explicit nulls of an update instead of removing the attribute.
    pub keep_null: bool,
    /// Merge nested objects of an update instead of replacing them.
    pub merge_objects: bool,
    /// Data is being restored: keys and revisions are taken as given.
    pub is_restore: bool,
    /// Return the previous version.
    pub return_old: bool,
    /// Return the new version.
    pub return_new: bool,
}

impl Default for OperationOptions {
    fn default() -> Self {
        Self {
            wait_for_sync: false,
            ignore_revisions: true,
            keep_null: true,
            merge_objects: true,
            is_restore: false,
            return_old: false,
            return_new: false,
        }
    }
}

impl OperationOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `wait_for_sync`.
    #[must_use]
    pub const fn wait_for_sync(mut self, value: bool) -> Self {
        self.wait_for_sync = value;
        self
    }

    /// Sets `ignore_revisions`.
    #[must_use]
    pub const fn ignore_revisions(mut self, value: bool) -> Self {
        self.ignore_revisions = value;
        self
    }

    /// Sets `keep_null`.
    #[must_use]
    pub const fn keep_null(mut self, value: bool) -> Self {
        self.keep_null = value;
        self
    }

    /// Sets `merge_objects`.
    #[must_use]
    pub const fn merge_objects(mut self, value: bool) -> Self {
        self.merge_objects = value;
        self
    }

    /// Sets `is_restore`.
    #[must_use]
    pub const fn is_restore(mut self, value: bool) -> Self {
        self.is_restore = value;
        self
    }

    /// Sets `return_old`.
    #[must_use]
    pub const fn return_old(mut self, value: bool) -> Self {
        self.return_old = value;
        self
    }

    /// Sets `return_new`.
    #[must_use]
    pub const fn return_new(mut self, value: bool) -> Self {
        self.return_new = value;
        self
    }

    pub(crate) const fn merge_policy(&self) -> MergePolicy {
        MergePolicy {
            keep_null: self.keep_null,
            merge_objects: self.merge_objects,
        }
    }
}

/// Outcome of a successful pipeline call.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    /// Document key.
    pub key: String,
    /// Document id.
    pub id: String,
    /// Revision now stored (for removals: of the tombstone).
    pub rev: Revision,
    /// Revision replaced or removed.
    pub old_rev: Option<Revision>,
    /// Previous version, if requested.
    pub old: Option<Value>,
    /// New version, if requested.
    pub new: Option<Value>,
    /// Tick of the logged marker; `None` when nothing was written.
    pub tick: Option<Tick>,
}

/// Addresses one document, optionally pinning the expected revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSelector {
    /// Document key.
    pub key: String,
    /// Revision the caller expects to find.
    pub revision: Option<Revision>,
}

impl DocumentSelector {
    /// Selects `key` without a revision.
    #[must_use]
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            revision: None,
        }
    }

    /// Pins the expected revision.
    #[must_use]
    pub fn with_revision(mut self, revision: Revision) -> Self {
        self.revision = Some(revision);
        self
    }

    /// Reads a selector from a key string, a `collection/key` id, or an
    /// object carrying `_key` and optionally `_rev`.
    ///
    /// # Errors
    ///
    /// Returns `DocumentHandleBad` if no key can be found and
    /// `DocumentRevBad` for a malformed `_rev`.
    pub fn from_value(value: &Value) -> CoreResult<Self> {
        match value {
            Value::String(text) => {
                let key = text.split_once('/').map_or(text.as_str(), |(_, k)| k);
                if key.is_empty() {
                    return Err(CoreError::DocumentHandleBad {
                        message: format!("no key in {text:?}"),
                    });
                }
                Ok(Self::key(key))
            }
            Value::Object(map) => {
                let key = match map.get(document::KEY) {
                    Some(Value::String(key)) if !key.is_empty() => key.clone(),
                    _ => {
                        return Err(CoreError::DocumentHandleBad {
                            message: "selector has no string _key".to_string(),
                        })
                    }
                };
                let revision = match map.get(document::REV) {
                    None | Some(Value::Null) => None,
                    Some(Value::String(text)) => Some(Revision::parse(text).ok_or_else(|| {
                        CoreError::DocumentRevBad {
                            message: format!("{text:?} is not a revision"),
                        }
                    })?),
                    Some(other) => {
                        return Err(CoreError::DocumentRevBad {
                            message: format!("{other} is not a revision"),
                        })
                    }
                };
                Ok(Self { key, revision })
            }
            _ => Err(CoreError::DocumentHandleBad {
                message: "selector must be a string or an object".to_string(),
            }),
        }
    }
}

impl From<&str> for DocumentSelector {
    fn from(key: &str) -> Self {
        Self::key(key)
    }
}

/// A mutation handed to [`Collection::execute`](super::Collection::execute).
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentOperation {
    /// Store a new document.
    Insert(Value),
    /// Merge `delta` into the selected document.
    Update {
        /// Target document.
        selector: DocumentSelector,
        /// Attributes to change.
        delta: Value,
    },
    /// Replace the user attributes of the selected document with `body`.
    Replace {
        /// Target document.
        selector: DocumentSelector,
        /// New body.
        body: Value,
    },
    /// Delete the selected document.
    Remove(DocumentSelector),
}

impl DocumentOperation {
    /// Kind of this operation.
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Insert(_) => OperationKind::Insert,
            Self::Update { .. } => OperationKind::Update,
            Self::Replace { .. } => OperationKind::Replace,
            Self::Remove(_) => OperationKind::Remove,
        }
    }
}

/// Tag of a document mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// New document.
    Insert,
    /// Merge into an existing document.
    Update,
    /// Overwrite an existing document.
    Replace,
    /// Delete a document.
    Remove,
}

/// A mutation that has been applied to the indexes but not yet logged.
///
/// It owns the marker until the log takes it; afterwards either
/// [`finish`](Self::finish) books the result or [`revert`](Self::revert)
/// restores the index state from before the operation.
#[derive(Debug)]
pub(crate) struct OperationRecord {
    pub(crate) kind: OperationKind,
    pub(crate) key: String,
    pub(crate) handle: HandleId,
    /// Version the handle pointed at before (update, replace, remove).
    pub(crate) previous: Option<DocumentHandle>,
    /// Version stored by this operation (insert, update, replace).
    pub(crate) current: Option<Arc<Document>>,
    pub(crate) revision: Revision,
    marker: Option<WalRecord>,
}

impl OperationRecord {
    pub(crate) fn new(
        kind: OperationKind,
        key: String,
        handle: HandleId,
        previous: Option<DocumentHandle>,
        current: Option<Arc<Document>>,
        revision: Revision,
        marker: WalRecord,
    ) -> Self {
        Self {
            kind,
            key,
            handle,
            previous,
            current,
            revision,
            marker: Some(marker),
        }
    }

    /// Hands the marker over to the log.
    pub(crate) fn take_marker(&mut self) -> Option<WalRecord> {
        self.marker.take()
    }

    /// Books a logged operation: stamps the handle with its log position,
    /// updates datafile statistics and frees removed handles.
    pub(crate) fn finish(self, state: &mut CollectionState, position: WalPosition) {
        state.last_tick = state.last_tick.max(position.tick);
        state.revision = state.revision.max(self.revision);
        let primary = state.indexes.primary_mut();
        let statistics: &mut DatafileStatisticsMap = &mut state.statistics;

        if let Some(old) = &self.previous {
            statistics.file(old.fid).retire(old.marker_size());
        }
        match self.kind {
            OperationKind::Remove => {
                primary.release(self.handle);
                statistics.file(position.fid).add_deletion();
            }
            OperationKind::Insert | OperationKind::Update | OperationKind::Replace => {
                if let Some(handle) = primary.handle_mut(self.handle) {
                    handle.tick = position.tick;
                    handle.fid = position.fid;
                    statistics.file(position.fid).add_alive(handle.marker_size());
                }
            }
        }
    }

    /// Undoes the index mutations of an operation whose marker was not
    /// logged.
    pub(crate) fn revert(self, state: &mut CollectionState) {
        let indexes = &mut state.indexes;
        if let Some(current) = &self.current {
            indexes.discard_secondaries(self.handle, current);
        }
        match self.kind {
            OperationKind::Insert => {
                let primary = indexes.primary_mut();
                primary.remove_key(&self.key);
                primary.release(self.handle);
            }
            OperationKind::Update | OperationKind::Replace => {
                if let Some(previous) = self.previous {
                    let document = Arc::clone(&previous.document);
                    if let Some(handle) = indexes.primary_mut().handle_mut(self.handle) {
                        *handle = previous;
                    }
                    indexes.restore_secondaries(usize::MAX, self.handle, &document);
                }
            }
            OperationKind::Remove => {
                if let Err(err) = indexes.primary_mut().insert_key(&self.key, self.handle) {
                    warn!(key = %self.key, error = %err, "rollback of primary removal failed");
                }
                if let Some(previous) = &self.previous {
                    indexes.restore_secondaries(usize::MAX, self.handle, &previous.document);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_options() {
        let options = OperationOptions::default();
        assert!(options.ignore_revisions);
        assert!(options.keep_null);
        assert!(options.merge_objects);
        assert!(!options.wait_for_sync);
        assert!(!options.is_restore);
        assert!(!options.return_old);
        assert!(!options.return_new);
    }

    #[test]
    fn selector_forms() {
        assert_eq!(
            DocumentSelector::from_value(&json!("abc")).unwrap(),
            DocumentSelector::key("abc")
        );
        assert_eq!(
            DocumentSelector::from_value(&json!("users/abc")).unwrap(),
            DocumentSelector::key("abc")
        );
        assert_eq!(
            DocumentSelector::from_value(&json!({"_key": "abc", "_rev": "42"})).unwrap(),
            DocumentSelector::key("abc").with_revision(Revision::new(42))
        );
    }

    #[test]
    fn bad_selectors() {
        assert!(matches!(
            DocumentSelector::from_value(&json!(12)),
            Err(CoreError::DocumentHandleBad { .. })
        ));
        assert!(matches!(
            DocumentSelector::from_value(&json!({"name": "x"})),
            Err(CoreError::DocumentHandleBad { .. })
        ));
        assert!(matches!(
            DocumentSelector::from_value(&json!("users/")),
            Err(CoreError::DocumentHandleBad { .. })
        ));
        assert!(matches!(
            DocumentSelector::from_value(&json!({"_key": "a", "_rev": "x1"})),
            Err(CoreError::DocumentRevBad { .. })
        ));
    }

    #[test]
    fn operation_kinds() {
        let op = DocumentOperation::Remove(DocumentSelector::key("a"));
        assert_eq!(op.kind(), OperationKind::Remove);
        assert_eq!(
            DocumentOperation::Insert(json!({})).kind(),
            OperationKind::Insert
        );
    }
}
