//! Ordered index used for the skiplist and persistent kinds.

use super::{
    extract_key, split_paths, unsupported, Index, IndexDefinition, IndexKind, IndexLookup,
    IndexValue,
};
use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::handle::HandleId;
use crate::types::IndexId;
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Index over ordered key tuples. Field order is significant.
#[derive(Debug)]
pub struct SortedIndex {
    definition: IndexDefinition,
    paths: Vec<Vec<String>>,
    entries: BTreeMap<Vec<IndexValue>, Vec<HandleId>>,
    count: usize,
}

fn convert(bound: &Bound<Value>) -> Bound<IndexValue> {
    match bound {
        Bound::Included(v) => Bound::Included(IndexValue::from_json(Some(v))),
        Bound::Excluded(v) => Bound::Excluded(IndexValue::from_json(Some(v))),
        Bound::Unbounded => Bound::Unbounded,
    }
}

impl SortedIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new(definition: &IndexDefinition) -> Self {
        Self {
            definition: definition.clone(),
            paths: split_paths(&definition.fields),
            entries: BTreeMap::new(),
            count: 0,
        }
    }

    fn prefix_scan(&self, prefix: Vec<IndexValue>) -> Vec<HandleId> {
        let width = prefix.len();
        self.entries
            .range(prefix.clone()..)
            .take_while(|(key, _)| key[..width] == prefix[..])
            .flat_map(|(_, handles)| handles.iter().copied())
            .collect()
    }

    fn range_scan(&self, lower: &Bound<Value>, upper: &Bound<Value>) -> Vec<HandleId> {
        let lower = convert(lower);
        let upper = convert(upper);
        let start = match &lower {
            Bound::Included(v) | Bound::Excluded(v) => Bound::Included(vec![v.clone()]),
            Bound::Unbounded => Bound::Unbounded,
        };
        self.entries
            .range((start, Bound::Unbounded))
            .skip_while(|(key, _)| matches!(&lower, Bound::Excluded(v) if key[0] == *v))
            .take_while(|(key, _)| match &upper {
                Bound::Included(v) => key[0] <= *v,
                Bound::Excluded(v) => key[0] < *v,
                Bound::Unbounded => true,
            })
            .filter(|(key, _)| !(self.definition.sparse && key[0].is_null()))
            .flat_map(|(_, handles)| handles.iter().copied())
            .collect()
    }
}

impl Index for SortedIndex {
    fn id(&self) -> IndexId {
        self.definition.id
    }

    fn kind(&self) -> IndexKind {
        self.definition.kind
    }

    fn fields(&self) -> &[String] {
        &self.definition.fields
    }

    fn is_unique(&self) -> bool {
        self.definition.unique
    }

    fn is_sparse(&self) -> bool {
        self.definition.sparse
    }

    fn is_persistent(&self) -> bool {
        self.definition.kind == IndexKind::Persistent
    }

    fn insert(&mut self, handle: HandleId, doc: &Document, is_rollback: bool) -> CoreResult<()> {
        let Some(key) = extract_key(doc, &self.paths, self.definition.sparse) else {
            return Ok(());
        };
        let entry = self.entries.entry(key).or_default();
        if entry.contains(&handle) {
            return Ok(());
        }
        if self.definition.unique && !entry.is_empty() {
            if is_rollback {
                return Ok(());
            }
            return Err(CoreError::UniqueConstraintViolated {
                index: self.definition.id,
                key: doc.key().unwrap_or_default().to_string(),
            });
        }
        entry.try_reserve(1)?;
        entry.push(handle);
        self.count += 1;
        Ok(())
    }

    fn remove(&mut self, handle: HandleId, doc: &Document, is_rollback: bool) -> CoreResult<()> {
        let Some(key) = extract_key(doc, &self.paths, self.definition.sparse) else {
            return Ok(());
        };
        let mut removed = false;
        if let Some(handles) = self.entries.get_mut(&key) {
            let before = handles.len();
            handles.retain(|h| *h != handle);
            removed = handles.len() < before;
            if handles.is_empty() {
                self.entries.remove(&key);
            }
        }
        if removed {
            self.count -= 1;
        } else if !is_rollback {
            return Err(CoreError::not_found(doc.key().unwrap_or_default()));
        }
        Ok(())
    }

    fn lookup(&self, query: &IndexLookup) -> CoreResult<Vec<HandleId>> {
        match query {
            IndexLookup::Equal(values) => {
                if values.is_empty() || values.len() > self.paths.len() {
                    return Err(CoreError::bad_parameter(format!(
                        "{} index {} takes 1..={} values",
                        self.definition.kind.as_str(),
                        self.definition.id,
                        self.paths.len()
                    )));
                }
                let key: Vec<IndexValue> =
                    values.iter().map(|v| IndexValue::from_json(Some(v))).collect();
                if self.definition.sparse && key.iter().any(IndexValue::is_null) {
                    return Ok(Vec::new());
                }
                Ok(self.prefix_scan(key))
            }
            IndexLookup::Range { lower, upper } => Ok(self.range_scan(lower, upper)),
            other => Err(unsupported(self.definition.kind, other)),
        }
    }

    fn memory_usage(&self) -> usize {
        self.entries
            .iter()
            .map(|(k, v)| {
                k.iter().map(|x| x.heap_size() + std::mem::size_of::<IndexValue>()).sum::<usize>()
                    + v.capacity() * std::mem::size_of::<HandleId>()
            })
            .sum()
    }

    fn len(&self) -> usize {
        self.count
    }

    fn definition(&self) -> IndexDefinition {
        self.definition.clone()
    }
}
