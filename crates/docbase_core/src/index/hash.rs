//! Bucketed hash index.

use super::{
    extract_key, split_paths, unsupported, Index, IndexDefinition, IndexKind, IndexLookup,
    IndexValue,
};
use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::handle::HandleId;
use crate::types::IndexId;
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::Arc;

type Bucket = HashMap<Vec<IndexValue>, Vec<HandleId>>;

/// Equality index split into independently lockable buckets.
///
/// A key always lands in the same bucket, so [`batch_insert`](Index::batch_insert)
/// can fill buckets on separate threads.
#[derive(Debug)]
pub struct HashIndex {
    definition: IndexDefinition,
    paths: Vec<Vec<String>>,
    hasher: RandomState,
    buckets: Vec<Bucket>,
    count: usize,
}

impl HashIndex {
    /// Creates an empty index with `buckets` buckets (at least one).
    #[must_use]
    pub fn new(definition: &IndexDefinition, buckets: usize) -> Self {
        Self {
            paths: split_paths(&definition.fields),
            definition: definition.clone(),
            hasher: RandomState::new(),
            buckets: (0..buckets.max(1)).map(|_| Bucket::new()).collect(),
            count: 0,
        }
    }

    /// Number of buckets.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_of(&self, key: &[IndexValue]) -> usize {
        // Truncation is fine: only the low bits pick the bucket.
        #[allow(clippy::cast_possible_truncation)]
        let hash = self.hasher.hash_one(key) as usize;
        hash % self.buckets.len()
    }

    fn insert_into(
        bucket: &mut Bucket,
        definition: &IndexDefinition,
        key: Vec<IndexValue>,
        handle: HandleId,
        doc: &Document,
        is_rollback: bool,
    ) -> CoreResult<bool> {
        bucket.try_reserve(1)?;
        let entry = bucket.entry(key).or_default();
        if entry.contains(&handle) {
            return Ok(false);
        }
        if definition.unique && !entry.is_empty() {
            if is_rollback {
                return Ok(false);
            }
            return Err(CoreError::UniqueConstraintViolated {
                index: definition.id,
                key: doc.key().unwrap_or_default().to_string(),
            });
        }
        entry.try_reserve(1)?;
        entry.push(handle);
        Ok(true)
    }
}

impl Index for HashIndex {
    fn id(&self) -> IndexId {
        self.definition.id
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Hash
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

    fn insert(&mut self, handle: HandleId, doc: &Document, is_rollback: bool) -> CoreResult<()> {
        let Some(key) = extract_key(doc, &self.paths, self.definition.sparse) else {
            return Ok(());
        };
        let slot = self.bucket_of(&key);
        if Self::insert_into(
            &mut self.buckets[slot],
            &self.definition,
            key,
            handle,
            doc,
            is_rollback,
        )? {
            self.count += 1;
        }
        Ok(())
    }

    fn remove(&mut self, handle: HandleId, doc: &Document, is_rollback: bool) -> CoreResult<()> {
        let Some(key) = extract_key(doc, &self.paths, self.definition.sparse) else {
            return Ok(());
        };
        let slot = self.bucket_of(&key);
        let bucket = &mut self.buckets[slot];
        let removed = match bucket.get_mut(&key) {
            Some(handles) => {
                let before = handles.len();
                handles.retain(|h| *h != handle);
                let removed = handles.len() < before;
                if handles.is_empty() {
                    bucket.remove(&key);
                }
                removed
            }
            None => false,
        };
        if removed {
            self.count -= 1;
        } else if !is_rollback {
            return Err(CoreError::not_found(doc.key().unwrap_or_default()));
        }
        Ok(())
    }

    fn lookup(&self, query: &IndexLookup) -> CoreResult<Vec<HandleId>> {
        let IndexLookup::Equal(values) = query else {
            return Err(unsupported(IndexKind::Hash, query));
        };
        if values.len() != self.paths.len() {
            return Err(CoreError::bad_parameter(format!(
                "hash index {} needs {} values",
                self.definition.id,
                self.paths.len()
            )));
        }
        let key: Vec<IndexValue> = values.iter().map(|v| IndexValue::from_json(Some(v))).collect();
        if self.definition.sparse && key.iter().any(IndexValue::is_null) {
            return Ok(Vec::new());
        }
        Ok(self.buckets[self.bucket_of(&key)]
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    fn size_hint(&mut self, documents: usize) {
        let per_bucket = documents / self.buckets.len() + 1;
        for bucket in &mut self.buckets {
            let _ = bucket.try_reserve(per_bucket);
        }
    }

    fn supports_batch_insert(&self) -> bool {
        true
    }

    fn batch_insert(
        &mut self,
        documents: &[(HandleId, Arc<Document>)],
        parallelism: usize,
    ) -> CoreResult<()> {
        let mut partitions: Vec<Vec<(Vec<IndexValue>, HandleId, &Document)>> =
            (0..self.buckets.len()).map(|_| Vec::new()).collect();
        for (handle, doc) in documents {
            if let Some(key) = extract_key(doc, &self.paths, self.definition.sparse) {
                let slot = self.bucket_of(&key);
                partitions[slot].try_reserve(1)?;
                partitions[slot].push((key, *handle, doc.as_ref()));
            }
        }

        let workers = parallelism.clamp(1, self.buckets.len());
        let per_worker = self.buckets.len().div_ceil(workers);
        let definition = &self.definition;

        let results: Vec<CoreResult<usize>> = std::thread::scope(|scope| {
            let tasks: Vec<_> = self
                .buckets
                .chunks_mut(per_worker)
                .zip(partitions.chunks_mut(per_worker))
                .map(|(buckets, parts)| {
                    scope.spawn(move || -> CoreResult<usize> {
                        let mut added = 0;
                        for (bucket, part) in buckets.iter_mut().zip(parts.iter_mut()) {
                            for (key, handle, doc) in part.drain(..) {
                                if Self::insert_into(bucket, definition, key, handle, doc, false)? {
                                    added += 1;
                                }
                            }
                        }
                        Ok(added)
                    })
                })
                .collect();
            tasks
                .into_iter()
                .map(|task| task.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });

        let mut first_error = None;
        for result in results {
            match result {
                Ok(added) => self.count += added,
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn memory_usage(&self) -> usize {
        self.buckets
            .iter()
            .flat_map(|b| b.iter())
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
