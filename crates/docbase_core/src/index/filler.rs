//! Population of secondary indexes from the primary index.

use super::{Index, PrimaryIndex};
use crate::config::StoreConfig;
use crate::document::Document;
use crate::error::CoreResult;
use crate::handle::HandleId;
use std::sync::{mpsc, Arc};
use std::thread;
use tracing::debug;

/// How an index was populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    /// One document at a time.
    Sequential,
    /// Blocks handed to [`Index::batch_insert`].
    Batched,
}

/// Knobs for index population, taken from the store configuration and the
/// collection's bucket count.
#[derive(Debug, Clone, Copy)]
pub struct FillPolicy {
    /// Worker threads available.
    pub workers: usize,
    /// Documents needed before batching pays off.
    pub batch_threshold: usize,
    /// Documents per batch call.
    pub block_size: usize,
    /// Index buckets of the collection.
    pub buckets: usize,
}

impl FillPolicy {
    /// Builds the policy for a collection with `buckets` index buckets.
    #[must_use]
    pub fn new(config: &StoreConfig, buckets: usize) -> Self {
        Self {
            workers: config.fill_workers.max(1),
            batch_threshold: config.fill_batch_threshold,
            block_size: config.fill_block_size.max(1),
            buckets,
        }
    }

    fn sequential(self) -> Self {
        Self { workers: 1, ..self }
    }

    fn mode_for(&self, index: &dyn Index, documents: usize) -> FillMode {
        if documents > self.batch_threshold
            && self.buckets > 1
            && self.workers > 1
            && index.supports_batch_insert()
        {
            FillMode::Batched
        } else {
            FillMode::Sequential
        }
    }
}

fn snapshot(primary: &PrimaryIndex) -> CoreResult<Vec<(HandleId, Arc<Document>)>> {
    let mut documents = Vec::new();
    documents.try_reserve(primary.count())?;
    documents.extend(primary.iter().map(|(id, h)| (id, Arc::clone(&h.document))));
    documents.sort_unstable_by_key(|(id, _)| *id);
    Ok(documents)
}

fn fill_from(
    index: &mut dyn Index,
    documents: &[(HandleId, Arc<Document>)],
    policy: FillPolicy,
) -> CoreResult<FillMode> {
    let mode = policy.mode_for(index, documents.len());
    index.size_hint(documents.len());
    match mode {
        FillMode::Batched => {
            for block in documents.chunks(policy.block_size) {
                index.batch_insert(block, policy.workers)?;
            }
        }
        FillMode::Sequential => {
            for (handle, doc) in documents {
                index.insert(*handle, doc, false)?;
            }
        }
    }
    debug!(index = %index.id(), documents = documents.len(), ?mode, "index filled");
    Ok(mode)
}

/// Populates one index from every live document of `primary`.
///
/// Large collections with several buckets are inserted in blocks through
/// the index's batch path when it has one.
///
/// # Errors
///
/// Returns the first insertion error; the index is then partially filled
/// and must be discarded.
pub fn fill_index(
    index: &mut dyn Index,
    primary: &PrimaryIndex,
    policy: FillPolicy,
) -> CoreResult<FillMode> {
    let documents = snapshot(primary)?;
    fill_from(index, &documents, policy)
}

/// Populates several indexes at once.
///
/// All but the last index are spread over at most `policy.workers - 1`
/// scoped threads while the calling thread fills the last one. Results come
/// back over a channel; once every index is done the error of the
/// lowest-positioned failing index is returned.
///
/// # Errors
///
/// Returns the first error in index order.
pub fn fill_indexes(
    indexes: &mut [Box<dyn Index>],
    primary: &PrimaryIndex,
    policy: FillPolicy,
) -> CoreResult<()> {
    let Some((last, rest)) = indexes.split_last_mut() else {
        return Ok(());
    };
    let documents = snapshot(primary)?;

    if rest.is_empty() || policy.workers <= 1 {
        for index in rest.iter_mut() {
            fill_from(index.as_mut(), &documents, policy)?;
        }
        return fill_from(last.as_mut(), &documents, policy).map(|_| ());
    }

    let workers = (policy.workers - 1).min(rest.len());
    let per_worker = rest.len().div_ceil(workers);
    let last_position = rest.len();
    let documents = documents.as_slice();

    let mut results: Vec<(usize, CoreResult<FillMode>)> = thread::scope(|scope| {
        let (tx, rx) = mpsc::channel();
        for (chunk_no, chunk) in rest.chunks_mut(per_worker).enumerate() {
            let tx = tx.clone();
            scope.spawn(move || {
                for (offset, index) in chunk.iter_mut().enumerate() {
                    let result = fill_from(index.as_mut(), documents, policy.sequential());
                    // The receiver lives until the scope ends.
                    let _ = tx.send((chunk_no * per_worker + offset, result));
                }
            });
        }
        let own = fill_from(last.as_mut(), documents, policy.sequential());
        let _ = tx.send((last_position, own));
        drop(tx);
        rx.into_iter().collect()
    });

    results.sort_by_key(|(position, _)| *position);
    results
        .into_iter()
        .map(|(_, result)| result)
        .find(Result::is_err)
        .map_or(Ok(()), |err| err.map(|_| ()))
}
