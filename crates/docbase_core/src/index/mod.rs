//! Indexes of a collection.
//!
//! Every index implements the [`Index`] contract. The primary index is
//! special: it owns the document handles and always occupies slot 0 of the
//! [`IndexRegistry`]. Secondary indexes only keep [`HandleId`]s.
//!
//! ## Available Index Kinds
//!
//! | kind | lookups | notes |
//! |------|---------|-------|
//! | primary | `_key` | unique, never dropped |
//! | edge | `_from` / `_to` | exactly one per edge collection |
//! | hash | equality | bucketed; parallel batch insert |
//! | skiplist | equality, range | ordered fields |
//! | persistent | equality, range | counted as persistent-backed |
//! | geo1 / geo2 | near, within | always sparse |
//! | fulltext | words | needs periodic cleanup |

mod definition;
mod edge;
mod filler;
mod fulltext;
mod geo;
mod hash;
mod primary;
mod registry;
mod sorted;
mod value;

pub use definition::{IndexDefinition, IndexKind};
pub use edge::EdgeIndex;
pub use filler::{fill_index, fill_indexes, FillMode, FillPolicy};
pub use fulltext::FulltextIndex;
pub use geo::GeoIndex;
pub use hash::HashIndex;
pub use primary::PrimaryIndex;
pub use registry::{IndexDescriptor, IndexRegistry};
pub use sorted::SortedIndex;
pub use value::IndexValue;

use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::handle::HandleId;
use crate::types::IndexId;
use serde_json::Value;
use std::ops::Bound;
use std::sync::Arc;

/// Direction of an edge lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDirection {
    /// Edges whose `_from` is the vertex.
    Outbound,
    /// Edges whose `_to` is the vertex.
    Inbound,
    /// Either.
    Any,
}

/// A query against one index.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexLookup {
    /// Exact match on all indexed fields, in definition order.
    Equal(Vec<Value>),
    /// Range over the first indexed field.
    Range {
        /// Lower bound.
        lower: Bound<Value>,
        /// Upper bound.
        upper: Bound<Value>,
    },
    /// Edges touching a vertex.
    Edges {
        /// Which endpoint to match.
        direction: EdgeDirection,
        /// Vertex document id.
        vertex: String,
    },
    /// The `limit` documents closest to a point.
    Near {
        /// Latitude in degrees.
        latitude: f64,
        /// Longitude in degrees.
        longitude: f64,
        /// Maximum number of results.
        limit: usize,
    },
    /// Documents within `radius` meters of a point.
    Within {
        /// Latitude in degrees.
        latitude: f64,
        /// Longitude in degrees.
        longitude: f64,
        /// Radius in meters.
        radius: f64,
    },
    /// Documents containing every word of the query. A word written as
    /// `prefix:abc` matches any word starting with `abc`.
    Fulltext(String),
}

/// Uniform contract of all index kinds.
///
/// `is_rollback` is set while an operation is being unwound; implementations
/// must then swallow uniqueness and not-found errors, since they are
/// restoring a state that was valid before.
pub trait Index: Send + Sync + std::fmt::Debug {
    /// Index id.
    fn id(&self) -> IndexId;

    /// Index kind.
    fn kind(&self) -> IndexKind;

    /// Indexed attribute paths, dotted.
    fn fields(&self) -> &[String];

    /// Whether values must be unique.
    fn is_unique(&self) -> bool;

    /// Whether documents with null or missing fields are left out.
    fn is_sparse(&self) -> bool;

    /// Whether the index is backed by persistent storage.
    fn is_persistent(&self) -> bool {
        false
    }

    /// Whether the index wants periodic [`cleanup`](Self::cleanup) calls.
    fn needs_cleanup(&self) -> bool {
        false
    }

    /// Whether the index may be dropped.
    fn can_be_dropped(&self) -> bool {
        true
    }

    /// Adds `doc` (stored in `handle`).
    ///
    /// # Errors
    ///
    /// Returns `UniqueConstraintViolated` when a unique index already holds
    /// the value, unless `is_rollback` is set.
    fn insert(&mut self, handle: HandleId, doc: &Document, is_rollback: bool) -> CoreResult<()>;

    /// Removes `doc` (stored in `handle`).
    ///
    /// # Errors
    ///
    /// Returns an error if the entry is missing, unless `is_rollback` is set.
    fn remove(&mut self, handle: HandleId, doc: &Document, is_rollback: bool) -> CoreResult<()>;

    /// Answers a query.
    ///
    /// # Errors
    ///
    /// Returns `NotImplemented` for a query this kind cannot answer.
    fn lookup(&self, query: &IndexLookup) -> CoreResult<Vec<HandleId>>;

    /// Prepares for roughly `documents` entries.
    fn size_hint(&mut self, _documents: usize) {}

    /// Whether [`batch_insert`](Self::batch_insert) does better than a loop.
    fn supports_batch_insert(&self) -> bool {
        false
    }

    /// Inserts many documents, using up to `parallelism` threads.
    ///
    /// # Errors
    ///
    /// Returns the first insertion error.
    fn batch_insert(
        &mut self,
        documents: &[(HandleId, Arc<Document>)],
        _parallelism: usize,
    ) -> CoreResult<()> {
        for (handle, doc) in documents {
            self.insert(*handle, doc, false)?;
        }
        Ok(())
    }

    /// Approximate memory used, in bytes.
    fn memory_usage(&self) -> usize;

    /// Number of indexed documents.
    fn len(&self) -> usize;

    /// Returns true if nothing is indexed.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compacts internal structures.
    ///
    /// # Errors
    ///
    /// Implementation specific.
    fn cleanup(&mut self) -> CoreResult<()> {
        Ok(())
    }

    /// Returns the persisted definition.
    fn definition(&self) -> IndexDefinition;
}

/// Error for a query kind an index cannot serve.
pub(crate) fn unsupported(kind: IndexKind, query: &IndexLookup) -> CoreError {
    CoreError::not_implemented(format!("{} index cannot answer {query:?}", kind.as_str()))
}

/// Extracts the key tuple of `doc` for `paths`.
///
/// Returns `None` when the index is sparse and any field is null or missing.
pub(crate) fn extract_key(
    doc: &Document,
    paths: &[Vec<String>],
    sparse: bool,
) -> Option<Vec<IndexValue>> {
    let mut key = Vec::with_capacity(paths.len());
    for path in paths {
        let value = IndexValue::from_json(doc.get_path(path));
        if sparse && value.is_null() {
            return None;
        }
        key.push(value);
    }
    Some(key)
}

/// Splits dotted field names into paths.
pub(crate) fn split_paths(fields: &[String]) -> Vec<Vec<String>> {
    fields
        .iter()
        .map(|f| f.split('.').map(str::to_string).collect())
        .collect()
}

/// Builds the index object for a definition.
///
/// `buckets` is the collection's index bucket count.
///
/// # Errors
///
/// Returns `BadParameter` for primary or edge definitions, which are
/// created by the collection itself.
pub fn create_index(definition: &IndexDefinition, buckets: usize) -> CoreResult<Box<dyn Index>> {
    let index: Box<dyn Index> = match definition.kind {
        IndexKind::Hash => Box::new(HashIndex::new(definition, buckets)),
        IndexKind::Skiplist | IndexKind::Persistent => Box::new(SortedIndex::new(definition)),
        IndexKind::Geo1 | IndexKind::Geo2 => Box::new(GeoIndex::new(definition)?),
        IndexKind::Fulltext => Box::new(FulltextIndex::new(definition)),
        IndexKind::Primary | IndexKind::Edge => {
            return Err(CoreError::bad_parameter(format!(
                "{} indexes cannot be created explicitly",
                definition.kind.as_str()
            )))
        }
    };
    Ok(index)
}
