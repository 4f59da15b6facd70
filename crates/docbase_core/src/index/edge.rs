//! Edge index over `_from` and `_to`.

use super::{unsupported, EdgeDirection, Index, IndexDefinition, IndexKind, IndexLookup};
use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::handle::HandleId;
use crate::types::IndexId;
use std::collections::{HashMap, HashSet};

/// Maps each vertex id to the edges leaving and entering it.
#[derive(Debug)]
pub struct EdgeIndex {
    id: IndexId,
    fields: Vec<String>,
    outbound: HashMap<String, HashSet<HandleId>>,
    inbound: HashMap<String, HashSet<HandleId>>,
    count: usize,
}

impl EdgeIndex {
    /// Creates an empty edge index.
    #[must_use]
    pub fn new(id: IndexId) -> Self {
        Self {
            id,
            fields: IndexDefinition::edge(id).fields,
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            count: 0,
        }
    }

    fn ends(doc: &Document) -> CoreResult<(&str, &str)> {
        match (doc.from(), doc.to()) {
            (Some(from), Some(to)) => Ok((from, to)),
            _ => Err(CoreError::invalid_edge("edge document without _from/_to")),
        }
    }

    fn unlink(
        map: &mut HashMap<String, HashSet<HandleId>>,
        vertex: &str,
        handle: HandleId,
    ) -> bool {
        let Some(set) = map.get_mut(vertex) else {
            return false;
        };
        let removed = set.remove(&handle);
        if set.is_empty() {
            map.remove(vertex);
        }
        removed
    }
}

impl Index for EdgeIndex {
    fn id(&self) -> IndexId {
        self.id
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Edge
    }

    fn fields(&self) -> &[String] {
        &self.fields
    }

    fn is_unique(&self) -> bool {
        false
    }

    fn is_sparse(&self) -> bool {
        false
    }

    fn can_be_dropped(&self) -> bool {
        false
    }

    fn insert(&mut self, handle: HandleId, doc: &Document, _is_rollback: bool) -> CoreResult<()> {
        let (from, to) = Self::ends(doc)?;
        self.outbound.try_reserve(1)?;
        self.inbound.try_reserve(1)?;
        let fresh = self
            .outbound
            .entry(from.to_string())
            .or_default()
            .insert(handle);
        self.inbound.entry(to.to_string()).or_default().insert(handle);
        if fresh {
            self.count += 1;
        }
        Ok(())
    }

    fn remove(&mut self, handle: HandleId, doc: &Document, is_rollback: bool) -> CoreResult<()> {
        let (from, to) = Self::ends(doc)?;
        let removed = Self::unlink(&mut self.outbound, from, handle);
        Self::unlink(&mut self.inbound, to, handle);
        if removed {
            self.count -= 1;
        } else if !is_rollback {
            return Err(CoreError::not_found(doc.key().unwrap_or_default()));
        }
        Ok(())
    }

    fn lookup(&self, query: &IndexLookup) -> CoreResult<Vec<HandleId>> {
        let IndexLookup::Edges { direction, vertex } = query else {
            return Err(unsupported(IndexKind::Edge, query));
        };
        let mut found: Vec<HandleId> = Vec::new();
        if matches!(direction, EdgeDirection::Outbound | EdgeDirection::Any) {
            found.extend(self.outbound.get(vertex).into_iter().flatten());
        }
        if matches!(direction, EdgeDirection::Inbound | EdgeDirection::Any) {
            found.extend(self.inbound.get(vertex).into_iter().flatten());
        }
        found.sort_unstable();
        found.dedup();
        Ok(found)
    }

    fn size_hint(&mut self, documents: usize) {
        let _ = self.outbound.try_reserve(documents);
        let _ = self.inbound.try_reserve(documents);
    }

    fn memory_usage(&self) -> usize {
        let side = |map: &HashMap<String, HashSet<HandleId>>| -> usize {
            map.iter()
                .map(|(k, v)| k.capacity() + v.capacity() * std::mem::size_of::<HandleId>())
                .sum()
        };
        side(&self.outbound) + side(&self.inbound)
    }

    fn len(&self) -> usize {
        self.count
    }

    fn definition(&self) -> IndexDefinition {
        IndexDefinition::edge(self.id)
    }
}
