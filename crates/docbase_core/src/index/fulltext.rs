//! Word index over a single text attribute.

use super::{split_paths, unsupported, Index, IndexDefinition, IndexKind, IndexLookup};
use super::definition::DEFAULT_MIN_WORD_LENGTH;
use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::handle::HandleId;
use crate::types::IndexId;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Maps lowercased words to the documents containing them.
///
/// Removal leaves empty word lists behind; [`cleanup`](Index::cleanup)
/// drops them.
#[derive(Debug)]
pub struct FulltextIndex {
    definition: IndexDefinition,
    path: Vec<String>,
    min_length: usize,
    words: BTreeMap<String, BTreeSet<HandleId>>,
    documents: HashMap<HandleId, Vec<String>>,
}

impl FulltextIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new(definition: &IndexDefinition) -> Self {
        Self {
            path: split_paths(&definition.fields).into_iter().next().unwrap_or_default(),
            min_length: definition.min_length.unwrap_or(DEFAULT_MIN_WORD_LENGTH).max(1),
            definition: definition.clone(),
            words: BTreeMap::new(),
            documents: HashMap::new(),
        }
    }

    /// Number of distinct words, including emptied ones awaiting cleanup.
    #[must_use]
    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    fn tokenize(&self, text: &str, out: &mut BTreeSet<String>) {
        for word in text.split(|c: char| !c.is_alphanumeric()) {
            if word.chars().count() >= self.min_length {
                out.insert(word.to_lowercase());
            }
        }
    }

    fn words_of(&self, doc: &Document) -> Vec<String> {
        let mut found = BTreeSet::new();
        match doc.get_path(&self.path) {
            Some(Value::String(text)) => self.tokenize(text, &mut found),
            Some(Value::Array(items)) => {
                for text in items.iter().filter_map(Value::as_str) {
                    self.tokenize(text, &mut found);
                }
            }
            _ => {}
        }
        found.into_iter().collect()
    }

    fn matching(&self, term: &str) -> BTreeSet<HandleId> {
        match term.strip_prefix("prefix:") {
            Some(prefix) => {
                let prefix = prefix.to_lowercase();
                self.words
                    .range(prefix.clone()..)
                    .take_while(|(w, _)| w.starts_with(&prefix))
                    .flat_map(|(_, hs)| hs.iter().copied())
                    .collect()
            }
            None => self
                .words
                .get(&term.to_lowercase())
                .cloned()
                .unwrap_or_default(),
        }
    }
}

impl Index for FulltextIndex {
    fn id(&self) -> IndexId {
        self.definition.id
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Fulltext
    }

    fn fields(&self) -> &[String] {
        &self.definition.fields
    }

    fn is_unique(&self) -> bool {
        false
    }

    fn is_sparse(&self) -> bool {
        true
    }

    fn needs_cleanup(&self) -> bool {
        true
    }

    fn insert(&mut self, handle: HandleId, doc: &Document, _is_rollback: bool) -> CoreResult<()> {
        let words = self.words_of(doc);
        if words.is_empty() {
            return Ok(());
        }
        for word in &words {
            self.words.entry(word.clone()).or_default().insert(handle);
        }
        self.documents.try_reserve(1)?;
        self.documents.insert(handle, words);
        Ok(())
    }

    fn remove(&mut self, handle: HandleId, doc: &Document, is_rollback: bool) -> CoreResult<()> {
        match self.documents.remove(&handle) {
            Some(words) => {
                for word in words {
                    if let Some(handles) = self.words.get_mut(&word) {
                        handles.remove(&handle);
                    }
                }
                Ok(())
            }
            None if is_rollback || self.words_of(doc).is_empty() => Ok(()),
            None => Err(CoreError::not_found(doc.key().unwrap_or_default())),
        }
    }

    fn lookup(&self, query: &IndexLookup) -> CoreResult<Vec<HandleId>> {
        let IndexLookup::Fulltext(text) = query else {
            return Err(unsupported(IndexKind::Fulltext, query));
        };
        let mut result: Option<BTreeSet<HandleId>> = None;
        for term in text.split(|c: char| c.is_whitespace() || c == ',').filter(|t| !t.is_empty()) {
            let hits = self.matching(term);
            result = Some(match result {
                Some(acc) => acc.intersection(&hits).copied().collect(),
                None => hits,
            });
        }
        Ok(result.unwrap_or_default().into_iter().collect())
    }

    fn memory_usage(&self) -> usize {
        self.words
            .iter()
            .map(|(w, hs)| w.capacity() + hs.len() * std::mem::size_of::<HandleId>())
            .sum::<usize>()
            + self
                .documents
                .values()
                .map(|ws| ws.iter().map(String::capacity).sum::<usize>())
                .sum::<usize>()
    }

    fn len(&self) -> usize {
        self.documents.len()
    }

    fn cleanup(&mut self) -> CoreResult<()> {
        self.words.retain(|_, handles| !handles.is_empty());
        self.documents.shrink_to_fit();
        Ok(())
    }

    fn definition(&self) -> IndexDefinition {
        self.definition.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(key: &str, text: &str) -> Document {
        Document::from_value(json!({"_key": key, "body": text})).unwrap()
    }

    fn search(index: &FulltextIndex, text: &str) -> Vec<HandleId> {
        index.lookup(&IndexLookup::Fulltext(text.to_string())).unwrap()
    }

    #[test]
    fn words_and_prefixes() {
        let mut index = FulltextIndex::new(&IndexDefinition::fulltext("body", 3));
        index.insert(HandleId(0), &doc("a", "The quick brown fox"), false).unwrap();
        index.insert(HandleId(1), &doc("b", "A quicker brown dog"), false).unwrap();

        assert_eq!(search(&index, "brown"), vec![HandleId(0), HandleId(1)]);
        assert_eq!(search(&index, "BROWN,fox"), vec![HandleId(0)]);
        assert_eq!(search(&index, "prefix:quick"), vec![HandleId(0), HandleId(1)]);
        assert!(search(&index, "a").is_empty());
    }

    #[test]
    fn cleanup_drops_empty_words() {
        let mut index = FulltextIndex::new(&IndexDefinition::fulltext("body", 2));
        let d = doc("a", "alpha beta");
        index.insert(HandleId(0), &d, false).unwrap();
        index.remove(HandleId(0), &d, false).unwrap();

        assert!(index.is_empty());
        assert_eq!(index.word_count(), 2);
        index.cleanup().unwrap();
        assert_eq!(index.word_count(), 0);
        assert!(index.needs_cleanup());
    }

    #[test]
    fn non_text_is_not_indexed() {
        let mut index = FulltextIndex::new(&IndexDefinition::fulltext("body", 2));
        let d = Document::from_value(json!({"_key": "n", "body": 12})).unwrap();
        index.insert(HandleId(0), &d, false).unwrap();
        assert!(index.is_empty());
        index.remove(HandleId(0), &d, false).unwrap();
    }
}
