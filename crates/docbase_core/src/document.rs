//! Stored documents and the builders for their canonical form.
//!
//! A stored document always starts with its system attributes in the order
//! `_key`, `_id`, `_from`, `_to` (edges only), `_rev`, followed by the user
//! attributes. The builders here produce that layout for inserts, updates
//! and replaces.

use crate::error::{CoreError, CoreResult};
use crate::types::Revision;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `_key` attribute.
pub const KEY: &str = "_key";
/// `_id` attribute.
pub const ID: &str = "_id";
/// `_rev` attribute.
pub const REV: &str = "_rev";
/// `_from` attribute of edges.
pub const FROM: &str = "_from";
/// `_to` attribute of edges.
pub const TO: &str = "_to";

/// Returns true for the attributes the store manages itself.
#[must_use]
pub fn is_system_attribute(name: &str) -> bool {
    matches!(name, KEY | ID | REV | FROM | TO)
}

/// A stored document version.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    /// Wraps an attribute map.
    #[must_use]
    pub fn new(attributes: Map<String, Value>) -> Self {
        Self(attributes)
    }

    /// Converts a JSON value into a document.
    ///
    /// # Errors
    ///
    /// Returns `DocumentTypeInvalid` if `value` is not an object.
    pub fn from_value(value: Value) -> CoreResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(CoreError::DocumentTypeInvalid),
        }
    }

    /// Returns the `_key` attribute.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.0.get(KEY).and_then(Value::as_str)
    }

    /// Returns the `_id` attribute.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.0.get(ID).and_then(Value::as_str)
    }

    /// Returns the parsed `_rev` attribute.
    #[must_use]
    pub fn revision(&self) -> Option<Revision> {
        self.0.get(REV).and_then(Value::as_str).and_then(Revision::parse)
    }

    /// Returns the `_from` attribute.
    #[must_use]
    pub fn from(&self) -> Option<&str> {
        self.0.get(FROM).and_then(Value::as_str)
    }

    /// Returns the `_to` attribute.
    #[must_use]
    pub fn to(&self) -> Option<&str> {
        self.0.get(TO).and_then(Value::as_str)
    }

    /// Returns a top-level attribute.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Follows a dotted attribute path such as `address.city`.
    #[must_use]
    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut current = self.0.get(first.as_ref())?;
        for segment in rest {
            current = current.as_object()?.get(segment.as_ref())?;
        }
        Some(current)
    }

    /// Returns the attribute map.
    #[must_use]
    pub fn attributes(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Iterates over the non-system attributes.
    pub fn user_attributes(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter().filter(|(k, _)| !is_system_attribute(k))
    }

    /// Converts the document into a JSON value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Returns a JSON copy of the document.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Encodes the document as a CBOR marker body.
    ///
    /// # Errors
    ///
    /// Returns a codec error if serialization fails.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(&self.0, &mut buf).map_err(|e| CoreError::codec(e.to_string()))?;
        Ok(buf)
    }

    /// Decodes a CBOR marker body.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the bytes are not a CBOR map.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let map: Map<String, Value> =
            ciborium::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))?;
        Ok(Self(map))
    }

    /// Approximate stored size in bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        serde_json::to_vec(&self.0).map(|v| v.len()).unwrap_or(0)
    }
}

/// How an update combines the stored document with the delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePolicy {
    /// Store explicit nulls instead of treating them as "remove".
    pub keep_null: bool,
    /// Merge nested objects instead of replacing them.
    pub merge_objects: bool,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            keep_null: true,
            merge_objects: true,
        }
    }
}

/// Edge endpoints of a new document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeEnds {
    /// `_from` document id.
    pub from: String,
    /// `_to` document id.
    pub to: String,
}

/// Reads and checks `_from`/`_to` from `input`.
///
/// # Errors
///
/// Returns `InvalidEdgeAttribute` if either is missing, not a string, or
/// not a `collection/key` id.
pub fn edge_ends(input: &Map<String, Value>) -> CoreResult<EdgeEnds> {
    let read = |name: &str| -> CoreResult<String> {
        match input.get(name) {
            Some(Value::String(id)) if crate::keygen::is_valid_document_id(id) => Ok(id.clone()),
            Some(Value::String(id)) => Err(CoreError::invalid_edge(format!(
                "{name} is not a valid document id: {id:?}"
            ))),
            Some(_) => Err(CoreError::invalid_edge(format!("{name} must be a string"))),
            None => Err(CoreError::invalid_edge(format!("{name} is missing"))),
        }
    };
    Ok(EdgeEnds {
        from: read(FROM)?,
        to: read(TO)?,
    })
}

/// Builds the stored object of a new document.
#[must_use]
pub fn new_for_insert(
    input: &Map<String, Value>,
    key: &str,
    id: &str,
    edge: Option<&EdgeEnds>,
    rev: Revision,
) -> Document {
    let mut out = Map::with_capacity(input.len() + 3);
    push_system(&mut out, key, id, edge, rev);
    for (name, value) in input {
        if !is_system_attribute(name) {
            out.insert(name.clone(), value.clone());
        }
    }
    Document(out)
}

/// Builds the stored object for an update of `old` by `delta`.
#[must_use]
pub fn merge_for_update(
    old: &Document,
    delta: &Map<String, Value>,
    rev: Revision,
    policy: MergePolicy,
) -> Document {
    let mut out = Map::with_capacity(old.0.len() + delta.len());
    push_system(
        &mut out,
        old.key().unwrap_or_default(),
        old.id().unwrap_or_default(),
        edge_of(old).as_ref(),
        rev,
    );

    for (name, old_value) in old.user_attributes() {
        match delta.get(name) {
            None => {
                out.insert(name.clone(), old_value.clone());
            }
            Some(Value::Null) if !policy.keep_null => {}
            Some(new_value) => {
                let merged = match (old_value, new_value) {
                    (Value::Object(a), Value::Object(b)) if policy.merge_objects => {
                        Value::Object(merge_objects(a, b, policy.keep_null))
                    }
                    _ => new_value.clone(),
                };
                out.insert(name.clone(), merged);
            }
        }
    }

    for (name, value) in delta {
        if is_system_attribute(name) || out.contains_key(name) || old.0.contains_key(name) {
            continue;
        }
        if value.is_null() && !policy.keep_null {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }
    Document(out)
}

/// Builds the stored object that replaces `old` with `body`.
///
/// For edges, `_from`/`_to` come from `body` when present there.
///
/// # Errors
///
/// Returns `InvalidEdgeAttribute` for a malformed endpoint in `body`.
pub fn new_for_replace(
    old: &Document,
    body: &Map<String, Value>,
    rev: Revision,
) -> CoreResult<Document> {
    let edge = match edge_of(old) {
        Some(old_ends) => {
            let mut ends = old_ends;
            if body.contains_key(FROM) || body.contains_key(TO) {
                let mut probe = Map::new();
                probe.insert(
                    FROM.to_string(),
                    body.get(FROM).cloned().unwrap_or(Value::String(ends.from.clone())),
                );
                probe.insert(
                    TO.to_string(),
                    body.get(TO).cloned().unwrap_or(Value::String(ends.to.clone())),
                );
                ends = edge_ends(&probe)?;
            }
            Some(ends)
        }
        None => None,
    };

    let mut out = Map::with_capacity(body.len() + 3);
    push_system(
        &mut out,
        old.key().unwrap_or_default(),
        old.id().unwrap_or_default(),
        edge.as_ref(),
        rev,
    );
    for (name, value) in body {
        if !is_system_attribute(name) {
            out.insert(name.clone(), value.clone());
        }
    }
    Ok(Document(out))
}

/// Returns true if `delta` carries nothing but system attributes.
#[must_use]
pub fn is_empty_delta(delta: &Map<String, Value>) -> bool {
    delta.keys().all(|k| is_system_attribute(k))
}

/// Recursively merges `patch` into `base`. With `keep_null` unset, nulls in
/// `patch` delete the attribute at every depth.
#[must_use]
pub fn merge_objects(
    base: &Map<String, Value>,
    patch: &Map<String, Value>,
    keep_null: bool,
) -> Map<String, Value> {
    let mut out = Map::with_capacity(base.len() + patch.len());
    for (name, value) in base {
        match patch.get(name) {
            None => {
                out.insert(name.clone(), value.clone());
            }
            Some(Value::Null) if !keep_null => {}
            Some(Value::Object(inner)) => {
                let merged = match value {
                    Value::Object(existing) => merge_objects(existing, inner, keep_null),
                    _ if keep_null => inner.clone(),
                    _ => strip_nulls(inner),
                };
                out.insert(name.clone(), Value::Object(merged));
            }
            Some(other) => {
                out.insert(name.clone(), other.clone());
            }
        }
    }
    for (name, value) in patch {
        if base.contains_key(name) {
            continue;
        }
        match value {
            Value::Null if !keep_null => {}
            Value::Object(inner) if !keep_null => {
                out.insert(name.clone(), Value::Object(strip_nulls(inner)));
            }
            _ => {
                out.insert(name.clone(), value.clone());
            }
        }
    }
    out
}

fn strip_nulls(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| match v {
            Value::Object(inner) => (k.clone(), Value::Object(strip_nulls(inner))),
            _ => (k.clone(), v.clone()),
        })
        .collect()
}

fn edge_of(doc: &Document) -> Option<EdgeEnds> {
    Some(EdgeEnds {
        from: doc.from()?.to_string(),
        to: doc.to()?.to_string(),
    })
}

fn push_system(
    out: &mut Map<String, Value>,
    key: &str,
    id: &str,
    edge: Option<&EdgeEnds>,
    rev: Revision,
) {
    out.insert(KEY.to_string(), Value::String(key.to_string()));
    out.insert(ID.to_string(), Value::String(id.to_string()));
    if let Some(ends) = edge {
        out.insert(FROM.to_string(), Value::String(ends.from.clone()));
        out.insert(TO.to_string(), Value::String(ends.to.clone()));
    }
    out.insert(REV.to_string(), Value::String(rev.to_string()));
}
