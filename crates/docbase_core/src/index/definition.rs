//! Persisted index definitions.

use crate::error::{CoreError, CoreResult};
use crate::types::IndexId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Default minimum word length of fulltext indexes.
pub const DEFAULT_MIN_WORD_LENGTH: usize = 2;

/// Index kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// Unique `_key` index.
    Primary,
    /// `_from`/`_to` index of edge collections.
    Edge,
    /// Hash index.
    Hash,
    /// Ordered in-memory index.
    Skiplist,
    /// Ordered index counted as persistent-backed.
    #[serde(alias = "rocksdb")]
    Persistent,
    /// Geo index over one `[lat, lon]` (or GeoJSON) attribute.
    Geo1,
    /// Geo index over separate latitude and longitude attributes.
    Geo2,
    /// Word index over one text attribute.
    Fulltext,
}

impl IndexKind {
    /// Returns the type string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Edge => "edge",
            Self::Hash => "hash",
            Self::Skiplist => "skiplist",
            Self::Persistent => "persistent",
            Self::Geo1 => "geo1",
            Self::Geo2 => "geo2",
            Self::Fulltext => "fulltext",
        }
    }

    /// Whether field order is irrelevant when comparing definitions.
    #[must_use]
    pub const fn fields_unordered(self) -> bool {
        !matches!(self, Self::Skiplist | Self::Persistent)
    }
}

/// Definition of an index as stored by the storage engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDefinition {
    /// Index id; zero until the registry assigns one (and for primary).
    pub id: IndexId,
    /// Kind.
    #[serde(rename = "type")]
    pub kind: IndexKind,
    /// Dotted attribute paths.
    pub fields: Vec<String>,
    /// Uniqueness.
    pub unique: bool,
    /// Sparsity.
    pub sparse: bool,
    /// Fulltext minimum word length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    /// Geo1: the attribute is `[lon, lat]` GeoJSON order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_json: Option<bool>,
}

impl IndexDefinition {
    fn with(kind: IndexKind, fields: &[&str], unique: bool, sparse: bool) -> Self {
        Self {
            id: IndexId::default(),
            kind,
            fields: fields.iter().map(|f| (*f).to_string()).collect(),
            unique,
            sparse,
            min_length: None,
            geo_json: None,
        }
    }

    /// Primary index definition.
    #[must_use]
    pub fn primary() -> Self {
        Self::with(IndexKind::Primary, &["_key"], true, false)
    }

    /// Edge index definition.
    #[must_use]
    pub fn edge(id: IndexId) -> Self {
        Self {
            id,
            ..Self::with(IndexKind::Edge, &["_from", "_to"], false, false)
        }
    }

    /// Hash index over `fields`.
    #[must_use]
    pub fn hash(fields: &[&str], unique: bool, sparse: bool) -> Self {
        Self::with(IndexKind::Hash, fields, unique, sparse)
    }

    /// Skiplist index over `fields`.
    #[must_use]
    pub fn skiplist(fields: &[&str], unique: bool, sparse: bool) -> Self {
        Self::with(IndexKind::Skiplist, fields, unique, sparse)
    }

    /// Persistent index over `fields`.
    #[must_use]
    pub fn persistent(fields: &[&str], unique: bool, sparse: bool) -> Self {
        Self::with(IndexKind::Persistent, fields, unique, sparse)
    }

    /// Geo index; one field selects geo1, two select geo2 (lat, lon).
    #[must_use]
    pub fn geo(fields: &[&str], geo_json: bool) -> Self {
        let kind = if fields.len() == 2 {
            IndexKind::Geo2
        } else {
            IndexKind::Geo1
        };
        let mut definition = Self::with(kind, fields, false, true);
        if kind == IndexKind::Geo1 {
            definition.geo_json = Some(geo_json);
        }
        definition
    }

    /// Fulltext index over one field.
    #[must_use]
    pub fn fulltext(field: &str, min_length: usize) -> Self {
        Self {
            min_length: Some(min_length.max(1)),
            ..Self::with(IndexKind::Fulltext, &[field], false, true)
        }
    }

    /// Parses a user-supplied definition.
    ///
    /// Accepts the type strings `hash`, `skiplist`, `persistent`,
    /// `rocksdb`, `geo`, `geo1`, `geo2` and `fulltext`. A unique hash index
    /// without an explicit `sparse` flag becomes sparse.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` for malformed input or for `edge`/`primary`,
    /// and `NotImplemented` for unknown types.
    pub fn from_json(value: &Value) -> CoreResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| CoreError::bad_parameter("index definition must be an object"))?;
        let type_name = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::bad_parameter("index definition needs a type"))?;

        let fields: Vec<String> = match object.get("fields") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|f| match f.as_str() {
                    Some(name) if !name.is_empty() => Ok(name.to_string()),
                    _ => Err(CoreError::bad_parameter("index fields must be non-empty strings")),
                })
                .collect::<CoreResult<_>>()?,
            _ => return Err(CoreError::bad_parameter("index definition needs fields")),
        };
        if fields.is_empty() {
            return Err(CoreError::bad_parameter("index needs at least one field"));
        }
        let distinct: BTreeSet<&String> = fields.iter().collect();
        if distinct.len() != fields.len() {
            return Err(CoreError::bad_parameter("duplicate attribute in index fields"));
        }

        let kind = match type_name {
            "hash" => IndexKind::Hash,
            "skiplist" => IndexKind::Skiplist,
            "persistent" | "rocksdb" => IndexKind::Persistent,
            "geo1" => IndexKind::Geo1,
            "geo2" => IndexKind::Geo2,
            "geo" => match fields.len() {
                1 => IndexKind::Geo1,
                2 => IndexKind::Geo2,
                _ => return Err(CoreError::bad_parameter("geo index needs one or two fields")),
            },
            "fulltext" => IndexKind::Fulltext,
            "edge" | "primary" => {
                return Err(CoreError::bad_parameter(format!(
                    "cannot create {type_name} index"
                )))
            }
            other => return Err(CoreError::not_implemented(format!("index type {other:?}"))),
        };

        let expected_fields = match kind {
            IndexKind::Geo1 | IndexKind::Fulltext => Some(1),
            IndexKind::Geo2 => Some(2),
            _ => None,
        };
        if let Some(expected) = expected_fields {
            if fields.len() != expected {
                return Err(CoreError::bad_parameter(format!(
                    "{} index needs exactly {expected} field(s)",
                    kind.as_str()
                )));
            }
        }

        let unique = object.get("unique").and_then(Value::as_bool).unwrap_or(false);
        if unique && matches!(kind, IndexKind::Geo1 | IndexKind::Geo2 | IndexKind::Fulltext) {
            return Err(CoreError::bad_parameter(format!(
                "{} index cannot be unique",
                kind.as_str()
            )));
        }
        let sparse = match kind {
            IndexKind::Geo1 | IndexKind::Geo2 | IndexKind::Fulltext => true,
            _ => match object.get("sparse").and_then(Value::as_bool) {
                Some(flag) => flag,
                None => kind == IndexKind::Hash && unique,
            },
        };

        let id = match object.get("id") {
            Some(Value::Number(n)) => n.as_u64().map(IndexId::new),
            Some(Value::String(s)) => s.parse().ok().map(IndexId::new),
            _ => None,
        }
        .unwrap_or_default();

        Ok(Self {
            id,
            kind,
            fields,
            unique,
            sparse,
            min_length: (kind == IndexKind::Fulltext).then(|| {
                object
                    .get("minLength")
                    .and_then(Value::as_u64)
                    .and_then(|n| usize::try_from(n).ok())
                    .unwrap_or(DEFAULT_MIN_WORD_LENGTH)
                    .max(1)
            }),
            geo_json: (kind == IndexKind::Geo1)
                .then(|| object.get("geoJson").and_then(Value::as_bool).unwrap_or(false)),
        })
    }

    /// Returns true if `other` describes the same index, ignoring ids.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        if self.kind != other.kind
            || self.unique != other.unique
            || self.sparse != other.sparse
            || self.fields.len() != other.fields.len()
            || self.min_length != other.min_length
            || self.geo_json.unwrap_or(false) != other.geo_json.unwrap_or(false)
        {
            return false;
        }
        if self.kind.fields_unordered() {
            let mine: BTreeSet<&String> = self.fields.iter().collect();
            let theirs: BTreeSet<&String> = other.fields.iter().collect();
            mine == theirs
        } else {
            self.fields == other.fields
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_hash_defaults() {
        let def = IndexDefinition::from_json(&json!({"type": "hash", "fields": ["a"]})).unwrap();
        assert_eq!(def.kind, IndexKind::Hash);
        assert!(!def.unique);
        assert!(!def.sparse);

        let unique =
            IndexDefinition::from_json(&json!({"type": "hash", "fields": ["a"], "unique": true}))
                .unwrap();
        assert!(unique.sparse);

        let explicit = IndexDefinition::from_json(
            &json!({"type": "hash", "fields": ["a"], "unique": true, "sparse": false}),
        )
        .unwrap();
        assert!(!explicit.sparse);
    }

    #[test]
    fn parse_resolves_geo_and_aliases() {
        let geo2 =
            IndexDefinition::from_json(&json!({"type": "geo", "fields": ["lat", "lon"]})).unwrap();
        assert_eq!(geo2.kind, IndexKind::Geo2);
        assert!(geo2.sparse);

        let geo1 = IndexDefinition::from_json(
            &json!({"type": "geo", "fields": ["loc"], "geoJson": true}),
        )
        .unwrap();
        assert_eq!(geo1.kind, IndexKind::Geo1);
        assert_eq!(geo1.geo_json, Some(true));

        let rocks =
            IndexDefinition::from_json(&json!({"type": "rocksdb", "fields": ["x"]})).unwrap();
        assert_eq!(rocks.kind, IndexKind::Persistent);

        let text =
            IndexDefinition::from_json(&json!({"type": "fulltext", "fields": ["body"]})).unwrap();
        assert_eq!(text.min_length, Some(DEFAULT_MIN_WORD_LENGTH));
    }

    #[test]
    fn parse_rejections() {
        for (input, not_implemented) in [
            (json!({"type": "edge", "fields": ["_from"]}), false),
            (json!({"type": "primary", "fields": ["_key"]}), false),
            (json!({"type": "hash", "fields": []}), false),
            (json!({"type": "hash", "fields": ["a", "a"]}), false),
            (json!({"type": "fulltext", "fields": ["a", "b"]}), false),
            (json!({"type": "geo", "fields": ["a"], "unique": true}), false),
            (json!({"type": "magic", "fields": ["a"]}), true),
        ] {
            let err = IndexDefinition::from_json(&input).unwrap_err();
            if not_implemented {
                assert!(matches!(err, CoreError::NotImplemented { .. }), "{input}");
            } else {
                assert!(matches!(err, CoreError::BadParameter { .. }), "{input}");
            }
        }
    }

    #[test]
    fn hash_matching_ignores_field_order() {
        let a = IndexDefinition::hash(&["x", "y"], false, false);
        let b = IndexDefinition::hash(&["y", "x"], false, false);
        assert!(a.matches(&b));
        assert!(!a.matches(&IndexDefinition::hash(&["x", "x"], false, false)));
        assert!(!a.matches(&IndexDefinition::hash(&["x", "y"], true, false)));
    }

    #[test]
    fn skiplist_matching_respects_field_order() {
        let a = IndexDefinition::skiplist(&["x", "y"], false, false);
        assert!(a.matches(&IndexDefinition::skiplist(&["x", "y"], false, false)));
        assert!(!a.matches(&IndexDefinition::skiplist(&["y", "x"], false, false)));
        assert!(!a.matches(&IndexDefinition::persistent(&["x", "y"], false, false)));
    }

    #[test]
    fn serialized_form() {
        let def = IndexDefinition::fulltext("body", 3);
        let value = serde_json::to_value(&def).unwrap();
        assert_eq!(
            value,
            json!({
                "id": 0,
                "type": "fulltext",
                "fields": ["body"],
                "unique": false,
                "sparse": true,
                "minLength": 3
            })
        );
        let back: IndexDefinition = serde_json::from_value(value).unwrap();
        assert_eq!(back, def);
    }
}
