//! Persisted collection parameter block.

use crate::error::{CoreError, CoreResult};
use crate::keygen::KeyOptions;
use crate::types::{CollectionId, CollectionType};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Version written into new parameter blocks.
pub const PARAMETERS_VERSION: u32 = 5;

/// Page size that `maximalSize` is rounded to.
pub const PAGE_SIZE: u64 = 4096;

/// Default journal size.
pub const DEFAULT_MAXIMAL_SIZE: u64 = 32 * 1024 * 1024;

/// Smallest journal size a caller may ask for explicitly.
pub const JOURNAL_MINIMAL_SIZE: u64 = 1024 * 1024;

/// Default number of index buckets.
pub const DEFAULT_INDEX_BUCKETS: u32 = 8;

/// Largest number of index buckets.
pub const MAX_INDEX_BUCKETS: u32 = 1024;

/// Maximum collection name length in bytes.
pub const MAX_NAME_LENGTH: usize = 64;

/// Returns true if `name` may be used for a collection.
///
/// Names start with a letter (or `_` when `allow_system` is set) and
/// continue with letters, digits, `_` and `-`.
#[must_use]
pub fn is_allowed_name(allow_system: bool, name: &str) -> bool {
    let bytes = name.as_bytes();
    let Some((&first, rest)) = bytes.split_first() else {
        return false;
    };
    let first_ok = first.is_ascii_alphabetic() || (allow_system && first == b'_');
    first_ok
        && bytes.len() <= MAX_NAME_LENGTH
        && rest
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'-')
}

/// Rounds a journal size down to whole pages, keeping non-zero sizes
/// at least one page.
#[must_use]
pub const fn round_to_page(size: u64) -> u64 {
    let rounded = (size / PAGE_SIZE) * PAGE_SIZE;
    if rounded == 0 && size != 0 {
        PAGE_SIZE
    } else {
        rounded
    }
}

/// The parameter block stored next to each collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionParameters {
    /// Format version of the block.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Document or edge collection.
    #[serde(rename = "type", default)]
    pub collection_type: CollectionType,
    /// Local collection id.
    #[serde(with = "id_string", default)]
    pub cid: CollectionId,
    /// Cluster-wide id when running as a shard.
    #[serde(
        with = "opt_id_string",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub plan_id: Option<CollectionId>,
    /// Document count saved at unload; -1 if unknown.
    #[serde(default = "default_count", skip_serializing_if = "is_negative")]
    pub count: i64,
    /// Bucket count for bucketed indexes.
    #[serde(default = "default_index_buckets")]
    pub index_buckets: u32,
    /// Set once the collection has been dropped.
    #[serde(default)]
    pub deleted: bool,
    /// Whether the compactor may touch this collection.
    #[serde(default = "default_true")]
    pub do_compact: bool,
    /// Journal size in bytes.
    #[serde(default = "default_maximal_size", alias = "journalSize")]
    pub maximal_size: u64,
    /// Collection name.
    pub name: String,
    /// In-memory only collection.
    #[serde(default)]
    pub is_volatile: bool,
    /// Flush the log after every write.
    #[serde(default)]
    pub wait_for_sync: bool,
    /// System collection (name starts with `_`).
    #[serde(default)]
    pub is_system: bool,
    /// Key generator settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_options: Option<KeyOptions>,
    /// Attributes that decide shard placement.
    #[serde(default = "default_shard_keys")]
    pub shard_keys: Vec<String>,
}

fn default_version() -> u32 {
    PARAMETERS_VERSION
}

fn default_count() -> i64 {
    -1
}

fn default_index_buckets() -> u32 {
    DEFAULT_INDEX_BUCKETS
}

fn default_true() -> bool {
    true
}

fn default_maximal_size() -> u64 {
    DEFAULT_MAXIMAL_SIZE
}

fn default_shard_keys() -> Vec<String> {
    vec![crate::document::KEY.to_string()]
}

fn is_negative(count: &i64) -> bool {
    *count < 0
}

impl CollectionParameters {
    /// Creates parameters with default settings.
    #[must_use]
    pub fn new(name: impl Into<String>, collection_type: CollectionType) -> Self {
        let name = name.into();
        Self {
            version: PARAMETERS_VERSION,
            collection_type,
            cid: CollectionId::default(),
            plan_id: None,
            count: -1,
            index_buckets: DEFAULT_INDEX_BUCKETS,
            deleted: false,
            do_compact: true,
            maximal_size: DEFAULT_MAXIMAL_SIZE,
            is_system: name.starts_with('_'),
            name,
            is_volatile: false,
            wait_for_sync: false,
            key_options: None,
            shard_keys: default_shard_keys(),
        }
    }

    /// Sets `waitForSync`.
    #[must_use]
    pub fn wait_for_sync(mut self, value: bool) -> Self {
        self.wait_for_sync = value;
        self
    }

    /// Sets `isVolatile`.
    #[must_use]
    pub fn volatile(mut self, value: bool) -> Self {
        self.is_volatile = value;
        self
    }

    /// Sets the index bucket count.
    #[must_use]
    pub fn index_buckets(mut self, buckets: u32) -> Self {
        self.index_buckets = buckets;
        self
    }

    /// Sets the journal size.
    #[must_use]
    pub fn maximal_size(mut self, bytes: u64) -> Self {
        self.maximal_size = bytes;
        self
    }

    /// Sets the key generator options.
    #[must_use]
    pub fn key_options(mut self, options: KeyOptions) -> Self {
        self.key_options = Some(options);
        self
    }

    /// Sets the shard key attributes.
    #[must_use]
    pub fn shard_keys(mut self, keys: &[&str]) -> Self {
        self.shard_keys = keys.iter().map(|k| (*k).to_string()).collect();
        self
    }

    /// Sets the cluster plan id.
    #[must_use]
    pub fn plan_id(mut self, id: CollectionId) -> Self {
        self.plan_id = (id.as_u64() > 0).then_some(id);
        self
    }

    /// Parses a parameter block and validates it.
    ///
    /// # Errors
    ///
    /// Returns a codec error for malformed JSON and the errors of
    /// [`validate`](Self::validate).
    pub fn from_json(value: &Value, force_system: bool) -> CoreResult<Self> {
        let mut parameters: Self = serde_json::from_value(value.clone())?;
        if let Some(size) = value.get("journalSize").and_then(Value::as_u64) {
            if size < JOURNAL_MINIMAL_SIZE {
                return Err(CoreError::bad_parameter("journalSize is too small"));
            }
        }
        parameters.validate(force_system)?;
        Ok(parameters)
    }

    /// Serializes the block.
    ///
    /// # Errors
    ///
    /// Returns a codec error if serialization fails.
    pub fn to_json(&self) -> CoreResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Normalizes and checks the block.
    ///
    /// `maximalSize` is rounded to whole pages and `isSystem` is derived
    /// from the name.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` for volatile collections with `waitForSync`
    /// or an index bucket count that is not a power of two in `1..=1024`,
    /// and `IllegalName` for a bad name.
    pub fn validate(&mut self, force_system: bool) -> CoreResult<()> {
        self.maximal_size = round_to_page(self.maximal_size);
        check_settings(self.is_volatile, self.wait_for_sync, self.index_buckets)?;
        if !is_allowed_name(self.is_system || force_system, &self.name) {
            return Err(CoreError::IllegalName {
                name: self.name.clone(),
            });
        }
        self.is_system = self.name.starts_with('_');
        Ok(())
    }

    /// Applies a property change.
    ///
    /// Only `doCompact`, `waitForSync`, `journalSize`/`maximalSize` (the
    /// former wins) and `indexBuckets` can change; other attributes are
    /// ignored. Nothing changes if the result would be invalid.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` for a non-object patch, a value of the wrong
    /// type, a too small journal or an invalid combination.
    pub fn apply_patch(&mut self, patch: &Value) -> CoreResult<()> {
        let patch = patch
            .as_object()
            .ok_or_else(|| CoreError::bad_parameter("properties must be an object"))?;
        let mut next = self.clone();

        if let Some(value) = patch.get("doCompact") {
            next.do_compact = as_bool(value, "doCompact")?;
        }
        if let Some(value) = patch.get("waitForSync") {
            next.wait_for_sync = as_bool(value, "waitForSync")?;
        }
        let size = patch
            .get("journalSize")
            .map(|v| ("journalSize", v))
            .or_else(|| patch.get("maximalSize").map(|v| ("maximalSize", v)));
        if let Some((name, value)) = size {
            let bytes = value
                .as_u64()
                .ok_or_else(|| CoreError::bad_parameter(format!("{name} must be a number")))?;
            if bytes < JOURNAL_MINIMAL_SIZE {
                return Err(CoreError::bad_parameter(format!("{name} is too small")));
            }
            next.maximal_size = round_to_page(bytes);
        }
        if let Some(value) = patch.get("indexBuckets") {
            next.index_buckets = value
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| CoreError::bad_parameter("indexBuckets must be a number"))?;
        }

        check_settings(next.is_volatile, next.wait_for_sync, next.index_buckets)?;
        *self = next;
        Ok(())
    }

    /// Id that appears in `_id` values: the plan id on shards, else the
    /// collection id.
    #[must_use]
    pub fn document_id_prefix(&self, on_shard: bool) -> CollectionId {
        match self.plan_id {
            Some(plan) if on_shard => plan,
            _ => self.cid,
        }
    }
}

fn check_settings(is_volatile: bool, wait_for_sync: bool, index_buckets: u32) -> CoreResult<()> {
    if is_volatile && wait_for_sync {
        return Err(CoreError::bad_parameter(
            "volatile collections do not support the waitForSync option",
        ));
    }
    if index_buckets == 0 || index_buckets > MAX_INDEX_BUCKETS || !index_buckets.is_power_of_two()
    {
        return Err(CoreError::bad_parameter(
            "indexBuckets must be a two-power between 1 and 1024",
        ));
    }
    Ok(())
}

fn as_bool(value: &Value, name: &str) -> CoreResult<bool> {
    value
        .as_bool()
        .ok_or_else(|| CoreError::bad_parameter(format!("{name} must be a boolean")))
}

/// Ids are written as decimal strings and read from strings or numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Number(u64),
    Text(String),
}

impl IdRepr {
    fn into_id<E: serde::de::Error>(self) -> Result<u64, E> {
        match self {
            Self::Number(n) => Ok(n),
            Self::Text(s) => s
                .parse()
                .map_err(|_| E::custom(format!("invalid id {s:?}"))),
        }
    }
}

mod id_string {
    use super::{CollectionId, Deserialize, Deserializer, IdRepr, Serializer};

    pub fn serialize<S: Serializer>(id: &CollectionId, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&id.as_u64().to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<CollectionId, D::Error> {
        IdRepr::deserialize(deserializer)?
            .into_id()
            .map(CollectionId::new)
    }
}

mod opt_id_string {
    use super::{CollectionId, Deserialize, Deserializer, IdRepr, Serializer};

    pub fn serialize<S: Serializer>(
        id: &Option<CollectionId>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match id {
            Some(id) => serializer.serialize_str(&id.as_u64().to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<CollectionId>, D::Error> {
        let id = Option::<IdRepr>::deserialize(deserializer)?
            .map(IdRepr::into_id)
            .transpose()?;
        Ok(id.filter(|v| *v > 0).map(CollectionId::new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn allowed_names() {
        assert!(is_allowed_name(false, "users"));
        assert!(is_allowed_name(false, "a-b_c9"));
        assert!(!is_allowed_name(false, "_system"));
        assert!(is_allowed_name(true, "_system"));
        assert!(!is_allowed_name(true, "9lives"));
        assert!(!is_allowed_name(false, ""));
        assert!(!is_allowed_name(false, "with space"));
        assert!(is_allowed_name(false, &"a".repeat(64)));
        assert!(!is_allowed_name(false, &"a".repeat(65)));
    }

    #[test]
    fn page_rounding() {
        assert_eq!(round_to_page(0), 0);
        assert_eq!(round_to_page(1), PAGE_SIZE);
        assert_eq!(round_to_page(PAGE_SIZE * 3 + 17), PAGE_SIZE * 3);
    }

    #[test]
    fn defaults_from_minimal_json() {
        let params = CollectionParameters::from_json(&json!({"name": "users"}), false).unwrap();
        assert_eq!(params.collection_type, CollectionType::Document);
        assert_eq!(params.index_buckets, DEFAULT_INDEX_BUCKETS);
        assert_eq!(params.count, -1);
        assert!(params.do_compact);
        assert_eq!(params.maximal_size, DEFAULT_MAXIMAL_SIZE);
        assert_eq!(params.shard_keys, vec!["_key".to_string()]);
        assert!(!params.is_system);
    }

    #[test]
    fn serialized_attribute_names() {
        let params = CollectionParameters::new("edges", CollectionType::Edge)
            .plan_id(CollectionId::new(77));
        let value = params.to_json().unwrap();
        let object = value.as_object().unwrap();
        for name in [
            "version",
            "type",
            "cid",
            "planId",
            "indexBuckets",
            "deleted",
            "doCompact",
            "maximalSize",
            "name",
            "isVolatile",
            "waitForSync",
            "isSystem",
        ] {
            assert!(object.contains_key(name), "missing {name}");
        }
        assert!(!object.contains_key("count"));
        assert_eq!(value["type"], json!(3));
        assert_eq!(value["planId"], json!("77"));

        let back = CollectionParameters::from_json(&value, false).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn ids_accept_numbers_and_strings() {
        let a = CollectionParameters::from_json(&json!({"name": "a", "cid": 12}), false).unwrap();
        let b = CollectionParameters::from_json(&json!({"name": "a", "cid": "12"}), false).unwrap();
        assert_eq!(a.cid, CollectionId::new(12));
        assert_eq!(a.cid, b.cid);
    }

    #[test]
    fn invalid_combinations() {
        let err = CollectionParameters::from_json(
            &json!({"name": "v", "isVolatile": true, "waitForSync": true}),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::BadParameter { .. }));

        for buckets in [0, 3, 2048] {
            let err = CollectionParameters::from_json(
                &json!({"name": "b", "indexBuckets": buckets}),
                false,
            )
            .unwrap_err();
            assert!(matches!(err, CoreError::BadParameter { .. }), "{buckets}");
        }

        let err =
            CollectionParameters::from_json(&json!({"name": "_hidden"}), false).unwrap_err();
        assert!(matches!(err, CoreError::IllegalName { .. }));

        let err = CollectionParameters::from_json(&json!({"name": "j", "journalSize": 1024}), false)
            .unwrap_err();
        assert!(matches!(err, CoreError::BadParameter { .. }));
    }

    #[test]
    fn system_flag_follows_name() {
        let params =
            CollectionParameters::from_json(&json!({"name": "_graphs", "isSystem": true}), false)
                .unwrap();
        assert!(params.is_system);

        let params =
            CollectionParameters::from_json(&json!({"name": "plain", "isSystem": true}), false)
                .unwrap();
        assert!(!params.is_system);
    }

    #[test]
    fn patch_changes_only_mutable_properties() {
        let mut params = CollectionParameters::new("p", CollectionType::Document);
        params
            .apply_patch(&json!({
                "waitForSync": true,
                "journalSize": 2 * 1024 * 1024 + 5,
                "maximalSize": 64 * 1024 * 1024,
                "indexBuckets": 16,
                "name": "ignored"
            }))
            .unwrap();
        assert!(params.wait_for_sync);
        assert_eq!(params.maximal_size, 2 * 1024 * 1024);
        assert_eq!(params.index_buckets, 16);
        assert_eq!(params.name, "p");

        let before = params.clone();
        assert!(params.apply_patch(&json!({"indexBuckets": 7})).is_err());
        assert!(params.apply_patch(&json!({"doCompact": "yes"})).is_err());
        assert_eq!(params, before);
    }

    #[test]
    fn volatile_patch_rejects_wait_for_sync() {
        let mut params = CollectionParameters::new("v", CollectionType::Document).volatile(true);
        let err = params.apply_patch(&json!({"waitForSync": true})).unwrap_err();
        assert!(matches!(err, CoreError::BadParameter { .. }));
        assert!(!params.wait_for_sync);
    }
}
