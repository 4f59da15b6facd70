//! Core type definitions for docbase.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a transaction context.
///
/// Transaction IDs are monotonically increasing and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trx:{}", self.0)
    }
}

/// Identifier of a collection.
///
/// Collection IDs are assigned once at creation and persisted with the
/// collection parameters. Plan ids handed down by a cluster coordinator use
/// the same type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CollectionId(pub u64);

impl CollectionId {
    /// Creates a new collection ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "col:{}", self.0)
    }
}

/// Identifier of an index within its collection.
///
/// Id 0 always names the primary index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct IndexId(pub u64);

impl IndexId {
    /// The primary index.
    pub const PRIMARY: Self = Self(0);

    /// Creates a new index ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true for the primary index id.
    #[must_use]
    pub const fn is_primary(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "idx:{}", self.0)
    }
}

/// Position of a marker in the global log order.
///
/// Ticks are stamped by the write-ahead log; recovery replays markers in
/// ascending tick order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Tick(pub u64);

impl Tick {
    /// Creates a new tick.
    #[must_use]
    pub const fn new(tick: u64) -> Self {
        Self(tick)
    }

    /// Returns the raw tick value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the following tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tick:{}", self.0)
    }
}

/// Revision of one document version.
///
/// Revisions are produced by [`RevisionClock`](crate::clock::RevisionClock),
/// rendered as decimal strings inside documents and compared as integers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl Revision {
    /// Creates a revision from its raw value.
    #[must_use]
    pub const fn new(rev: u64) -> Self {
        Self(rev)
    }

    /// Returns the raw revision value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Parses the decimal string form. Returns `None` for anything else.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        text.parse().ok().map(Self)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a logical datafile inside the write-ahead log.
///
/// The log rotates to a new file id whenever a logfile fills up; dead-space
/// statistics are kept per file id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FileId(pub u64);

impl FileId {
    /// Creates a new file id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fid:{}", self.0)
    }
}

/// Kind of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CollectionType {
    /// Plain documents.
    #[default]
    Document,
    /// Documents with `_from`/`_to` endpoints.
    Edge,
}

impl CollectionType {
    /// Numeric code used in the persisted parameter block.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Document => 2,
            Self::Edge => 3,
        }
    }

    /// Decodes the numeric code.
    #[must_use]
    pub const fn from_u8(code: u8) -> Option<Self> {
        match code {
            2 => Some(Self::Document),
            3 => Some(Self::Edge),
            _ => None,
        }
    }
}

impl Serialize for CollectionType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for CollectionType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Self::from_u8(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown collection type {code}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_id_ordering() {
        assert!(TransactionId::new(1) < TransactionId::new(2));
    }

    #[test]
    fn tick_next() {
        assert_eq!(Tick::new(5).next().as_u64(), 6);
    }

    #[test]
    fn collection_id_display() {
        assert_eq!(format!("{}", CollectionId::new(42)), "col:42");
    }

    #[test]
    fn revision_parse_only_accepts_digits() {
        assert_eq!(Revision::parse("123"), Some(Revision::new(123)));
        assert_eq!(Revision::parse(""), None);
        assert_eq!(Revision::parse("-1"), None);
        assert_eq!(Revision::parse("12a"), None);
        assert_eq!(Revision::parse("99999999999999999999999"), None);
        assert_eq!(Revision::new(77).to_string(), "77");
    }

    #[test]
    fn collection_type_codes() {
        assert_eq!(
            CollectionType::from_u8(CollectionType::Edge.as_u8()),
            Some(CollectionType::Edge)
        );
        assert_eq!(CollectionType::from_u8(9), None);
        let json = serde_json::to_string(&CollectionType::Document).unwrap();
        assert_eq!(json, "2");
    }
}
