//! Totally ordered, hashable view of JSON values for index keys.

use serde_json::Value;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// One indexed attribute value.
///
/// Values of different types order as null < bool < number < string <
/// array < object. Numbers compare numerically, so `1` and `1.0` are the
/// same key.
#[derive(Debug, Clone)]
pub enum IndexValue {
    /// Missing attribute or explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Any JSON number.
    Number(f64),
    /// String.
    String(String),
    /// Array.
    Array(Vec<IndexValue>),
    /// Object, attributes in document order.
    Object(Vec<(String, IndexValue)>),
}

impl IndexValue {
    /// Converts a JSON value (or a missing attribute) into an index value.
    #[must_use]
    pub fn from_json(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::Null,
            Some(Value::Bool(b)) => Self::Bool(*b),
            Some(Value::Number(n)) => Self::Number(normalize(n.as_f64().unwrap_or(0.0))),
            Some(Value::String(s)) => Self::String(s.clone()),
            Some(Value::Array(items)) => {
                Self::Array(items.iter().map(|v| Self::from_json(Some(v))).collect())
            }
            Some(Value::Object(map)) => Self::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(Some(v))))
                    .collect(),
            ),
        }
    }

    /// Returns true for null.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Number(_) => 2,
            Self::String(_) => 3,
            Self::Array(_) => 4,
            Self::Object(_) => 5,
        }
    }

    /// Approximate heap footprint.
    #[must_use]
    pub fn heap_size(&self) -> usize {
        match self {
            Self::String(s) => s.len(),
            Self::Array(items) => items
                .iter()
                .map(|v| v.heap_size() + std::mem::size_of::<Self>())
                .sum(),
            Self::Object(fields) => fields
                .iter()
                .map(|(k, v)| k.len() + v.heap_size() + std::mem::size_of::<Self>())
                .sum(),
            _ => 0,
        }
    }
}

fn normalize(n: f64) -> f64 {
    if n == 0.0 {
        0.0
    } else {
        n
    }
}

impl Ord for IndexValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Array(a), Self::Array(b)) => a.cmp(b),
            (Self::Object(a), Self::Object(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for IndexValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for IndexValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexValue {}

impl Hash for IndexValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Self::Null => {}
            Self::Bool(b) => b.hash(state),
            Self::Number(n) => n.to_bits().hash(state),
            Self::String(s) => s.hash(state),
            Self::Array(items) => items.hash(state),
            Self::Object(fields) => fields.hash(state),
        }
    }
}
