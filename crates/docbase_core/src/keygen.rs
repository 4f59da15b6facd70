//! Document key generation and validation.
//!
//! Every collection owns one [`KeyGenerator`]. It fills in `_key` when a
//! document arrives without one, checks user-supplied keys, and learns
//! about keys seen during recovery through [`KeyGenerator::track`] so that
//! later generated keys cannot collide with them.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Maximum key length in bytes.
pub const MAX_KEY_LENGTH: usize = 254;

/// Largest allowed autoincrement step.
pub const MAX_INCREMENT: u64 = (1 << 16) - 1;

/// Returns true if `byte` may appear in a document key.
#[must_use]
pub const fn is_key_byte(byte: u8) -> bool {
    matches!(byte,
        b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9'
        | b'_' | b':' | b'.' | b'@' | b'(' | b')' | b'+' | b',' | b'='
        | b';' | b'$' | b'!' | b'*' | b'\'' | b'%' | b'-')
}

/// Returns true if `key` is syntactically a valid document key.
#[must_use]
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && key.len() <= MAX_KEY_LENGTH && key.bytes().all(is_key_byte)
}

/// Returns true if `id` looks like `collection/key`.
#[must_use]
pub fn is_valid_document_id(id: &str) -> bool {
    match id.split_once('/') {
        Some((collection, key)) => {
            !collection.is_empty()
                && collection
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
                && is_valid_key(key)
        }
        None => false,
    }
}

/// Generator strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyGeneratorKind {
    /// Increasing numeric keys derived from the log tick.
    Traditional,
    /// `offset + n * increment`.
    Autoincrement {
        /// First value handed out.
        offset: u64,
        /// Distance between two generated keys.
        increment: u64,
    },
    /// Never generates; every document must bring its own `_key`.
    UserOnly,
    /// Random v4 uuids in simple (hex) form.
    Uuid,
}

/// Persisted `keyOptions` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyOptions {
    /// Generator name: `traditional`, `autoincrement`, `useronly`, `uuid`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Whether callers may supply their own keys.
    pub allow_user_keys: bool,
    /// Autoincrement step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub increment: Option<u64>,
    /// Autoincrement start value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    /// Highest numeric key generated or tracked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_value: Option<u64>,
}

impl Default for KeyOptions {
    fn default() -> Self {
        Self {
            kind: "traditional".to_string(),
            allow_user_keys: true,
            increment: None,
            offset: None,
            last_value: None,
        }
    }
}

/// Key generator of one collection.
#[derive(Debug)]
pub struct KeyGenerator {
    kind: KeyGeneratorKind,
    allow_user_keys: bool,
    last_value: Mutex<u64>,
}

impl KeyGenerator {
    /// Creates a generator.
    #[must_use]
    pub fn new(kind: KeyGeneratorKind, allow_user_keys: bool) -> Self {
        Self {
            kind,
            allow_user_keys: allow_user_keys || kind == KeyGeneratorKind::UserOnly,
            last_value: Mutex::new(0),
        }
    }

    /// Builds a generator from a persisted options block.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` for an unknown generator type or an
    /// autoincrement step outside `1..=65535`.
    pub fn from_options(options: &KeyOptions) -> CoreResult<Self> {
        let kind = match options.kind.as_str() {
            "traditional" => KeyGeneratorKind::Traditional,
            "autoincrement" => {
                let increment = options.increment.unwrap_or(1);
                if increment == 0 || increment > MAX_INCREMENT {
                    return Err(CoreError::bad_parameter(format!(
                        "autoincrement increment must be in 1..={MAX_INCREMENT}, got {increment}"
                    )));
                }
                let offset = options.offset.unwrap_or(0);
                if offset == u64::MAX {
                    return Err(CoreError::bad_parameter("autoincrement offset is too large"));
                }
                KeyGeneratorKind::Autoincrement { offset, increment }
            }
            "useronly" => KeyGeneratorKind::UserOnly,
            "uuid" => KeyGeneratorKind::Uuid,
            other => {
                return Err(CoreError::bad_parameter(format!(
                    "invalid key generator {other:?}"
                )))
            }
        };
        let generator = Self::new(kind, options.allow_user_keys);
        *generator.last_value.lock() = options.last_value.unwrap_or(0);
        Ok(generator)
    }

    /// Serializes the generator state.
    #[must_use]
    pub fn to_options(&self) -> KeyOptions {
        let last_value = *self.last_value.lock();
        let (kind, increment, offset) = match self.kind {
            KeyGeneratorKind::Traditional => ("traditional", None, None),
            KeyGeneratorKind::Autoincrement { offset, increment } => {
                ("autoincrement", Some(increment), Some(offset))
            }
            KeyGeneratorKind::UserOnly => ("useronly", None, None),
            KeyGeneratorKind::Uuid => ("uuid", None, None),
        };
        KeyOptions {
            kind: kind.to_string(),
            allow_user_keys: self.allow_user_keys,
            increment,
            offset,
            last_value: (last_value > 0).then_some(last_value),
        }
    }

    /// Returns the generator strategy.
    #[must_use]
    pub fn kind(&self) -> KeyGeneratorKind {
        self.kind
    }

    /// Produces a fresh key. `hint` is a monotonic value (the current log
    /// tick) that traditional keys never fall behind.
    ///
    /// # Errors
    ///
    /// Returns `OutOfKeys` when the numeric space is exhausted and
    /// `DocumentKeyMissing` for user-only collections.
    pub fn generate(&self, hint: u64) -> CoreResult<String> {
        match self.kind {
            KeyGeneratorKind::Traditional => {
                let mut last = self.last_value.lock();
                let next = hint.max(*last).checked_add(1).ok_or(CoreError::OutOfKeys)?;
                *last = next;
                Ok(next.to_string())
            }
            KeyGeneratorKind::Autoincrement { offset, increment } => {
                let mut last = self.last_value.lock();
                let next = if *last < offset {
                    offset
                } else {
                    // next multiple of increment above last, counted from offset
                    let steps = (*last - offset) / increment + 1;
                    steps
                        .checked_mul(increment)
                        .and_then(|delta| offset.checked_add(delta))
                        .ok_or(CoreError::OutOfKeys)?
                };
                *last = next;
                Ok(next.to_string())
            }
            KeyGeneratorKind::UserOnly => Err(CoreError::DocumentKeyMissing),
            KeyGeneratorKind::Uuid => Ok(uuid::Uuid::new_v4().simple().to_string()),
        }
    }

    /// Checks a user-supplied key.
    ///
    /// During restore, keys are accepted even if the collection does not
    /// allow user keys, and autoincrement keys need not be numeric.
    ///
    /// # Errors
    ///
    /// Returns `DocumentKeyUnexpected` or `DocumentKeyBad`.
    pub fn validate(&self, key: &str, is_restore: bool) -> CoreResult<()> {
        if !self.allow_user_keys && !is_restore {
            return Err(CoreError::DocumentKeyUnexpected {
                key: key.to_string(),
            });
        }
        if !is_valid_key(key) {
            return Err(CoreError::DocumentKeyBad {
                key: key.to_string(),
            });
        }
        if matches!(self.kind, KeyGeneratorKind::Autoincrement { .. })
            && !is_restore
            && !key.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(CoreError::DocumentKeyBad {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    /// Records a key that entered the collection from outside.
    pub fn track(&self, key: &str) {
        if !matches!(
            self.kind,
            KeyGeneratorKind::Traditional | KeyGeneratorKind::Autoincrement { .. }
        ) {
            return;
        }
        if key.is_empty() || !key.bytes().all(|b| b.is_ascii_digit()) {
            return;
        }
        if let Ok(value) = key.parse::<u64>() {
            let mut last = self.last_value.lock();
            *last = (*last).max(value);
        }
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new(KeyGeneratorKind::Traditional, true)
    }
}
