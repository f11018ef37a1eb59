use crate::{
    error::{ErrorClass, ErrorOrigin, InternalError},
    value::{Value, canonical_cmp},
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error as ThisError;

///
/// KeyError
///

#[derive(Debug, ThisError)]
pub enum KeyError {
    #[error("value is not a valid key component: {0:?}")]
    NotKeyable(Value),

    #[error("key path field '{0}' is missing from the value")]
    MissingField(String),
}

impl From<KeyError> for InternalError {
    fn from(err: KeyError) -> Self {
        Self::new(ErrorClass::Store, ErrorOrigin::Capability, err.to_string())
    }
}

///
/// Key
/// A validated store key: numbers, timestamps, text, or lists thereof,
/// totally ordered by the canonical value comparator.
///

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Key(Value);

impl Key {
    pub fn try_from_value(value: Value) -> Result<Self, KeyError> {
        if value.is_keyable() {
            Ok(Self(value))
        } else {
            Err(KeyError::NotKeyable(value))
        }
    }

    #[must_use]
    pub const fn as_value(&self) -> &Value {
        &self.0
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        self.0
    }
}

// Equality must agree with the canonical order, so `Int(2)` and
// `Uint(2)` are one key.
impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        canonical_cmp(&self.0, &other.0)
    }
}

impl TryFrom<Value> for Key {
    type Error = KeyError;

    fn try_from(value: Value) -> Result<Self, KeyError> {
        Self::try_from_value(value)
    }
}

///
/// KeyRange
/// Typed key interval with per-bound openness, as the store capability
/// models it. An unbounded side is `None`.
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct KeyRange {
    pub lower: Option<Key>,
    pub upper: Option<Key>,
    pub lower_open: bool,
    pub upper_open: bool,
}

impl KeyRange {
    /// The unbounded range.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            lower: None,
            upper: None,
            lower_open: false,
            upper_open: false,
        }
    }

    /// Range containing exactly one key.
    #[must_use]
    pub fn only(key: Key) -> Self {
        Self {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        }
    }

    #[must_use]
    pub const fn lower_bound(key: Key, open: bool) -> Self {
        Self {
            lower: Some(key),
            upper: None,
            lower_open: open,
            upper_open: false,
        }
    }

    #[must_use]
    pub const fn upper_bound(key: Key, open: bool) -> Self {
        Self {
            lower: None,
            upper: Some(key),
            lower_open: false,
            upper_open: open,
        }
    }

    #[must_use]
    pub const fn bound(lower: Key, upper: Key, lower_open: bool, upper_open: bool) -> Self {
        Self {
            lower: Some(lower),
            upper: Some(upper),
            lower_open,
            upper_open,
        }
    }

    #[must_use]
    pub fn contains(&self, key: &Key) -> bool {
        if let Some(lower) = &self.lower {
            match key.cmp(lower) {
                Ordering::Less => return false,
                Ordering::Equal if self.lower_open => return false,
                _ => {}
            }
        }
        if let Some(upper) = &self.upper {
            match key.cmp(upper) {
                Ordering::Greater => return false,
                Ordering::Equal if self.upper_open => return false,
                _ => {}
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(v: i64) -> Key {
        Key::try_from_value(Value::Int(v)).unwrap()
    }

    #[test]
    fn rejects_unkeyable_values() {
        assert!(Key::try_from_value(Value::Null).is_err());
        assert!(Key::try_from_value(Value::Bool(true)).is_err());
        assert!(Key::try_from_value(Value::from_slice(&[1i64, 2])).is_ok());
    }

    #[test]
    fn only_contains_exactly_one_key() {
        let range = KeyRange::only(key(5));
        assert!(range.contains(&key(5)));
        assert!(!range.contains(&key(4)));
        assert!(!range.contains(&key(6)));
    }

    #[test]
    fn open_bounds_exclude_endpoints() {
        let range = KeyRange::bound(key(1), key(3), true, false);
        assert!(!range.contains(&key(1)));
        assert!(range.contains(&key(2)));
        assert!(range.contains(&key(3)));

        let range = KeyRange::upper_bound(key(3), true);
        assert!(range.contains(&key(i64::MIN)));
        assert!(!range.contains(&key(3)));
    }
}
