mod compare;

#[cfg(test)]
mod tests;

use derive_more::{Deref, DerefMut};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, collections::BTreeMap};

pub use compare::canonical_cmp;

///
/// Float
/// Canonical f64 carrier with a total order (`total_cmp`), so values
/// containing floats stay sortable and equality-comparable.
///

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct Float(pub f64);

impl PartialEq for Float {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for Float {}

impl PartialOrd for Float {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Float {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

///
/// Value
/// Canonical runtime value model for records, keys and wire payloads.
///
/// Null      → the field is absent / SQL-NULL-like.
/// Timestamp → milliseconds since the epoch; ordered between numbers
///             and text so date keys sort the way the store sorts them.
/// Map       → string-keyed, deterministically ordered (BTreeMap).
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Value {
    Blob(Vec<u8>),
    Bool(bool),
    Float(Float),
    Int(i64),
    /// Ordered list of values. List order is preserved.
    List(Vec<Self>),
    /// Canonical deterministic map representation; insertion order is
    /// discarded and keys are unique.
    Map(BTreeMap<String, Self>),
    Null,
    Text(String),
    Timestamp(i64),
    Uint(u64),
}

impl Value {
    /// Build a `Value::List` from a list literal.
    ///
    /// Intended for tests and inline construction.
    pub fn from_slice<T>(items: &[T]) -> Self
    where
        T: Into<Self> + Clone,
    {
        Self::List(items.iter().cloned().map(Into::into).collect())
    }

    /// Canonical variant rank; the first comparison tier of `canonical_cmp`.
    #[must_use]
    pub const fn canonical_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Uint(_) | Self::Float(_) => 2,
            Self::Timestamp(_) => 3,
            Self::Text(_) => 4,
            Self::Blob(_) => 5,
            Self::List(_) => 6,
            Self::Map(_) => 7,
        }
    }

    /// True when the value may appear inside a store key.
    ///
    /// Mirrors the store capability's key rules: numbers, timestamps,
    /// text, and lists thereof. NaN is not a valid key component.
    #[must_use]
    pub fn is_keyable(&self) -> bool {
        match self {
            Self::Int(_) | Self::Uint(_) | Self::Text(_) | Self::Timestamp(_) => true,
            Self::Float(f) => !f.0.is_nan(),
            Self::List(items) => items.iter().all(Self::is_keyable),
            _ => false,
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub const fn as_text(&self) -> Option<&String> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_map(&self) -> Option<&BTreeMap<String, Self>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::Uint(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(Float(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Record> for Value {
    fn from(v: Record) -> Self {
        Self::Map(v.0)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<Self>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

///
/// Record
/// A string-keyed row as user code sees it. Backed by the canonical
/// map representation; field order is deterministic.
///

#[derive(Clone, Debug, Default, Deref, DerefMut, Deserialize, Eq, PartialEq, Serialize)]
pub struct Record(BTreeMap<String, Value>);

impl Record {
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Read a field; absent fields read as `None`, not `Value::Null`.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Read a field, treating absence as null.
    #[must_use]
    pub fn field_or_null(&self, name: &str) -> Value {
        self.0.get(name).cloned().unwrap_or(Value::Null)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    #[must_use]
    pub fn contains_field(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Map(self.0)
    }

    /// Recover a record from a wire value; non-map wires are rejected
    /// by the caller with its own error context.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Map(map) => Some(Self(map)),
            _ => None,
        }
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Build a [`Record`] from field/value pairs.
///
/// ```ignore
/// let user = record! { "id" => 1, "name" => "ada" };
/// ```
#[macro_export]
macro_rules! record {
    () => { $crate::value::Record::new() };
    ($($key:literal => $value:expr),* $(,)?) => {{
        let mut rec = $crate::value::Record::new();
        $( rec.set($key, $crate::value::Value::from($value)); )*
        rec
    }};
}
