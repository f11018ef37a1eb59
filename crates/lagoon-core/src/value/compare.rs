use crate::value::Value;
use std::{cmp::Ordering, collections::BTreeMap};

/// Total canonical comparator used by key ordering, index ordering and
/// relation matching.
///
/// Ordering rules:
/// 1. Canonical variant rank
/// 2. Variant-specific comparison for same-ranked values
///
/// All numeric variants share one rank and compare numerically, so an
/// `Int(2)` key and a `Uint(2)` field value are the same key.
#[must_use]
pub fn canonical_cmp(left: &Value, right: &Value) -> Ordering {
    let rank = left.canonical_rank().cmp(&right.canonical_rank());
    if rank != Ordering::Equal {
        return rank;
    }

    canonical_cmp_same_rank(left, right)
}

///
/// NumericRepr
/// Lossless-where-possible numeric view for cross-variant comparison.
///

enum NumericRepr {
    Exact(i128),
    Approx(f64),
}

fn numeric_repr(value: &Value) -> Option<NumericRepr> {
    match value {
        Value::Int(v) => Some(NumericRepr::Exact(i128::from(*v))),
        Value::Uint(v) => Some(NumericRepr::Exact(i128::from(*v))),
        Value::Float(f) => Some(NumericRepr::Approx(f.0)),
        _ => None,
    }
}

#[allow(clippy::cast_precision_loss)]
fn numeric_cmp(left: &Value, right: &Value) -> Ordering {
    match (numeric_repr(left), numeric_repr(right)) {
        (Some(NumericRepr::Exact(a)), Some(NumericRepr::Exact(b))) => a.cmp(&b),
        (Some(a), Some(b)) => {
            let a = match a {
                NumericRepr::Exact(v) => v as f64,
                NumericRepr::Approx(v) => v,
            };
            let b = match b {
                NumericRepr::Exact(v) => v as f64,
                NumericRepr::Approx(v) => v,
            };
            a.total_cmp(&b)
        }
        // Unreachable for same-rank numeric inputs; deterministic fallback.
        _ => Ordering::Equal,
    }
}

fn canonical_cmp_same_rank(left: &Value, right: &Value) -> Ordering {
    #[allow(clippy::match_same_arms)]
    match (left, right) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
        (Value::Text(a), Value::Text(b)) => a.cmp(b),
        (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
        (Value::List(a), Value::List(b)) => canonical_cmp_list(a, b),
        (Value::Map(a), Value::Map(b)) => canonical_cmp_map(a, b),
        _ => numeric_cmp(left, right),
    }
}

fn canonical_cmp_list(left: &[Value], right: &[Value]) -> Ordering {
    for (left, right) in left.iter().zip(right.iter()) {
        let cmp = canonical_cmp(left, right);
        if cmp != Ordering::Equal {
            return cmp;
        }
    }

    left.len().cmp(&right.len())
}

fn canonical_cmp_map(left: &BTreeMap<String, Value>, right: &BTreeMap<String, Value>) -> Ordering {
    for ((left_key, left_value), (right_key, right_value)) in left.iter().zip(right.iter()) {
        let key_cmp = left_key.cmp(right_key);
        if key_cmp != Ordering::Equal {
            return key_cmp;
        }

        let value_cmp = canonical_cmp(left_value, right_value);
        if value_cmp != Ordering::Equal {
            return value_cmp;
        }
    }

    left.len().cmp(&right.len())
}
