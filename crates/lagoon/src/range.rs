//! Module: range
//! Responsibility: the declarative key-range DSL and its compilation
//! rules. The `range!` macro collects bound tokens; `compile` enforces
//! the grammar and produces a typed `KeyRange`.

use crate::error::Error;
use lagoon_core::{
    Key, KeyRange,
    error::{ErrorClass, ErrorOrigin, InternalError},
    value::Value,
};
use std::cmp::Ordering;

///
/// RangeBound
/// One bound marker of the range DSL.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RangeBound {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
}

fn range_err(message: impl Into<String>) -> Error {
    InternalError::new(ErrorClass::RangeInvalid, ErrorOrigin::Range, message).into()
}

fn bound_key(bound: RangeBound, value: &Value) -> Result<Key, Error> {
    Key::try_from_value(value.clone())
        .map_err(|err| range_err(format!("bound {bound:?} is not a valid key: {err}")))
}

/// Compile collected bound tokens into a key range.
///
/// Rules: `=` may not combine with other bounds; duplicate lower or
/// upper bounds are errors; an empty expression is an error; an
/// inverted range (`lower > upper`) is an error.
pub fn compile(tokens: &[(RangeBound, Value)]) -> Result<KeyRange, Error> {
    if tokens.is_empty() {
        return Err(range_err("empty range expression"));
    }

    if let Some((_, value)) = tokens.iter().find(|(bound, _)| *bound == RangeBound::Eq) {
        if tokens.len() > 1 {
            return Err(range_err("'=' may not combine with other bounds"));
        }
        return Ok(KeyRange::only(bound_key(RangeBound::Eq, value)?));
    }

    let mut lower: Option<(Key, bool)> = None;
    let mut upper: Option<(Key, bool)> = None;

    for (bound, value) in tokens {
        let key = bound_key(*bound, value)?;
        match bound {
            RangeBound::Gt | RangeBound::Ge => {
                if lower.is_some() {
                    return Err(range_err("duplicate lower bound"));
                }
                lower = Some((key, *bound == RangeBound::Gt));
            }
            RangeBound::Lt | RangeBound::Le => {
                if upper.is_some() {
                    return Err(range_err("duplicate upper bound"));
                }
                upper = Some((key, *bound == RangeBound::Lt));
            }
            RangeBound::Eq => unreachable!("handled above"),
        }
    }

    if let (Some((lower_key, _)), Some((upper_key, _))) = (&lower, &upper)
        && lower_key.cmp(upper_key) == Ordering::Greater
    {
        return Err(range_err("lower bound is greater than upper bound"));
    }

    Ok(match (lower, upper) {
        (Some((lower, lower_open)), Some((upper, upper_open))) => {
            KeyRange::bound(lower, upper, lower_open, upper_open)
        }
        (Some((lower, open)), None) => KeyRange::lower_bound(lower, open),
        (None, Some((upper, open))) => KeyRange::upper_bound(upper, open),
        (None, None) => unreachable!("tokens are non-empty and not '='"),
    })
}

/// Build a [`lagoon_core::KeyRange`] from bound markers and values.
///
/// ```ignore
/// let r = range!(>= 20, <= 30)?;   // closed interval
/// let r = range!(> 20, <= 30)?;    // half-open
/// let r = range!(= 25)?;           // single key
/// ```
#[macro_export]
macro_rules! range {
    () => {
        $crate::range::compile(&[])
    };
    ($($op:tt $value:expr),+ $(,)?) => {
        $crate::range::compile(&[
            $(($crate::range_bound!($op), $crate::Value::from($value))),+
        ])
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! range_bound {
    (>) => {
        $crate::range::RangeBound::Gt
    };
    (>=) => {
        $crate::range::RangeBound::Ge
    };
    (<) => {
        $crate::range::RangeBound::Lt
    };
    (<=) => {
        $crate::range::RangeBound::Le
    };
    (=) => {
        $crate::range::RangeBound::Eq
    };
}
