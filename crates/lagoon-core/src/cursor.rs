//! Module: cursor
//! Responsibility: the shared serial-scan patterns every read and mutation
//! path reuses. Scans yield one row at a time to keep the owning transaction
//! live across suspension points.
//! Does not own: predicate semantics or relation loading; callers supply
//! deserialization and hooks.

use crate::{adapter::CursorWalk, capability::Cursor, error::InternalError, value::Record};
use futures::future::LocalBoxFuture;
use std::rc::Rc;

/// Sequential predicate scan; yields records where `predicate` holds,
/// stopping after `limit` matches.
pub async fn find_by_predicate<D, P>(
    cursor: Rc<dyn Cursor>,
    mut deserialize: D,
    mut predicate: P,
    limit: Option<usize>,
) -> Result<Vec<Record>, InternalError>
where
    D: FnMut(crate::value::Value) -> Result<Record, InternalError>,
    P: FnMut(&Record) -> bool,
{
    let max = limit.unwrap_or(usize::MAX);
    let mut matches = Vec::new();
    if max == 0 {
        return Ok(matches);
    }

    let mut walk = CursorWalk::new(cursor);
    while let Some(row) = walk.next().await? {
        let record = deserialize(row.row.value)?;
        if predicate(&record) {
            matches.push(record);
            if matches.len() >= max {
                break;
            }
        }
    }

    Ok(matches)
}

/// Predicate scan that removes matching rows in place.
///
/// `on_before_delete` runs (and is awaited) before the cursor's current
/// row is removed, so downstream checks happen inside the same
/// transaction; `on_after_delete` runs after removal.
pub async fn delete_by_predicate<D, P, B, A>(
    cursor: Rc<dyn Cursor>,
    mut deserialize: D,
    mut predicate: P,
    limit: Option<usize>,
    mut on_before_delete: B,
    mut on_after_delete: A,
) -> Result<Vec<Record>, InternalError>
where
    D: FnMut(crate::value::Value) -> Result<Record, InternalError>,
    P: FnMut(&Record) -> bool,
    B: FnMut(&Record) -> LocalBoxFuture<'static, Result<(), InternalError>>,
    A: FnMut(&Record),
{
    let max = limit.unwrap_or(usize::MAX);
    let mut removed = Vec::new();
    if max == 0 {
        return Ok(removed);
    }

    let mut walk = CursorWalk::new(cursor);
    while let Some(row) = walk.next().await? {
        let record = deserialize(row.row.value.clone())?;
        if !predicate(&record) {
            continue;
        }

        on_before_delete(&record).await?;
        row.delete().await?;
        on_after_delete(&record);

        removed.push(record);
        if removed.len() >= max {
            break;
        }
    }

    Ok(removed)
}

/// First record under the cursor's direction, or `None` on an empty walk.
pub async fn first_by_direction<D>(
    cursor: Rc<dyn Cursor>,
    mut deserialize: D,
) -> Result<Option<Record>, InternalError>
where
    D: FnMut(crate::value::Value) -> Result<Record, InternalError>,
{
    let mut walk = CursorWalk::new(cursor);
    match walk.next().await? {
        Some(row) => Ok(Some(deserialize(row.row.value)?)),
        None => Ok(None),
    }
}
