//! Module: db::coordinator
//! Responsibility: give every facade operation a task context without
//! exposing transaction objects unless the caller opened one.
//! Boundary: an inherited ambient context is reused as-is (its owner
//! settles the transaction); otherwise a fresh transaction spanning all
//! stores is opened so foreign-key enforcement can touch any collection.

use crate::db::{DbShared, ensure_open};
use lagoon_core::{
    capability::{Durability, TxMode},
    error::InternalError,
    task::TaskContext,
};
use std::rc::Rc;

/// Run one mutating task. Tasks submitted while the store is still
/// initializing await the shared open in submission order.
pub(crate) async fn queue_task<T, F, Fut>(
    db: &Rc<DbShared>,
    ambient: Option<Rc<TaskContext>>,
    f: F,
) -> Result<T, InternalError>
where
    F: FnOnce(Rc<TaskContext>) -> Fut,
    Fut: Future<Output = Result<T, InternalError>>,
{
    if let Some(ctx) = ambient {
        return f(ctx).await;
    }

    let conn = ensure_open(db).await?;
    let scope = conn.store_names();
    let tx = conn.transaction(&scope, TxMode::ReadWrite, Durability::Default)?;
    let ctx = TaskContext::new(tx);
    ctx.run(f).await
}

/// Run one read-only task; same ambient rules on a read transaction.
pub(crate) async fn queue_read_task<T, F, Fut>(
    db: &Rc<DbShared>,
    ambient: Option<Rc<TaskContext>>,
    f: F,
) -> Result<T, InternalError>
where
    F: FnOnce(Rc<TaskContext>) -> Fut,
    Fut: Future<Output = Result<T, InternalError>>,
{
    if let Some(ctx) = ambient {
        return f(ctx).await;
    }

    let conn = ensure_open(db).await?;
    let scope = conn.store_names();
    let tx = conn.transaction(&scope, TxMode::ReadOnly, Durability::Default)?;
    let ctx = TaskContext::new(tx);
    ctx.run(f).await
}
