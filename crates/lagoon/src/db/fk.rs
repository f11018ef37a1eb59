//! Module: db::fk
//! Responsibility: foreign-key semantics — upstream reference validation
//! on write, downstream policy enforcement on delete.
//! Does not own: cursor mechanics or event emission order beyond what the
//! policies require.
//! Boundary: every validator and handler runs inside the caller's task
//! context so all fan-out stays in one atomic commit.

use crate::{
    db::{DbShared, events::EventKind, facade},
    schema::{ForeignKeyDescriptor, OnDelete, Schema},
};
use lagoon_core::{
    adapter::{self, CursorWalk},
    capability::Direction,
    error::{ErrorClass, ErrorOrigin, InternalError},
    key::Key,
    obs::sink::{self, MetricsEvent},
    task::TaskContext,
    value::{Record, Value, canonical_cmp},
};
use futures::future::LocalBoxFuture;
use std::{cmp::Ordering, collections::BTreeMap, rc::Rc};

fn fk_missing(message: impl Into<String>) -> InternalError {
    InternalError::new(ErrorClass::FkMissing, ErrorOrigin::ForeignKey, message)
}

///
/// InboundEdge
/// One foreign-key edge seen from its target collection.
///

#[derive(Clone)]
pub(crate) struct InboundEdge {
    pub source_collection: String,
    pub source_field: String,
    pub on_delete: OnDelete,
}

///
/// ForeignKeyEngine
/// Per-collection validator and handler tables, built once at
/// initialization and read-only thereafter.
///

pub(crate) struct ForeignKeyEngine {
    upstream: BTreeMap<String, Vec<ForeignKeyDescriptor>>,
    downstream: BTreeMap<String, Vec<InboundEdge>>,
}

impl ForeignKeyEngine {
    pub fn from_schema(schema: &Schema) -> Self {
        let mut upstream: BTreeMap<String, Vec<ForeignKeyDescriptor>> = BTreeMap::new();
        let mut downstream: BTreeMap<String, Vec<InboundEdge>> = BTreeMap::new();

        for collection in &schema.collections {
            for fk in &collection.foreign_keys {
                upstream
                    .entry(collection.name.clone())
                    .or_default()
                    .push(fk.clone());
                downstream
                    .entry(fk.target_collection.clone())
                    .or_default()
                    .push(InboundEdge {
                        source_collection: collection.name.clone(),
                        source_field: fk.source_field.clone(),
                        on_delete: fk.on_delete,
                    });
            }
        }

        Self {
            upstream,
            downstream,
        }
    }

    fn upstream_of(&self, collection: &str) -> &[ForeignKeyDescriptor] {
        self.upstream
            .get(collection)
            .map_or(&[], Vec::as_slice)
    }

    fn downstream_of(&self, collection: &str) -> &[InboundEdge] {
        self.downstream
            .get(collection)
            .map_or(&[], Vec::as_slice)
    }
}

fn references(record: &Record, field: &str, target_key_value: &Value) -> bool {
    canonical_cmp(&record.field_or_null(field), target_key_value) == Ordering::Equal
}

/// Validate every declared upstream reference of one write candidate.
pub(crate) async fn validate_upstream(
    db: &Rc<DbShared>,
    ctx: &Rc<TaskContext>,
    collection: &str,
    record: &Record,
) -> Result<(), InternalError> {
    for fk in db.fk.upstream_of(collection) {
        let value = record.field_or_null(&fk.source_field);
        if value.is_null() {
            if fk.on_delete == OnDelete::SetNull {
                continue;
            }
            return Err(fk_missing(format!(
                "'{collection}.{}' is null but its policy is not set-null",
                fk.source_field
            )));
        }

        sink::record(&MetricsEvent::FkUpstreamCheck {
            collection: collection.to_string(),
        });

        let key = Key::try_from_value(value.clone()).map_err(|_| {
            fk_missing(format!(
                "'{collection}.{}' holds {value:?}, which is not a valid key into '{}'",
                fk.source_field, fk.target_collection
            ))
        })?;
        let store = ctx.object_store(&fk.target_collection)?;
        let target = adapter::request(store.get(&key)).await?;
        if target.is_none() {
            return Err(fk_missing(format!(
                "'{collection}.{}' references missing '{}' row {value:?}",
                fk.source_field, fk.target_collection
            )));
        }
    }

    Ok(())
}

/// Run every downstream handler for one row about to be deleted from
/// `target`. Recursion (cascade across multiple edges) stays on the same
/// task context, so the whole fan-out commits or aborts together.
pub(crate) fn handle_delete(
    db: Rc<DbShared>,
    ctx: Rc<TaskContext>,
    target: String,
    target_key_value: Value,
) -> LocalBoxFuture<'static, Result<(), InternalError>> {
    Box::pin(async move {
        let edges: Vec<InboundEdge> = db.fk.downstream_of(&target).to_vec();
        for edge in edges {
            match edge.on_delete {
                OnDelete::Cascade => {
                    cascade(&db, &ctx, &edge, &target_key_value).await?;
                }
                OnDelete::Restrict => {
                    restrict(&db, &ctx, &edge, &target, &target_key_value).await?;
                }
                OnDelete::SetNull => {
                    set_null(&db, &ctx, &edge, &target_key_value).await?;
                }
                OnDelete::NoAction => {
                    no_action(&db, &ctx, &edge, &target_key_value).await?;
                }
            }
        }
        Ok(())
    })
}

/// Delete every referencing row, recursing through its own downstream
/// handlers first. Delete events are queued per removed row.
async fn cascade(
    db: &Rc<DbShared>,
    ctx: &Rc<TaskContext>,
    edge: &InboundEdge,
    target_key_value: &Value,
) -> Result<(), InternalError> {
    let core = db.require_collection_core(&edge.source_collection)?;
    let store = ctx.object_store(&edge.source_collection)?;
    let mut walk = CursorWalk::new(store.open_cursor(None, Direction::Next));

    while let Some(row) = walk.next().await? {
        let record = facade::read_record(&core, row.row.value.clone())?;
        if !references(&record, &edge.source_field, target_key_value) {
            continue;
        }

        let row_key_value = facade::key_value_of(&core.descriptor, &record)?;
        handle_delete(
            db.clone(),
            ctx.clone(),
            edge.source_collection.clone(),
            row_key_value,
        )
        .await?;
        row.delete().await?;
        facade::queue_event(db, ctx, &edge.source_collection, EventKind::Delete, Some(record));
    }

    Ok(())
}

/// Fail the whole delete on the first referencing row.
async fn restrict(
    db: &Rc<DbShared>,
    ctx: &Rc<TaskContext>,
    edge: &InboundEdge,
    target: &str,
    target_key_value: &Value,
) -> Result<(), InternalError> {
    let core = db.require_collection_core(&edge.source_collection)?;
    let store = ctx.object_store(&edge.source_collection)?;
    let mut walk = CursorWalk::new(store.open_cursor(None, Direction::Next));

    while let Some(row) = walk.next().await? {
        let record = facade::read_record(&core, row.row.value)?;
        if references(&record, &edge.source_field, target_key_value) {
            sink::record(&MetricsEvent::FkDeleteBlocked {
                collection: edge.source_collection.clone(),
            });
            return Err(InternalError::new(
                ErrorClass::FkRestrict,
                ErrorOrigin::ForeignKey,
                format!(
                    "delete of '{target}' row {target_key_value:?} is blocked by '{}.{}'",
                    edge.source_collection, edge.source_field
                ),
            ));
        }
    }

    Ok(())
}

/// Rewrite every referencing field to null. Write events are queued per
/// rewritten row.
async fn set_null(
    db: &Rc<DbShared>,
    ctx: &Rc<TaskContext>,
    edge: &InboundEdge,
    target_key_value: &Value,
) -> Result<(), InternalError> {
    let core = db.require_collection_core(&edge.source_collection)?;
    let store = ctx.object_store(&edge.source_collection)?;
    let mut walk = CursorWalk::new(store.open_cursor(None, Direction::Next));

    while let Some(row) = walk.next().await? {
        let mut record = facade::read_record(&core, row.row.value.clone())?;
        if !references(&record, &edge.source_field, target_key_value) {
            continue;
        }

        record.set(edge.source_field.clone(), Value::Null);
        row.update(facade::write_wire(&core, record.clone())).await?;
        facade::queue_event(db, ctx, &edge.source_collection, EventKind::Write, Some(record));
    }

    Ok(())
}

/// Defer the decision: queue one pre-commit re-validation per referencing
/// row, keyed by `(collection, row key)` so repeated deletes stay
/// idempotent. A referencer left dangling at commit aborts with
/// `fk-missing`; one re-pointed (or deleted) in the same transaction
/// passes.
async fn no_action(
    db: &Rc<DbShared>,
    ctx: &Rc<TaskContext>,
    edge: &InboundEdge,
    target_key_value: &Value,
) -> Result<(), InternalError> {
    let core = db.require_collection_core(&edge.source_collection)?;
    let store = ctx.object_store(&edge.source_collection)?;
    let mut walk = CursorWalk::new(store.open_cursor(None, Direction::Next));

    while let Some(row) = walk.next().await? {
        let record = facade::read_record(&core, row.row.value)?;
        if !references(&record, &edge.source_field, target_key_value) {
            continue;
        }

        let row_key = Key::try_from_value(facade::key_value_of(&core.descriptor, &record)?)?;
        let (db, collection) = (db.clone(), edge.source_collection.clone());
        ctx.on_will_commit((collection.clone(), row_key.clone()), move |ctx| {
            Box::pin(async move {
                let core = db.require_collection_core(&collection)?;
                let store = ctx.object_store(&collection)?;
                let Some(wire) = adapter::request(store.get(&row_key)).await? else {
                    return Ok(());
                };
                let record = facade::read_record(&core, wire)?;
                validate_upstream(&db, &ctx, &collection, &record).await
            })
        });
    }

    Ok(())
}
