//! Module: db::relation
//! Responsibility: eager relation loading for `with` graphs.
//! Strategy: one cursor walk over the target collection per edge —
//! per-source point lookups would grow with the source batch, while a
//! single scan is O(|target|) and holds the transaction open for the
//! minimum time.
//! Boundary: runs on the host query's task context; never opens its own
//! transaction.

use crate::{
    db::{CollectionCore, DbShared, facade},
    schema::{Predicate, RelationKind},
};
use futures::future::LocalBoxFuture;
use lagoon_core::{
    adapter::CursorWalk,
    capability::Direction,
    error::{ErrorOrigin, InternalError},
    key::Key,
    obs::sink::{self, MetricsEvent},
    task::TaskContext,
    value::{Record, Value},
};
use std::{collections::BTreeMap, rc::Rc};

///
/// WithEdge
/// Per-edge eager-load options: a row filter, a per-source match limit,
/// and a nested `with` graph resolved on the attached rows.
///

#[derive(Clone, Default)]
pub struct WithEdge {
    pub filter: Option<Predicate>,
    pub limit: Option<usize>,
    pub nested: Option<WithSpec>,
}

impl WithEdge {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn filter(mut self, f: impl Fn(&Record) -> bool + 'static) -> Self {
        self.filter = Some(Rc::new(f));
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn nested(mut self, spec: WithSpec) -> Self {
        self.nested = Some(spec);
        self
    }
}

///
/// WithSpec
/// A `with` graph: relation name → edge options. The graph is finite
/// and user-provided, so resolution terminates even over cyclic
/// relation declarations.
///

#[derive(Clone, Default)]
pub struct WithSpec {
    pub edges: BTreeMap<String, WithEdge>,
}

impl WithSpec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a relation with default options.
    #[must_use]
    pub fn load(mut self, name: &str) -> Self {
        self.edges.insert(name.to_string(), WithEdge::default());
        self
    }

    /// Load a relation with explicit per-edge options.
    #[must_use]
    pub fn load_with(mut self, name: &str, edge: WithEdge) -> Self {
        self.edges.insert(name.to_string(), edge);
        self
    }
}

/// Resolve a `with` graph onto a batch of already-loaded source records.
pub(crate) fn resolve<'a>(
    db: &'a Rc<DbShared>,
    ctx: &'a Rc<TaskContext>,
    source: &'a Rc<CollectionCore>,
    records: &'a mut [Record],
    spec: &'a WithSpec,
) -> LocalBoxFuture<'a, Result<(), InternalError>> {
    Box::pin(async move {
        for (name, edge) in &spec.edges {
            resolve_edge(db, ctx, source, records, name, edge).await?;
        }
        Ok(())
    })
}

async fn resolve_edge(
    db: &Rc<DbShared>,
    ctx: &Rc<TaskContext>,
    source: &Rc<CollectionCore>,
    records: &mut [Record],
    name: &str,
    edge: &WithEdge,
) -> Result<(), InternalError> {
    let Some(relation) = source.relations.get(name) else {
        return Err(InternalError::internal(
            ErrorOrigin::Relation,
            format!(
                "collection '{}' has no relation named '{name}'",
                source.descriptor.name
            ),
        ));
    };
    let target_core = db.require_collection_core(&relation.target)?;
    ctx.observe(&relation.target);

    // Initialize every source record's relation field.
    let empty = match relation.kind {
        RelationKind::OneToOne => Value::Null,
        RelationKind::OneToMany => Value::List(Vec::new()),
    };
    for record in records.iter_mut() {
        record.set(name.to_string(), empty.clone());
    }

    // Group waiting sources by their join-key value.
    let mut waiting: BTreeMap<Key, Vec<usize>> = BTreeMap::new();
    for (idx, record) in records.iter().enumerate() {
        let value = record.field_or_null(&relation.source_field);
        let Ok(key) = Key::try_from_value(value) else {
            continue;
        };
        waiting.entry(key).or_default().push(idx);
    }

    let limit = edge.limit.unwrap_or(usize::MAX);
    let mut counts = vec![0usize; records.len()];
    let mut matches: Vec<(Record, Vec<usize>)> = Vec::new();

    // One walk over the target collection; stop as soon as every source
    // is satisfied.
    let store = ctx.object_store(&relation.target)?;
    let mut walk = CursorWalk::new(store.open_cursor(None, Direction::Next));
    let mut scanned = 0u64;
    while !waiting.is_empty() {
        let Some(row) = walk.next().await? else {
            break;
        };
        scanned += 1;

        let target_record = facade::read_record(&target_core, row.row.value)?;
        let Ok(target_key) =
            Key::try_from_value(target_record.field_or_null(&relation.target_field))
        else {
            continue;
        };
        if !waiting.contains_key(&target_key) {
            continue;
        }
        if let Some(filter) = &edge.filter
            && !filter(&target_record)
        {
            continue;
        }

        match relation.kind {
            RelationKind::OneToOne => {
                let indices = waiting.remove(&target_key).unwrap_or_default();
                matches.push((target_record, indices));
            }
            RelationKind::OneToMany => {
                let Some(indices) = waiting.get_mut(&target_key) else {
                    continue;
                };
                let mut attach_to = Vec::new();
                let mut remaining = Vec::new();
                for &idx in indices.iter() {
                    attach_to.push(idx);
                    counts[idx] += 1;
                    if counts[idx] < limit {
                        remaining.push(idx);
                    }
                }
                if remaining.is_empty() {
                    waiting.remove(&target_key);
                } else {
                    *indices = remaining;
                }
                matches.push((target_record, attach_to));
            }
        }
    }
    sink::record(&MetricsEvent::RowsScanned {
        collection: relation.target.clone(),
        rows: scanned,
    });

    // Resolve nested graphs on the accumulated targets, then attach.
    if let Some(nested) = &edge.nested
        && !matches.is_empty()
    {
        let mut targets: Vec<Record> = matches.iter().map(|(t, _)| t.clone()).collect();
        resolve(db, ctx, &target_core, &mut targets, nested).await?;
        for ((slot, _), resolved) in matches.iter_mut().zip(targets) {
            *slot = resolved;
        }
    }

    for (target_record, indices) in matches {
        let value = target_record.into_value();
        for idx in indices {
            match relation.kind {
                RelationKind::OneToOne => {
                    records[idx].set(name.to_string(), value.clone());
                }
                RelationKind::OneToMany => {
                    if let Some(Value::List(items)) = records[idx].get_mut(name) {
                        items.push(value.clone());
                    }
                }
            }
        }
    }

    Ok(())
}
