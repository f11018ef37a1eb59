//! Module: db::facade
//! Responsibility: the per-collection CRUD and query surface.
//! Every mutating operation runs inside a task context obtained from the
//! coordinator; events are queued as post-commit hooks and therefore fire
//! only after the owning transaction commits. Aborted transactions emit
//! nothing.

use crate::{
    db::{
        CollectionCore, DbShared, active::ActiveRecord, coordinator, drain_selectors, ensure_open,
        events::{EventKind, Listener, ListenerId},
        fk, relation,
        relation::WithSpec,
        tabs::TabMessage,
    },
    error::Error,
    schema::{CollectionDescriptor, IdMode, apply_defaults},
};
use futures::{Stream, stream};
use lagoon_core::{
    adapter::{self, CursorWalk},
    capability::{Direction, Durability, TxMode},
    cursor as cursor_engine,
    error::{ErrorClass, ErrorOrigin, InternalError},
    key::{Key, KeyRange},
    obs::sink::{self, MetricsEvent},
    task::TaskContext,
    value::{Record, Value},
};
use std::{collections::VecDeque, rc::Rc};

/// Batch size for relation resolution inside `iterate`. Per-record
/// resolution would multiply round-trips; unbatched buffering would defer
/// the first yield until the full walk completed.
const RELATION_BATCH: usize = 100;

pub(crate) fn read_record(core: &CollectionCore, wire: Value) -> Result<Record, InternalError> {
    (core.descriptor.serialization.read)(wire).map_err(InternalError::from)
}

pub(crate) fn write_wire(core: &CollectionCore, record: Record) -> Value {
    (core.descriptor.serialization.write)(record)
}

/// The record's key value under the collection's key path: the field
/// itself for single-field keys, an ordered tuple otherwise.
pub(crate) fn key_value_of(
    descriptor: &CollectionDescriptor,
    record: &Record,
) -> Result<Value, InternalError> {
    if descriptor.key_path.len() == 1 {
        let value = record.field_or_null(&descriptor.key_path[0]);
        if value.is_null() {
            return Err(InternalError::store(
                ErrorOrigin::Facade,
                format!(
                    "'{}' record is missing key field '{}'",
                    descriptor.name, descriptor.key_path[0]
                ),
            ));
        }
        return Ok(value);
    }

    let mut parts = Vec::with_capacity(descriptor.key_path.len());
    for field in &descriptor.key_path {
        let value = record.field_or_null(field);
        if value.is_null() {
            return Err(InternalError::store(
                ErrorOrigin::Facade,
                format!("'{}' record is missing key field '{field}'", descriptor.name),
            ));
        }
        parts.push(value);
    }
    Ok(Value::List(parts))
}

fn reject_relation_fields(core: &CollectionCore, record: &Record) -> Result<(), InternalError> {
    for name in core.relations.keys() {
        if record.contains_field(name) {
            return Err(InternalError::new(
                ErrorClass::RelationConflict,
                ErrorOrigin::Facade,
                format!(
                    "'{}' record carries reserved relation field '{name}'",
                    core.descriptor.name
                ),
            ));
        }
    }
    Ok(())
}

fn require_index(core: &CollectionCore, index: &str) -> Result<(), InternalError> {
    if core.descriptor.indexes.iter().any(|i| i.name == index) {
        Ok(())
    } else {
        Err(InternalError::new(
            ErrorClass::UnknownIndex,
            ErrorOrigin::Facade,
            format!(
                "collection '{}' has no index named '{index}'",
                core.descriptor.name
            ),
        ))
    }
}

/// Queue one post-commit event emission on the task context (I4).
pub(crate) fn queue_event(
    db: &Rc<DbShared>,
    ctx: &Rc<TaskContext>,
    collection: &str,
    kind: EventKind,
    record: Option<Record>,
) {
    let db = db.clone();
    let collection = collection.to_string();
    ctx.on_did_commit(move || emit_committed(&db, &collection, kind, record.as_ref()));
}

/// Emit one committed event locally and relay it to sibling tabs unless
/// this facade is currently replaying a relayed event.
pub(crate) fn emit_committed(
    db: &Rc<DbShared>,
    collection: &str,
    kind: EventKind,
    payload: Option<&Record>,
) {
    let Some(core) = db.collection_core(collection) else {
        return;
    };

    sink::record(&MetricsEvent::EventEmitted {
        collection: collection.to_string(),
    });
    core.events.emit(kind, payload, &|message| {
        db.report_listener_fault(collection, message);
    });

    if db.relay_events && !core.relaying.get() {
        let wire = payload.map(|record| write_wire(&core, record.clone()));
        if let Some(tab) = &*db.tab.borrow() {
            tab.post(&TabMessage::Relay {
                collection: collection.to_string(),
                event: kind.to_string(),
                wire,
            });
        }
    }
}

///
/// QueryOptions
///

#[derive(Clone, Default)]
pub struct QueryOptions {
    pub limit: Option<usize>,
    pub with: Option<WithSpec>,
}

///
/// IndexRangeOptions
///

#[derive(Clone)]
pub struct IndexRangeOptions {
    pub key_range: Option<KeyRange>,
    pub direction: Direction,
    pub limit: Option<usize>,
    pub with: Option<WithSpec>,
}

impl Default for IndexRangeOptions {
    fn default() -> Self {
        Self {
            key_range: None,
            direction: Direction::Next,
            limit: None,
            with: None,
        }
    }
}

///
/// IterateOptions
///

#[derive(Clone)]
pub struct IterateOptions {
    pub index: Option<String>,
    pub key_range: Option<KeyRange>,
    pub direction: Direction,
    pub with: Option<WithSpec>,
}

impl Default for IterateOptions {
    fn default() -> Self {
        Self {
            index: None,
            key_range: None,
            direction: Direction::Next,
            with: None,
        }
    }
}

///
/// Collection
/// Per-collection facade. Clones are cheap handles onto the same
/// collection; a clone bound to an ambient task context (inside a user
/// transaction or a selector evaluation) reuses that transaction for
/// every operation (I5).
///

#[derive(Clone)]
pub struct Collection {
    pub(crate) db: Rc<DbShared>,
    pub(crate) core: Rc<CollectionCore>,
    pub(crate) ambient: Option<Rc<TaskContext>>,
}

impl Collection {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.descriptor.name
    }

    /// Drive selector refreshes queued by this operation's events.
    /// Skipped under an ambient context: the owning transaction is still
    /// live, and refreshes run when it settles.
    async fn settle_after_write(&self) {
        if self.ambient.is_none() {
            drain_selectors(&self.db).await;
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub async fn create(&self, dto: Record) -> Result<Record, Error> {
        let result = self.create_inner(dto).await;
        self.settle_after_write().await;
        result.map_err(Error::from)
    }

    async fn create_inner(&self, dto: Record) -> Result<Record, InternalError> {
        reject_relation_fields(&self.core, &dto)?;
        let mut record = dto;
        apply_defaults(
            &self.core.descriptor.fields,
            &self.db.schema.shapes,
            &mut record,
        );
        if let Some(transform) = &self.core.descriptor.transformers.create {
            record = transform(record);
        }

        let db = self.db.clone();
        let core = self.core.clone();
        coordinator::queue_task(&self.db, self.ambient.clone(), move |ctx| async move {
            let mut record = record;
            let name = core.descriptor.name.clone();
            fk::validate_upstream(&db, &ctx, &name, &record).await?;

            let store = ctx.object_store(&name)?;
            let key = adapter::request(store.add(write_wire(&core, record.clone()))).await?;
            if core.descriptor.id_mode == IdMode::AutoIncrement {
                record.set(core.descriptor.key_path[0].clone(), key.as_value().clone());
            }

            queue_event(&db, &ctx, &name, EventKind::Write, Some(record.clone()));
            Ok(record)
        })
        .await
    }

    pub async fn create_active(&self, dto: Record) -> Result<ActiveRecord, Error> {
        let record = self.create(dto).await?;
        Ok(ActiveRecord::new(self.clone(), record))
    }

    pub async fn update(&self, record: Record) -> Result<Record, Error> {
        let result = self.update_inner(record).await;
        self.settle_after_write().await;
        result.map_err(Error::from)
    }

    async fn update_inner(&self, record: Record) -> Result<Record, InternalError> {
        reject_relation_fields(&self.core, &record)?;

        let db = self.db.clone();
        let core = self.core.clone();
        coordinator::queue_task(&self.db, self.ambient.clone(), move |ctx| async move {
            let name = core.descriptor.name.clone();
            let key = Key::try_from_value(key_value_of(&core.descriptor, &record)?)?;
            let store = ctx.object_store(&name)?;
            if adapter::request(store.get(&key)).await?.is_none() {
                return Err(InternalError::not_found(
                    ErrorOrigin::Facade,
                    format!("'{name}' row {:?} does not exist", key.as_value()),
                ));
            }

            let mut record = record;
            if let Some(transform) = &core.descriptor.transformers.update {
                record = transform(record);
            }
            fk::validate_upstream(&db, &ctx, &name, &record).await?;
            adapter::request(store.put(write_wire(&core, record.clone()))).await?;

            queue_event(&db, &ctx, &name, EventKind::Write, Some(record.clone()));
            Ok(record)
        })
        .await
    }

    pub async fn upsert(&self, record: Record) -> Result<Record, Error> {
        let mut records = self.upsert_many(vec![record]).await?;
        records.pop().ok_or_else(|| {
            Error::new(
                crate::error::ErrorKind::Internal,
                crate::error::ErrorOrigin::Facade,
                "upsert returned an empty batch",
            )
        })
    }

    /// Upsert a batch; every item commits atomically within one task.
    pub async fn upsert_many(&self, records: Vec<Record>) -> Result<Vec<Record>, Error> {
        let result = self.upsert_many_inner(records).await;
        self.settle_after_write().await;
        result.map_err(Error::from)
    }

    async fn upsert_many_inner(&self, records: Vec<Record>) -> Result<Vec<Record>, InternalError> {
        for record in &records {
            reject_relation_fields(&self.core, record)?;
        }

        let db = self.db.clone();
        let core = self.core.clone();
        coordinator::queue_task(&self.db, self.ambient.clone(), move |ctx| async move {
            let name = core.descriptor.name.clone();
            let store = ctx.object_store(&name)?;
            let mut out = Vec::with_capacity(records.len());

            for dto in records {
                let mut record = dto;
                let exists = match key_value_of(&core.descriptor, &record) {
                    Ok(value) => {
                        let key = Key::try_from_value(value)?;
                        adapter::request(store.get(&key)).await?.is_some()
                    }
                    Err(_) => false,
                };

                if exists {
                    if let Some(transform) = &core.descriptor.transformers.update {
                        record = transform(record);
                    }
                } else {
                    apply_defaults(&core.descriptor.fields, &db.schema.shapes, &mut record);
                    if let Some(transform) = &core.descriptor.transformers.create {
                        record = transform(record);
                    }
                }

                fk::validate_upstream(&db, &ctx, &name, &record).await?;
                let key = adapter::request(store.put(write_wire(&core, record.clone()))).await?;
                if core.descriptor.id_mode == IdMode::AutoIncrement {
                    record.set(core.descriptor.key_path[0].clone(), key.as_value().clone());
                }

                queue_event(&db, &ctx, &name, EventKind::Write, Some(record.clone()));
                out.push(record);
            }

            Ok(out)
        })
        .await
    }

    /// Delete by key. Absent rows resolve to `None` rather than raising.
    pub async fn delete(&self, key: impl Into<Value>) -> Result<Option<Record>, Error> {
        let result = self.delete_inner(key.into()).await;
        self.settle_after_write().await;
        result.map_err(Error::from)
    }

    async fn delete_inner(&self, key_value: Value) -> Result<Option<Record>, InternalError> {
        let db = self.db.clone();
        let core = self.core.clone();
        coordinator::queue_task(&self.db, self.ambient.clone(), move |ctx| async move {
            let name = core.descriptor.name.clone();
            let Ok(key) = Key::try_from_value(key_value.clone()) else {
                return Ok(None);
            };
            let store = ctx.object_store(&name)?;
            let Some(wire) = adapter::request(store.get(&key)).await? else {
                return Ok(None);
            };
            let record = read_record(&core, wire)?;

            fk::handle_delete(db.clone(), ctx.clone(), name.clone(), key_value).await?;
            adapter::request(store.delete(&key)).await?;

            queue_event(&db, &ctx, &name, EventKind::Delete, Some(record.clone()));
            Ok(Some(record))
        })
        .await
    }

    /// Delete the first row matching the predicate.
    pub async fn delete_by(
        &self,
        predicate: impl Fn(&Record) -> bool + 'static,
    ) -> Result<Option<Record>, Error> {
        let mut removed = self.delete_many(predicate, Some(1)).await?;
        Ok(removed.pop())
    }

    pub async fn delete_many(
        &self,
        predicate: impl Fn(&Record) -> bool + 'static,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, Error> {
        let result = self.delete_many_inner(Rc::new(predicate), limit).await;
        self.settle_after_write().await;
        result.map_err(Error::from)
    }

    async fn delete_many_inner(
        &self,
        predicate: Rc<dyn Fn(&Record) -> bool>,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, InternalError> {
        let db = self.db.clone();
        let core = self.core.clone();
        coordinator::queue_task(&self.db, self.ambient.clone(), move |ctx| async move {
            let name = core.descriptor.name.clone();
            let store = ctx.object_store(&name)?;
            let cursor = store.open_cursor(None, Direction::Next);

            let deser_core = core.clone();
            let hook_core = core.clone();
            let (hook_db, hook_ctx, hook_name) = (db.clone(), ctx.clone(), name.clone());
            let (event_db, event_ctx, event_name) = (db.clone(), ctx.clone(), name.clone());

            cursor_engine::delete_by_predicate(
                cursor,
                move |wire| read_record(&deser_core, wire),
                move |record| predicate(record),
                limit,
                move |record| {
                    let key_value = key_value_of(&hook_core.descriptor, record);
                    let (db, ctx, name) = (hook_db.clone(), hook_ctx.clone(), hook_name.clone());
                    Box::pin(async move { fk::handle_delete(db, ctx, name, key_value?).await })
                },
                move |record| {
                    queue_event(
                        &event_db,
                        &event_ctx,
                        &event_name,
                        EventKind::Delete,
                        Some(record.clone()),
                    );
                },
            )
            .await
        })
        .await
    }

    /// Truncate the store. Emits one `clear` event (payload `None`) after
    /// commit. Not foreign-key aware; callers are responsible for
    /// ordering their clears.
    pub async fn clear(&self) -> Result<(), Error> {
        let db = self.db.clone();
        let core = self.core.clone();
        let result = coordinator::queue_task(&self.db, self.ambient.clone(), move |ctx| {
            async move {
                let name = core.descriptor.name.clone();
                let store = ctx.object_store(&name)?;
                adapter::request(store.clear()).await?;
                queue_event(&db, &ctx, &name, EventKind::Clear, None);
                Ok(())
            }
        })
        .await;
        self.settle_after_write().await;
        result.map_err(Error::from)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn find(
        &self,
        key: impl Into<Value>,
        with: Option<WithSpec>,
    ) -> Result<Option<Record>, Error> {
        let key_value = key.into();
        let db = self.db.clone();
        let core = self.core.clone();
        coordinator::queue_read_task(&self.db, self.ambient.clone(), move |ctx| async move {
            let name = core.descriptor.name.clone();
            ctx.observe(&name);
            let Ok(key) = Key::try_from_value(key_value) else {
                return Ok(None);
            };
            let store = ctx.object_store(&name)?;
            let Some(wire) = adapter::request(store.get(&key)).await? else {
                return Ok(None);
            };
            let mut record = read_record(&core, wire)?;
            if let Some(with) = &with {
                relation::resolve(&db, &ctx, &core, std::slice::from_mut(&mut record), with)
                    .await?;
            }
            Ok(Some(record))
        })
        .await
        .map_err(Error::from)
    }

    pub async fn find_active(
        &self,
        key: impl Into<Value>,
        with: Option<WithSpec>,
    ) -> Result<Option<ActiveRecord>, Error> {
        let record = self.find(key, with).await?;
        Ok(record.map(|record| ActiveRecord::new(self.clone(), record)))
    }

    /// First record matching the predicate, in primary-key order.
    pub async fn find_by(
        &self,
        predicate: impl Fn(&Record) -> bool + 'static,
        with: Option<WithSpec>,
    ) -> Result<Option<Record>, Error> {
        let mut records = self
            .find_many(
                predicate,
                QueryOptions {
                    limit: Some(1),
                    with,
                },
            )
            .await?;
        Ok(records.pop())
    }

    pub async fn find_many(
        &self,
        predicate: impl Fn(&Record) -> bool + 'static,
        options: QueryOptions,
    ) -> Result<Vec<Record>, Error> {
        let predicate: Rc<dyn Fn(&Record) -> bool> = Rc::new(predicate);
        let db = self.db.clone();
        let core = self.core.clone();
        coordinator::queue_read_task(&self.db, self.ambient.clone(), move |ctx| async move {
            let name = core.descriptor.name.clone();
            ctx.observe(&name);
            let store = ctx.object_store(&name)?;
            let cursor = store.open_cursor(None, Direction::Next);
            let deser_core = core.clone();
            let mut records = cursor_engine::find_by_predicate(
                cursor,
                move |wire| read_record(&deser_core, wire),
                move |record| predicate(record),
                options.limit,
            )
            .await?;
            sink::record(&MetricsEvent::RowsScanned {
                collection: name,
                rows: records.len() as u64,
            });
            if let Some(with) = &options.with {
                relation::resolve(&db, &ctx, &core, &mut records, with).await?;
            }
            Ok(records)
        })
        .await
        .map_err(Error::from)
    }

    pub async fn find_many_active(
        &self,
        predicate: impl Fn(&Record) -> bool + 'static,
        options: QueryOptions,
    ) -> Result<Vec<ActiveRecord>, Error> {
        let records = self.find_many(predicate, options).await?;
        Ok(records
            .into_iter()
            .map(|record| ActiveRecord::new(self.clone(), record))
            .collect())
    }

    pub async fn all(&self, with: Option<WithSpec>) -> Result<Vec<Record>, Error> {
        let db = self.db.clone();
        let core = self.core.clone();
        coordinator::queue_read_task(&self.db, self.ambient.clone(), move |ctx| async move {
            let name = core.descriptor.name.clone();
            ctx.observe(&name);
            let store = ctx.object_store(&name)?;
            let wires = adapter::request(store.get_all(None, None)).await?;
            let mut records = Vec::with_capacity(wires.len());
            for wire in wires {
                records.push(read_record(&core, wire)?);
            }
            if let Some(with) = &with {
                relation::resolve(&db, &ctx, &core, &mut records, with).await?;
            }
            Ok(records)
        })
        .await
        .map_err(Error::from)
    }

    pub async fn all_active(&self, with: Option<WithSpec>) -> Result<Vec<ActiveRecord>, Error> {
        let records = self.all(with).await?;
        Ok(records
            .into_iter()
            .map(|record| ActiveRecord::new(self.clone(), record))
            .collect())
    }

    pub async fn count(&self) -> Result<u64, Error> {
        let core = self.core.clone();
        coordinator::queue_read_task(&self.db, self.ambient.clone(), move |ctx| async move {
            let name = core.descriptor.name.clone();
            ctx.observe(&name);
            let store = ctx.object_store(&name)?;
            adapter::request(store.count(None)).await
        })
        .await
        .map_err(Error::from)
    }

    /// Newest record under primary-key order.
    pub async fn latest(&self, with: Option<WithSpec>) -> Result<Option<Record>, Error> {
        self.first_in_direction(None, Direction::Prev, with).await
    }

    pub async fn latest_active(
        &self,
        with: Option<WithSpec>,
    ) -> Result<Option<ActiveRecord>, Error> {
        let record = self.latest(with).await?;
        Ok(record.map(|record| ActiveRecord::new(self.clone(), record)))
    }

    /// Smallest record under the named index.
    pub async fn min(&self, index: &str, with: Option<WithSpec>) -> Result<Option<Record>, Error> {
        self.first_in_direction(Some(index.to_string()), Direction::Next, with)
            .await
    }

    /// Largest record under the named index.
    pub async fn max(&self, index: &str, with: Option<WithSpec>) -> Result<Option<Record>, Error> {
        self.first_in_direction(Some(index.to_string()), Direction::Prev, with)
            .await
    }

    async fn first_in_direction(
        &self,
        index: Option<String>,
        direction: Direction,
        with: Option<WithSpec>,
    ) -> Result<Option<Record>, Error> {
        if let Some(index) = &index {
            require_index(&self.core, index).map_err(Error::from)?;
        }

        let db = self.db.clone();
        let core = self.core.clone();
        coordinator::queue_read_task(&self.db, self.ambient.clone(), move |ctx| async move {
            let name = core.descriptor.name.clone();
            ctx.observe(&name);
            let store = ctx.object_store(&name)?;
            let cursor = match &index {
                Some(index) => store.index(index)?.open_cursor(None, direction),
                None => store.open_cursor(None, direction),
            };
            let deser_core = core.clone();
            let record =
                cursor_engine::first_by_direction(cursor, move |wire| {
                    read_record(&deser_core, wire)
                })
                .await?;
            match record {
                Some(mut record) => {
                    if let Some(with) = &with {
                        relation::resolve(
                            &db,
                            &ctx,
                            &core,
                            std::slice::from_mut(&mut record),
                            with,
                        )
                        .await?;
                    }
                    Ok(Some(record))
                }
                None => Ok(None),
            }
        })
        .await
        .map_err(Error::from)
    }

    /// Index walk over a key range.
    pub async fn get_index_range(
        &self,
        index: &str,
        options: IndexRangeOptions,
    ) -> Result<Vec<Record>, Error> {
        require_index(&self.core, index).map_err(Error::from)?;

        let index = index.to_string();
        let db = self.db.clone();
        let core = self.core.clone();
        coordinator::queue_read_task(&self.db, self.ambient.clone(), move |ctx| async move {
            let name = core.descriptor.name.clone();
            ctx.observe(&name);
            let store = ctx.object_store(&name)?;
            let cursor = store
                .index(&index)?
                .open_cursor(options.key_range.as_ref(), options.direction);

            let max = options.limit.unwrap_or(usize::MAX);
            let mut records = Vec::new();
            let mut walk = CursorWalk::new(cursor);
            while records.len() < max {
                let Some(row) = walk.next().await? else {
                    break;
                };
                records.push(read_record(&core, row.row.value)?);
            }
            sink::record(&MetricsEvent::RowsScanned {
                collection: name,
                rows: records.len() as u64,
            });

            if let Some(with) = &options.with {
                relation::resolve(&db, &ctx, &core, &mut records, with).await?;
            }
            Ok(records)
        })
        .await
        .map_err(Error::from)
    }

    /// Lazy async sequence over the collection.
    ///
    /// Without `with`, records yield one at a time. With `with`, records
    /// buffer in batches of 100 whose relations resolve on the same
    /// transaction before the batch flushes.
    pub fn iterate(&self, options: IterateOptions) -> impl Stream<Item = Result<Record, Error>> {
        let collection = self.clone();
        stream::unfold(
            IterState::Init(Box::new((collection, options))),
            |mut state| async move {
                loop {
                    match state {
                        IterState::Done => return None,
                        IterState::Init(init) => {
                            let (collection, options) = *init;
                            match IterRun::begin(&collection, options).await {
                                Ok(run) => state = IterState::Running(run),
                                Err(err) => {
                                    return Some((Err(Error::from(err)), IterState::Done));
                                }
                            }
                        }
                        IterState::Running(mut run) => {
                            if let Some(record) = run.buffer.pop_front() {
                                return Some((Ok(record), IterState::Running(run)));
                            }
                            if run.exhausted {
                                run.finish().await;
                                return None;
                            }
                            match run.fill().await {
                                Ok(()) => state = IterState::Running(run),
                                Err(err) => {
                                    return Some((Err(Error::from(err)), IterState::Done));
                                }
                            }
                        }
                    }
                }
            },
        )
    }

    // ------------------------------------------------------------------
    // Active records & events
    // ------------------------------------------------------------------

    /// Shallowly attach `save`/`delete` behavior. Does not persist.
    pub fn wrap(&self, record: Record) -> Result<ActiveRecord, Error> {
        reject_relation_fields(&self.core, &record).map_err(Error::from)?;
        Ok(ActiveRecord::new(self.clone(), record))
    }

    /// Strip the active behavior back off a wrapped record.
    #[must_use]
    pub fn unwrap(&self, active: ActiveRecord) -> Record {
        active.into_record()
    }

    pub fn add_event_listener(
        &self,
        kind: EventKind,
        listener: impl Fn(Option<&Record>) + 'static,
    ) -> ListenerId {
        let listener: Listener = Rc::new(listener);
        self.core.events.add_listener(kind, listener)
    }

    pub fn remove_event_listener(&self, kind: EventKind, id: ListenerId) {
        self.core.events.remove_listener(kind, id);
    }

    pub(crate) fn with_ambient(&self, ctx: Rc<TaskContext>) -> Self {
        Self {
            db: self.db.clone(),
            core: self.core.clone(),
            ambient: Some(ctx),
        }
    }
}

enum IterState {
    Init(Box<(Collection, IterateOptions)>),
    Running(IterRun),
    Done,
}

struct IterRun {
    db: Rc<DbShared>,
    core: Rc<CollectionCore>,
    ctx: Rc<TaskContext>,
    owned: bool,
    walk: CursorWalk,
    with: Option<WithSpec>,
    buffer: VecDeque<Record>,
    exhausted: bool,
}

impl IterRun {
    async fn begin(
        collection: &Collection,
        options: IterateOptions,
    ) -> Result<Self, InternalError> {
        if let Some(index) = &options.index {
            require_index(&collection.core, index)?;
        }

        let (ctx, owned) = match &collection.ambient {
            Some(ctx) => (ctx.clone(), false),
            None => {
                let conn = ensure_open(&collection.db).await?;
                let scope = conn.store_names();
                let tx = conn.transaction(&scope, TxMode::ReadOnly, Durability::Default)?;
                (TaskContext::new(tx), true)
            }
        };

        let name = collection.core.descriptor.name.clone();
        ctx.observe(&name);
        let store = ctx.object_store(&name)?;
        let cursor = match &options.index {
            Some(index) => store
                .index(index)?
                .open_cursor(options.key_range.as_ref(), options.direction),
            None => store.open_cursor(options.key_range.as_ref(), options.direction),
        };

        Ok(Self {
            db: collection.db.clone(),
            core: collection.core.clone(),
            ctx,
            owned,
            walk: CursorWalk::new(cursor),
            with: options.with,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }

    async fn fill(&mut self) -> Result<(), InternalError> {
        let batch_size = if self.with.is_some() { RELATION_BATCH } else { 1 };
        let mut batch = Vec::new();
        while batch.len() < batch_size {
            match self.walk.next().await? {
                Some(row) => batch.push(read_record(&self.core, row.row.value)?),
                None => {
                    self.exhausted = true;
                    break;
                }
            }
        }

        if let Some(with) = &self.with
            && !batch.is_empty()
        {
            relation::resolve(&self.db, &self.ctx, &self.core, &mut batch, with).await?;
        }
        self.buffer = batch.into();

        Ok(())
    }

    async fn finish(&self) {
        if self.owned && !self.ctx.transaction().is_finished() {
            let _ = adapter::request(self.ctx.transaction().commit()).await;
        }
    }
}

impl Drop for IterRun {
    fn drop(&mut self) {
        // A stream dropped mid-walk must not strand its own read
        // transaction's locks.
        if self.owned && !self.ctx.transaction().is_finished() {
            self.ctx.transaction().abort();
        }
    }
}
