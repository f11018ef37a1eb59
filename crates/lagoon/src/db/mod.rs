//! Module: db
//! Responsibility: the database core — schema validation, store opening
//! and upgrades, collection facade ownership, user transactions, and the
//! glue between events, selectors and the tab coordinator.

pub mod active;
pub(crate) mod coordinator;
pub mod events;
pub mod facade;
pub(crate) mod fk;
pub mod relation;
pub mod selector;
pub mod tabs;

#[cfg(test)]
mod tests;

use crate::{
    db::{
        events::EventTarget,
        facade::Collection,
        fk::ForeignKeyEngine,
        selector::{Selector, SelectorCtx, SelectorDriver},
        tabs::{TabBus, TabMembership, TabMessage},
    },
    error::Error,
    schema::{CollectionDescriptor, IdMode, RelationKind, Schema, validate_schema},
};
use futures::{StreamExt, channel::oneshot, future::LocalBoxFuture};
use lagoon_core::{
    adapter,
    capability::{
        Connection, Durability, IndexSpec, OpenEvent, StoreBackend, StoreSpec, TxMode,
        UpgradeHandle,
    },
    error::{ErrorOrigin, InternalError},
    obs::sink::{self, MetricsEvent},
    task::TaskContext,
};
use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, BTreeSet, VecDeque},
    rc::Rc,
};

pub type ErrorHook = Rc<dyn Fn(&Error)>;
pub type OpenHook = Rc<dyn Fn()>;
pub type UpgradeHook = Rc<dyn Fn(UpgradeContext) -> LocalBoxFuture<'static, Result<(), Error>>>;
pub type ReinitHook = Rc<dyn Fn(u32, u32)>;

///
/// DatabaseConfig
///

#[derive(Clone, Default)]
pub struct DatabaseConfig {
    pub schema: Schema,
    pub version: u32,
    pub relay_events: bool,
    pub on_error: Option<ErrorHook>,
    pub on_open: Option<OpenHook>,
    pub on_upgrade: Option<UpgradeHook>,
    pub on_before_reinit: Option<ReinitHook>,
}

impl DatabaseConfig {
    #[must_use]
    pub fn new(schema: Schema, version: u32) -> Self {
        Self {
            schema,
            version,
            relay_events: true,
            on_error: None,
            on_open: None,
            on_upgrade: None,
            on_before_reinit: None,
        }
    }

    #[must_use]
    pub const fn relay_events(mut self, relay: bool) -> Self {
        self.relay_events = relay;
        self
    }

    #[must_use]
    pub fn on_error(mut self, hook: impl Fn(&Error) + 'static) -> Self {
        self.on_error = Some(Rc::new(hook));
        self
    }

    #[must_use]
    pub fn on_open(mut self, hook: impl Fn() + 'static) -> Self {
        self.on_open = Some(Rc::new(hook));
        self
    }

    #[must_use]
    pub fn on_upgrade<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(UpgradeContext) -> Fut + 'static,
        Fut: Future<Output = Result<(), Error>> + 'static,
    {
        self.on_upgrade = Some(Rc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    #[must_use]
    pub fn on_before_reinit(mut self, hook: impl Fn(u32, u32) + 'static) -> Self {
        self.on_before_reinit = Some(Rc::new(hook));
        self
    }
}

pub(crate) struct DbHooks {
    pub on_error: Option<ErrorHook>,
    pub on_open: Option<OpenHook>,
    pub on_upgrade: Option<UpgradeHook>,
    pub on_before_reinit: Option<ReinitHook>,
}

///
/// RelationEdge
/// One resolved outgoing relation of a collection.
///

pub(crate) struct RelationEdge {
    pub target: String,
    pub kind: RelationKind,
    pub source_field: String,
    pub target_field: String,
}

///
/// CollectionCore
/// The per-collection state shared by every facade clone: descriptor,
/// resolved relation map, event target, and the relaying flag. Relation
/// maps are built during initialization and read-only thereafter.
///

pub(crate) struct CollectionCore {
    pub descriptor: CollectionDescriptor,
    pub relations: BTreeMap<String, RelationEdge>,
    pub events: EventTarget,
    pub relaying: Cell<bool>,
}

pub(crate) enum OpenPhase {
    Closed,
    Opening,
    Open(Rc<dyn Connection>),
}

///
/// DbShared
///

pub(crate) struct DbShared {
    pub name: String,
    pub backend: Rc<dyn StoreBackend>,
    pub schema: Schema,
    pub version: Cell<u32>,
    pub latest_known: Cell<u32>,
    pub relay_events: bool,
    pub hooks: DbHooks,
    pub fk: ForeignKeyEngine,
    pub collections: RefCell<BTreeMap<String, Rc<CollectionCore>>>,
    pub open_phase: RefCell<OpenPhase>,
    pub open_waiters: RefCell<Vec<oneshot::Sender<()>>>,
    pub dirty_selectors: RefCell<VecDeque<Rc<dyn SelectorDriver>>>,
    pub tab: RefCell<Option<TabMembership>>,
}

impl DbShared {
    pub fn collection_core(&self, name: &str) -> Option<Rc<CollectionCore>> {
        self.collections.borrow().get(name).cloned()
    }

    pub fn require_collection_core(&self, name: &str) -> Result<Rc<CollectionCore>, InternalError> {
        self.collection_core(name).ok_or_else(|| {
            InternalError::internal(
                ErrorOrigin::Database,
                format!("unknown collection '{name}'"),
            )
        })
    }

    pub fn report_error(&self, err: &Error) {
        if let Some(hook) = &self.hooks.on_error {
            hook(err);
        }
    }

    pub fn report_listener_fault(&self, collection: &str, message: String) {
        sink::record(&MetricsEvent::ListenerFault {
            collection: collection.to_string(),
        });
        self.report_error(&Error::new(
            crate::error::ErrorKind::Internal,
            crate::error::ErrorOrigin::Facade,
            message,
        ));
    }
}

/// Drive every selector refresh queued by committed events.
pub(crate) async fn drain_selectors(db: &Rc<DbShared>) {
    loop {
        let next = db.dirty_selectors.borrow_mut().pop_front();
        match next {
            Some(driver) => driver.drive().await,
            None => break,
        }
    }
}

/// Resolve the open connection, opening lazily on first use. Callers
/// arriving mid-open wait their turn in submission order.
pub(crate) async fn ensure_open(db: &Rc<DbShared>) -> Result<Rc<dyn Connection>, InternalError> {
    loop {
        let waiter = {
            let mut phase = db.open_phase.borrow_mut();
            match &*phase {
                OpenPhase::Open(conn) => return Ok(conn.clone()),
                OpenPhase::Opening => {
                    let (tx, rx) = oneshot::channel();
                    db.open_waiters.borrow_mut().push(tx);
                    Some(rx)
                }
                OpenPhase::Closed => {
                    *phase = OpenPhase::Opening;
                    None
                }
            }
        };

        match waiter {
            Some(rx) => {
                let _ = rx.await;
            }
            None => {
                let result = open_connection(db).await;
                {
                    let mut phase = db.open_phase.borrow_mut();
                    *phase = match &result {
                        Ok(conn) => OpenPhase::Open(conn.clone()),
                        Err(_) => OpenPhase::Closed,
                    };
                }
                let waiters = std::mem::take(&mut *db.open_waiters.borrow_mut());
                for tx in waiters {
                    let _ = tx.send(());
                }

                return match result {
                    Ok(conn) => {
                        if let Some(hook) = &db.hooks.on_open {
                            hook();
                        }
                        Ok(conn)
                    }
                    Err(err) => {
                        db.report_error(&err.clone().into());
                        Err(err)
                    }
                };
            }
        }
    }
}

/// Run the open handshake: blocked tabs are asked to close over the
/// broadcast channel, upgrades run the schema DDL plus the user hook on
/// the version-change transaction, and a successful upgrade announces
/// `reinit` to sibling tabs.
async fn open_connection(db: &Rc<DbShared>) -> Result<Rc<dyn Connection>, InternalError> {
    let version = db.version.get();
    let open = db.backend.open(&db.name, version);
    let mut events = adapter::open_events(&open);
    let mut upgraded = false;

    while let Some(event) = events.next().await {
        match event {
            OpenEvent::Blocked { .. } => {
                if let Some(tab) = &*db.tab.borrow() {
                    tab.post(&TabMessage::CloseForUpgrade {
                        new_version: version,
                    });
                }
            }
            OpenEvent::UpgradeNeeded {
                old_version,
                new_version,
            } => {
                let upgrade = open.upgrade()?;
                run_upgrade(db, &upgrade, old_version, new_version).await?;
                upgraded = true;
            }
            OpenEvent::Success => {
                let conn = open.connection()?;
                if db.latest_known.get() < version {
                    db.latest_known.set(version);
                }
                if upgraded && let Some(tab) = &*db.tab.borrow() {
                    tab.post(&TabMessage::Reinit);
                }
                return Ok(conn);
            }
            OpenEvent::Failed(err) => return Err(err),
        }
    }

    Err(InternalError::store(
        ErrorOrigin::Database,
        "open handshake ended without a success event",
    ))
}

async fn run_upgrade(
    db: &Rc<DbShared>,
    upgrade: &Rc<dyn UpgradeHandle>,
    old_version: u32,
    new_version: u32,
) -> Result<(), InternalError> {
    let existing: BTreeSet<String> = upgrade.store_names().into_iter().collect();
    for descriptor in &db.schema.collections {
        if !existing.contains(&descriptor.name) {
            create_store_from_descriptor(upgrade, descriptor)?;
        }
    }

    let ctx = TaskContext::new(upgrade.transaction());
    let (db, upgrade) = (db.clone(), upgrade.clone());
    ctx.run(move |ctx| async move {
        if let Some(hook) = db.hooks.on_upgrade.clone() {
            let context = UpgradeContext {
                db: db.clone(),
                upgrade,
                ctx,
                old_version,
                new_version,
            };
            hook(context).await.map_err(InternalError::from)?;
        }
        Ok(())
    })
    .await
}

fn create_store_from_descriptor(
    upgrade: &Rc<dyn UpgradeHandle>,
    descriptor: &CollectionDescriptor,
) -> Result<(), InternalError> {
    upgrade.create_object_store(
        &descriptor.name,
        StoreSpec {
            key_path: descriptor.key_path.clone(),
            auto_increment: descriptor.id_mode == IdMode::AutoIncrement,
        },
    )?;
    for index in &descriptor.indexes {
        upgrade.create_index(
            &descriptor.name,
            &index.name,
            IndexSpec {
                key_path: index.key.clone(),
                unique: index.unique,
                multi_entry: index.multi_entry,
            },
        )?;
    }

    Ok(())
}

///
/// UpgradeContext
/// Handed to the user upgrade hook, scoped to the version-change
/// transaction. The hook must await all of its work before returning.
///

pub struct UpgradeContext {
    pub(crate) db: Rc<DbShared>,
    pub(crate) upgrade: Rc<dyn UpgradeHandle>,
    pub(crate) ctx: Rc<TaskContext>,
    pub old_version: u32,
    pub new_version: u32,
}

impl UpgradeContext {
    /// Create the store (and its declared indexes) for a schema
    /// collection that does not exist yet.
    pub fn create_store(&self, name: &str) -> Result<(), Error> {
        let descriptor = self
            .db
            .schema
            .collection_named(name)
            .ok_or_else(|| {
                Error::from(InternalError::internal(
                    ErrorOrigin::Database,
                    format!("unknown collection '{name}'"),
                ))
            })?
            .clone();
        create_store_from_descriptor(&self.upgrade, &descriptor).map_err(Error::from)
    }

    pub fn delete_store(&self, name: &str) -> Result<(), Error> {
        self.upgrade.delete_object_store(name).map_err(Error::from)
    }

    /// A facade bound to the upgrade transaction.
    pub fn collection(&self, name: &str) -> Result<Collection, Error> {
        let core = self.db.require_collection_core(name).map_err(Error::from)?;
        Ok(Collection {
            db: self.db.clone(),
            core,
            ambient: Some(self.ctx.clone()),
        })
    }
}

///
/// TransactionScope
/// The cloned-facade surface inside a user transaction. Every facade
/// obtained here inherits the ambient task context (I5).
///

#[derive(Clone)]
pub struct TransactionScope {
    pub(crate) db: Rc<DbShared>,
    pub(crate) ctx: Rc<TaskContext>,
}

impl TransactionScope {
    pub fn collection(&self, name: &str) -> Result<Collection, Error> {
        let core = self.db.require_collection_core(name).map_err(Error::from)?;
        Ok(Collection {
            db: self.db.clone(),
            core,
            ambient: Some(self.ctx.clone()),
        })
    }

    /// Roll the whole transaction back explicitly.
    pub fn abort(&self) {
        self.ctx.abort();
    }
}

///
/// Database
/// The user-facing handle: collection facades, user transactions,
/// selectors, and the cross-tab membership.
///

pub struct Database {
    shared: Rc<DbShared>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Validate the schema and wire a database onto a backend and a tab
    /// bus. The store itself opens lazily on first use; facade
    /// operations submitted before that queue in submission order.
    pub fn open(
        name: &str,
        config: DatabaseConfig,
        backend: Rc<dyn StoreBackend>,
        bus: &TabBus,
    ) -> Result<Self, Error> {
        if let Err(err) = validate_schema(&config.schema) {
            let err = Error::from(err);
            if let Some(hook) = &config.on_error {
                hook(&err);
            }
            return Err(err);
        }

        let fk = ForeignKeyEngine::from_schema(&config.schema);
        let shared = Rc::new(DbShared {
            name: name.to_string(),
            backend,
            version: Cell::new(config.version),
            latest_known: Cell::new(config.version),
            relay_events: config.relay_events,
            hooks: DbHooks {
                on_error: config.on_error,
                on_open: config.on_open,
                on_upgrade: config.on_upgrade,
                on_before_reinit: config.on_before_reinit,
            },
            fk,
            collections: RefCell::new(BTreeMap::new()),
            open_phase: RefCell::new(OpenPhase::Closed),
            open_waiters: RefCell::new(Vec::new()),
            dirty_selectors: RefCell::new(VecDeque::new()),
            tab: RefCell::new(None),
            schema: config.schema,
        });

        {
            let mut collections = shared.collections.borrow_mut();
            for descriptor in &shared.schema.collections {
                let relations = shared
                    .schema
                    .relations
                    .iter()
                    .filter(|relation| relation.from == descriptor.name)
                    .map(|relation| {
                        (
                            relation.name.clone(),
                            RelationEdge {
                                target: relation.to.clone(),
                                kind: relation.kind,
                                source_field: relation.source_field.clone(),
                                target_field: relation.target_field.clone(),
                            },
                        )
                    })
                    .collect();
                collections.insert(
                    descriptor.name.clone(),
                    Rc::new(CollectionCore {
                        descriptor: descriptor.clone(),
                        relations,
                        events: EventTarget::default(),
                        relaying: Cell::new(false),
                    }),
                );
            }
        }

        let weak = Rc::downgrade(&shared);
        let membership = bus.join(
            name,
            Rc::new(move |message| {
                if let Some(db) = weak.upgrade() {
                    tabs::handle_message(&db, message);
                }
            }),
        );
        *shared.tab.borrow_mut() = Some(membership);

        Ok(Self { shared })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.shared.version.get()
    }

    pub fn collection(&self, name: &str) -> Result<Collection, Error> {
        let core = self
            .shared
            .require_collection_core(name)
            .map_err(Error::from)?;
        Ok(Collection {
            db: self.shared.clone(),
            core,
            ambient: None,
        })
    }

    /// Execute `f` with facades bound to one shared read-write
    /// transaction spanning all stores. Either every facade call commits,
    /// or none do; a throw aborts and rethrows.
    pub async fn transaction<T, F, Fut>(&self, f: F) -> Result<T, Error>
    where
        T: 'static,
        F: FnOnce(TransactionScope) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        self.transaction_with(TxMode::ReadWrite, Durability::Default, f)
            .await
    }

    pub async fn transaction_with<T, F, Fut>(
        &self,
        mode: TxMode,
        durability: Durability,
        f: F,
    ) -> Result<T, Error>
    where
        T: 'static,
        F: FnOnce(TransactionScope) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let conn = ensure_open(&self.shared).await.map_err(Error::from)?;
        let store_names = conn.store_names();
        let tx = conn
            .transaction(&store_names, mode, durability)
            .map_err(Error::from)?;
        let ctx = TaskContext::new(tx);
        let scope = TransactionScope {
            db: self.shared.clone(),
            ctx: ctx.clone(),
        };

        let result = ctx
            .run(move |_ctx| async move { f(scope).await.map_err(InternalError::from) })
            .await;
        drain_selectors(&self.shared).await;

        result.map_err(Error::from)
    }

    /// Register a memoized reactive view.
    pub fn selector<T, F, Fut>(&self, name: &str, query: F) -> Selector<T>
    where
        T: 'static,
        F: Fn(SelectorCtx) -> Fut + 'static,
        Fut: Future<Output = Result<T, Error>> + 'static,
    {
        Selector::new(
            self.shared.clone(),
            name,
            Box::new(move |ctx| Box::pin(query(ctx))),
        )
    }

    /// Drive any selector refreshes still queued (for example after a
    /// relayed cross-tab event).
    pub async fn settle(&self) {
        drain_selectors(&self.shared).await;
    }

    /// Close the connection; the next operation reopens it.
    pub fn close(&self) {
        let mut phase = self.shared.open_phase.borrow_mut();
        if let OpenPhase::Open(conn) = &*phase {
            conn.close();
            *phase = OpenPhase::Closed;
        }
    }
}
