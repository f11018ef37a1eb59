//! Module: db::selector
//! Responsibility: memoized async views with dependency-precise
//! reactivity. A selector tracks exactly the collections its last
//! evaluation touched, invalidates only on their events, and coalesces
//! rapid invalidations into at most one evaluation per batch.
//! Does not own: event emission or transaction scheduling.

use crate::{
    db::{
        DbShared, ensure_open,
        events::{EventKind, Listener, ListenerId},
        facade::Collection,
    },
    error::Error,
};
use futures::{channel::oneshot, future::LocalBoxFuture};
use lagoon_core::{
    capability::{Durability, TxMode},
    error::{ErrorOrigin, InternalError},
    obs::sink::{self, MetricsEvent},
    task::TaskContext,
};
use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    rc::Rc,
};

///
/// SelectorCtx
/// The read-only evaluation context handed to a selector query. Every
/// facade obtained here shares the evaluation's transaction and records
/// itself in the observed set.
///

pub struct SelectorCtx {
    pub(crate) db: Rc<DbShared>,
    pub(crate) ctx: Rc<TaskContext>,
}

impl SelectorCtx {
    pub fn collection(&self, name: &str) -> Result<Collection, Error> {
        let core = self.db.require_collection_core(name).map_err(Error::from)?;
        Ok(Collection {
            db: self.db.clone(),
            core,
            ambient: Some(self.ctx.clone()),
        })
    }
}

type SelectorFn<T> = Box<dyn Fn(SelectorCtx) -> LocalBoxFuture<'static, Result<T, Error>>>;

///
/// SelectorDriver
/// Type-erased handle the database uses to drive queued refreshes.
///

pub(crate) trait SelectorDriver {
    fn drive(self: Rc<Self>) -> LocalBoxFuture<'static, ()>;
}

struct SelectorState<T> {
    cached: Option<Rc<T>>,
    stale: bool,
    running: bool,
    scheduled: bool,
    next_subscriber: u64,
    subscribers: Vec<(u64, Rc<dyn Fn(&T)>)>,
    pending: Vec<oneshot::Sender<Result<Rc<T>, Error>>>,
    observed: BTreeSet<String>,
    listeners: BTreeMap<String, Vec<(EventKind, ListenerId)>>,
}

pub(crate) struct SelectorInner<T> {
    db: Rc<DbShared>,
    name: String,
    query: SelectorFn<T>,
    state: RefCell<SelectorState<T>>,
}

///
/// Selector
/// A memoized reactive view. `get` resolves the cached value or the next
/// completed evaluation; `subscribe` fans out every refresh.
///

pub struct Selector<T> {
    inner: Rc<SelectorInner<T>>,
}

impl<T: 'static> Selector<T> {
    pub(crate) fn new(db: Rc<DbShared>, name: &str, query: SelectorFn<T>) -> Self {
        Self {
            inner: Rc::new(SelectorInner {
                db,
                name: name.to_string(),
                query,
                state: RefCell::new(SelectorState {
                    cached: None,
                    stale: true,
                    running: false,
                    scheduled: false,
                    next_subscriber: 0,
                    subscribers: Vec::new(),
                    pending: Vec::new(),
                    observed: BTreeSet::new(),
                    listeners: BTreeMap::new(),
                }),
            }),
        }
    }

    /// Resolve the cached value, or await the next completed evaluation.
    pub async fn get(&self) -> Result<Rc<T>, Error> {
        {
            let state = self.inner.state.borrow();
            if let Some(cached) = &state.cached
                && !state.stale
                && !state.running
            {
                return Ok(cached.clone());
            }
        }

        let (rx, should_drive) = {
            let mut state = self.inner.state.borrow_mut();
            let (tx, rx) = oneshot::channel();
            state.pending.push(tx);
            (rx, !state.running)
        };
        if should_drive {
            SelectorInner::refresh_loop(&self.inner).await;
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(InternalError::internal(
                ErrorOrigin::Selector,
                "selector refresh was dropped before resolving",
            )
            .into()),
        }
    }

    /// Register a subscriber. It is invoked immediately with the cached
    /// value when one exists; otherwise a refresh is scheduled and the
    /// subscriber fires on its completion.
    pub fn subscribe(&self, cb: impl Fn(&T) + 'static) -> Subscription {
        let cb: Rc<dyn Fn(&T)> = Rc::new(cb);
        let (id, cached) = {
            let mut state = self.inner.state.borrow_mut();
            let id = state.next_subscriber;
            state.next_subscriber += 1;
            state.subscribers.push((id, cb.clone()));
            (id, state.cached.clone())
        };

        if let Some(value) = cached {
            cb(&value);
        } else {
            SelectorInner::invalidate(&self.inner);
        }

        let inner = Rc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = inner.upgrade() {
                    inner
                        .state
                        .borrow_mut()
                        .subscribers
                        .retain(|(sid, _)| *sid != id);
                }
            })),
        }
    }

    /// Force an evaluation now (test and warm-up plumbing).
    pub async fn refresh(&self) -> Result<Rc<T>, Error> {
        self.inner.state.borrow_mut().stale = true;
        self.get().await
    }
}

///
/// Subscription
///

pub struct Subscription {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl<T: 'static> SelectorInner<T> {
    /// Mark stale and queue this selector for the next drain. Idempotent
    /// while already scheduled or mid-refresh (the refresh loop picks up
    /// the new staleness itself).
    pub(crate) fn invalidate(inner: &Rc<Self>) {
        let mut state = inner.state.borrow_mut();
        state.stale = true;
        if !state.scheduled && !state.running {
            state.scheduled = true;
            inner
                .db
                .dirty_selectors
                .borrow_mut()
                .push_back(inner.clone() as Rc<dyn SelectorDriver>);
        }
    }

    /// Evaluate until no longer stale; a single loop instance runs at a
    /// time, so rapid invalidations collapse into one evaluation per
    /// batch.
    async fn refresh_loop(inner: &Rc<Self>) {
        {
            let mut state = inner.state.borrow_mut();
            if state.running {
                return;
            }
            state.running = true;
        }

        loop {
            inner.state.borrow_mut().stale = false;
            match Self::evaluate(inner).await {
                Ok(value) => {
                    let value = Rc::new(value);
                    let (subscribers, pending) = {
                        let mut state = inner.state.borrow_mut();
                        state.cached = Some(value.clone());
                        let subscribers: Vec<_> = state
                            .subscribers
                            .iter()
                            .map(|(_, cb)| cb.clone())
                            .collect();
                        (subscribers, std::mem::take(&mut state.pending))
                    };
                    for cb in subscribers {
                        cb(&value);
                    }
                    for tx in pending {
                        let _ = tx.send(Ok(value.clone()));
                    }
                }
                Err(err) => {
                    // Cached data and subscriptions are retained; only
                    // the getters of this refresh see the failure.
                    let pending = std::mem::take(&mut inner.state.borrow_mut().pending);
                    for tx in pending {
                        let _ = tx.send(Err(err.clone()));
                    }
                }
            }

            let again = {
                let mut state = inner.state.borrow_mut();
                if state.stale {
                    true
                } else {
                    state.running = false;
                    false
                }
            };
            if !again {
                break;
            }
        }
    }

    /// One evaluation on a fresh read transaction with observation
    /// enabled; on success the per-store subscriptions are re-pointed at
    /// exactly the observed set.
    async fn evaluate(inner: &Rc<Self>) -> Result<T, Error> {
        sink::record(&MetricsEvent::SelectorRefresh {
            selector: inner.name.clone(),
        });

        let observed = Rc::new(RefCell::new(BTreeSet::new()));
        let conn = ensure_open(&inner.db).await.map_err(Error::from)?;
        let scope = conn.store_names();
        let tx = conn
            .transaction(&scope, TxMode::ReadOnly, Durability::Default)
            .map_err(Error::from)?;
        let ctx = TaskContext::with_observation(tx, observed.clone());

        let sel_ctx = SelectorCtx {
            db: inner.db.clone(),
            ctx: ctx.clone(),
        };
        let query_future = (inner.query)(sel_ctx);
        let result = ctx
            .run(move |_ctx| async move { query_future.await.map_err(InternalError::from) })
            .await;

        match result {
            Ok(value) => {
                let observed = observed.borrow().clone();
                Self::sync_subscriptions(inner, &observed);
                Ok(value)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Diff the observed set against the current subscriptions:
    /// unsubscribe from now-unobserved stores, subscribe to newly
    /// observed ones.
    fn sync_subscriptions(inner: &Rc<Self>, observed: &BTreeSet<String>) {
        let previous = {
            let state = inner.state.borrow();
            state.observed.clone()
        };

        for removed in previous.difference(observed) {
            let ids = inner
                .state
                .borrow_mut()
                .listeners
                .remove(removed)
                .unwrap_or_default();
            if let Some(core) = inner.db.collection_core(removed) {
                for (kind, id) in ids {
                    core.events.remove_listener(kind, id);
                }
            }
        }

        for added in observed.difference(&previous) {
            let Some(core) = inner.db.collection_core(added) else {
                continue;
            };
            let weak = Rc::downgrade(inner);
            let listener: Listener = Rc::new(move |_| {
                if let Some(inner) = weak.upgrade() {
                    Self::invalidate(&inner);
                }
            });
            let ids = vec![
                (
                    EventKind::WriteDelete,
                    core.events.add_listener(EventKind::WriteDelete, listener.clone()),
                ),
                (
                    EventKind::Clear,
                    core.events.add_listener(EventKind::Clear, listener),
                ),
            ];
            inner
                .state
                .borrow_mut()
                .listeners
                .insert(added.clone(), ids);
        }

        inner.state.borrow_mut().observed = observed.clone();
    }
}

impl<T: 'static> SelectorDriver for SelectorInner<T> {
    fn drive(self: Rc<Self>) -> LocalBoxFuture<'static, ()> {
        Box::pin(async move {
            self.state.borrow_mut().scheduled = false;
            Self::refresh_loop(&self).await;
        })
    }
}
