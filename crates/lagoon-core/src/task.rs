//! Module: task
//! Responsibility: the per-transaction scratchpad and its commit protocol.
//! Does not own: transaction scheduling (the coordinator) or store semantics.
//! Boundary: all fallible work happens before the commit request; post-commit
//! hooks run only after the capability confirms completion.

use crate::{
    adapter,
    capability::{ObjectStore, Transaction},
    error::InternalError,
    key::Key,
    obs::sink::{self, MetricsEvent},
};
use futures::future::LocalBoxFuture;
use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    rc::Rc,
};

///
/// PrecommitKey
/// Stable identity for a deferred pre-commit check: `(collection, row key)`.
/// Re-registering the same key replaces the previous callback.
///

pub type PrecommitKey = (String, Key);

type PostCommitHook = Box<dyn FnOnce()>;
type PrecommitHook =
    Box<dyn FnOnce(Rc<TaskContext>) -> LocalBoxFuture<'static, Result<(), InternalError>>>;

///
/// TaskContext
/// Ephemeral per-transaction object: the live transaction, ordered
/// post-commit callbacks, keyed pre-commit callbacks, and the abort flag.
/// Optionally carries the observed-collection set used by selector
/// dependency tracking; observation rides the transaction, not a global.
///

pub struct TaskContext {
    tx: Rc<dyn Transaction>,
    observed: Option<Rc<RefCell<BTreeSet<String>>>>,
    state: RefCell<TaskState>,
}

struct TaskState {
    post_commit: Vec<PostCommitHook>,
    pre_commit: BTreeMap<PrecommitKey, PrecommitHook>,
    aborted: bool,
}

impl TaskContext {
    #[must_use]
    pub fn new(tx: Rc<dyn Transaction>) -> Rc<Self> {
        Self::build(tx, None)
    }

    #[must_use]
    pub fn with_observation(
        tx: Rc<dyn Transaction>,
        observed: Rc<RefCell<BTreeSet<String>>>,
    ) -> Rc<Self> {
        Self::build(tx, Some(observed))
    }

    fn build(tx: Rc<dyn Transaction>, observed: Option<Rc<RefCell<BTreeSet<String>>>>) -> Rc<Self> {
        sink::record(&MetricsEvent::TaskStarted {
            write: tx.mode().is_write(),
        });
        Rc::new(Self {
            tx,
            observed,
            state: RefCell::new(TaskState {
                post_commit: Vec::new(),
                pre_commit: BTreeMap::new(),
                aborted: false,
            }),
        })
    }

    #[must_use]
    pub const fn transaction(&self) -> &Rc<dyn Transaction> {
        &self.tx
    }

    pub fn object_store(&self, name: &str) -> Result<Rc<dyn ObjectStore>, InternalError> {
        self.tx.object_store(name)
    }

    /// Record a read dependency for selector tracking, when enabled.
    pub fn observe(&self, collection: &str) {
        if let Some(observed) = &self.observed {
            observed.borrow_mut().insert(collection.to_string());
        }
    }

    /// Append to the post-commit list; fires in insertion order.
    pub fn on_did_commit(&self, cb: impl FnOnce() + 'static) {
        self.state.borrow_mut().post_commit.push(Box::new(cb));
    }

    /// Insert a keyed pre-commit callback; a later call with the same
    /// key replaces the previous entry.
    pub fn on_will_commit(
        &self,
        key: PrecommitKey,
        cb: impl FnOnce(Rc<Self>) -> LocalBoxFuture<'static, Result<(), InternalError>> + 'static,
    ) {
        self.state.borrow_mut().pre_commit.insert(key, Box::new(cb));
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state.borrow().aborted
    }

    /// Abort the transaction and drop every registered hook.
    pub fn abort(&self) {
        {
            let mut state = self.state.borrow_mut();
            state.aborted = true;
            state.post_commit.clear();
            state.pre_commit.clear();
        }
        self.tx.abort();
        sink::record(&MetricsEvent::TaskAborted);
    }

    /// Execute `f` within this context, then settle the transaction.
    ///
    /// On success: every pre-commit callback runs once (deduplicated by
    /// key, including keys re-registered mid-drain), the transaction
    /// commits, and post-commit callbacks fire in insertion order. On any
    /// error the transaction aborts, post-commit callbacks are dropped,
    /// and the error surfaces.
    pub async fn run<T, F, Fut>(self: Rc<Self>, f: F) -> Result<T, InternalError>
    where
        F: FnOnce(Rc<Self>) -> Fut,
        Fut: Future<Output = Result<T, InternalError>>,
    {
        let value = match f(self.clone()).await {
            Ok(value) => value,
            Err(err) => {
                self.abort();
                return Err(err);
            }
        };

        if let Err(err) = Self::drain_pre_commit(&self).await {
            self.abort();
            return Err(err);
        }

        if let Err(err) = adapter::request(self.tx.commit()).await {
            let mut state = self.state.borrow_mut();
            state.aborted = true;
            state.post_commit.clear();
            return Err(err);
        }

        let hooks = std::mem::take(&mut self.state.borrow_mut().post_commit);
        sink::record(&MetricsEvent::TaskCommitted {
            post_commit_hooks: hooks.len() as u64,
        });
        for hook in hooks {
            hook();
        }

        Ok(value)
    }

    async fn drain_pre_commit(ctx: &Rc<Self>) -> Result<(), InternalError> {
        let mut executed: BTreeSet<PrecommitKey> = BTreeSet::new();
        loop {
            let entry = {
                let mut state = ctx.state.borrow_mut();
                loop {
                    match state.pre_commit.pop_first() {
                        Some((key, _)) if executed.contains(&key) => {}
                        Some((key, hook)) => break Some((key, hook)),
                        None => break None,
                    }
                }
            };
            let Some((key, hook)) = entry else {
                return Ok(());
            };
            executed.insert(key);
            hook(ctx.clone()).await?;
        }
    }
}
