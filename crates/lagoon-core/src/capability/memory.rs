//! Module: capability::memory
//! Responsibility: in-memory reference implementation of the store capability.
//! Does not own: engine semantics; this is a plain keyed store with indexes,
//! scope-locked transactions, and the open/upgrade/blocked handshake.
//! Boundary: all state is thread-local and keyed by database name, so every
//! connection ("tab") on one thread observes the same store.

use crate::{
    capability::{
        Connection, Cursor, CursorRow, Direction, Durability, IndexHandle, IndexSpec, OpenEvent,
        OpenRequest, ObjectStore, Request, RequestSubscriber, StoreBackend, StoreSpec, Transaction,
        TxMode, UpgradeHandle,
    },
    error::{ErrorClass, ErrorOrigin, InternalError},
    key::{Key, KeyRange},
    value::Value,
};
use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    rc::{Rc, Weak},
};

thread_local! {
    static REGISTRY: RefCell<HashMap<String, Rc<DbState>>> = RefCell::new(HashMap::new());
}

fn store_err(message: impl Into<String>) -> InternalError {
    InternalError::store(ErrorOrigin::Capability, message)
}

///
/// MemoryBackend
/// Thread-local reference backend. Databases persist for the lifetime
/// of the thread, across connections, which is what gives multiple
/// engine instances ("tabs") one shared store.
///

#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryBackend;

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self)
    }

    /// Drop one named database on this thread. Test plumbing.
    pub fn reset(name: &str) {
        REGISTRY.with_borrow_mut(|reg| {
            reg.remove(name);
        });
    }

    /// Drop every named database on this thread. Test plumbing.
    pub fn reset_all() {
        REGISTRY.with_borrow_mut(HashMap::clear);
    }
}

impl StoreBackend for MemoryBackend {
    fn open(&self, name: &str, version: u32) -> Rc<dyn OpenRequest> {
        let db = REGISTRY.with_borrow_mut(|reg| {
            reg.entry(name.to_string())
                .or_insert_with(|| Rc::new(DbState::new(name)))
                .clone()
        });
        let open = Rc::new(OpenState::new(db, version));
        OpenState::start(&open);
        open
    }
}

///
/// MemoryRequest
///

struct MemoryRequest<T> {
    state: RefCell<RequestState<T>>,
}

enum RequestState<T> {
    Pending,
    Ready(Result<T, InternalError>),
    Waiting(RequestSubscriber<T>),
    Done,
}

impl<T: 'static> MemoryRequest<T> {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(RequestState::Pending),
        })
    }

    fn resolve(&self, result: Result<T, InternalError>) {
        let prev = std::mem::replace(&mut *self.state.borrow_mut(), RequestState::Done);
        match prev {
            RequestState::Waiting(cb) => cb(result),
            RequestState::Pending => {
                *self.state.borrow_mut() = RequestState::Ready(result);
            }
            // Double resolve keeps the first outcome.
            other => {
                *self.state.borrow_mut() = other;
            }
        }
    }
}

impl<T: 'static> Request<T> for MemoryRequest<T> {
    fn subscribe(&self, cb: RequestSubscriber<T>) {
        let prev = std::mem::replace(&mut *self.state.borrow_mut(), RequestState::Done);
        match prev {
            RequestState::Ready(result) => cb(result),
            RequestState::Pending => {
                *self.state.borrow_mut() = RequestState::Waiting(cb);
            }
            other => {
                *self.state.borrow_mut() = other;
            }
        }
    }
}

///
/// IndexState
///

#[derive(Clone)]
struct IndexState {
    spec: IndexSpec,
    /// `(index key, primary key)`, kept sorted for ordered index walks.
    entries: BTreeSet<(Key, Key)>,
}

///
/// StoreState
/// One object store: rows keyed in-line, secondary indexes, and the
/// auto-increment cursor.
///

#[derive(Clone)]
struct StoreState {
    spec: StoreSpec,
    next_auto: u64,
    rows: BTreeMap<Key, Value>,
    indexes: BTreeMap<String, IndexState>,
}

impl StoreState {
    fn new(spec: StoreSpec) -> Self {
        Self {
            spec,
            next_auto: 1,
            rows: BTreeMap::new(),
            indexes: BTreeMap::new(),
        }
    }

    fn put_row(&mut self, key: Key, value: Value, is_add: bool) -> Result<(), InternalError> {
        if is_add && self.rows.contains_key(&key) {
            return Err(store_err(format!(
                "add would overwrite existing key {:?}",
                key.as_value()
            )));
        }

        // Validate unique indexes before any mutation.
        for (name, index) in &self.indexes {
            if !index.spec.unique {
                continue;
            }
            for index_key in index_keys(&index.spec, &value) {
                let conflict = index
                    .entries
                    .iter()
                    .any(|(k, pk)| *k == index_key && *pk != key);
                if conflict {
                    return Err(store_err(format!(
                        "unique index '{name}' violated by key {:?}",
                        index_key.as_value()
                    )));
                }
            }
        }

        if let Some(old) = self.rows.get(&key).cloned() {
            self.remove_index_entries(&key, &old);
        }
        self.insert_index_entries(&key, &value);
        self.rows.insert(key, value);

        Ok(())
    }

    fn remove_row(&mut self, key: &Key) {
        if let Some(old) = self.rows.remove(key) {
            self.remove_index_entries(key, &old);
        }
    }

    fn clear_rows(&mut self) {
        self.rows.clear();
        for index in self.indexes.values_mut() {
            index.entries.clear();
        }
    }

    fn insert_index_entries(&mut self, primary: &Key, value: &Value) {
        for index in self.indexes.values_mut() {
            for index_key in index_keys(&index.spec, value) {
                index.entries.insert((index_key, primary.clone()));
            }
        }
    }

    fn remove_index_entries(&mut self, primary: &Key, value: &Value) {
        for index in self.indexes.values_mut() {
            for index_key in index_keys(&index.spec, value) {
                index.entries.remove(&(index_key, primary.clone()));
            }
        }
    }
}

/// Expand the index key(s) of one row. Rows that do not produce a valid
/// key for an index are simply absent from it.
fn index_keys(spec: &IndexSpec, value: &Value) -> Vec<Key> {
    let Value::Map(map) = value else {
        return Vec::new();
    };

    if spec.key_path.len() > 1 {
        let mut parts = Vec::with_capacity(spec.key_path.len());
        for field in &spec.key_path {
            match map.get(field) {
                Some(part) if part.is_keyable() => parts.push(part.clone()),
                _ => return Vec::new(),
            }
        }
        return Key::try_from_value(Value::List(parts)).map_or_else(|_| Vec::new(), |k| vec![k]);
    }

    match map.get(&spec.key_path[0]) {
        Some(Value::List(items)) if spec.multi_entry => items
            .iter()
            .filter(|item| item.is_keyable())
            .filter_map(|item| Key::try_from_value(item.clone()).ok())
            .collect(),
        Some(part) if part.is_keyable() => {
            Key::try_from_value(part.clone()).map_or_else(|_| Vec::new(), |k| vec![k])
        }
        _ => Vec::new(),
    }
}

/// Resolve the in-line key of a value, generating one when the store
/// has a key generator and the key path field is absent.
fn prepare_value_key(
    store: &mut StoreState,
    value: Value,
) -> Result<(Key, Value), InternalError> {
    let Value::Map(mut map) = value else {
        return Err(store_err("store values must be records"));
    };

    let key_path = store.spec.key_path.clone();
    if key_path.len() > 1 {
        let mut parts = Vec::with_capacity(key_path.len());
        for field in &key_path {
            match map.get(field) {
                None | Some(Value::Null) => {
                    return Err(store_err(format!("key path field '{field}' is missing")));
                }
                Some(part) => parts.push(part.clone()),
            }
        }
        let key = Key::try_from_value(Value::List(parts))?;
        return Ok((key, Value::Map(map)));
    }

    let field = &key_path[0];
    match map.get(field) {
        None | Some(Value::Null) => {
            if !store.spec.auto_increment {
                return Err(store_err(format!(
                    "key path field '{field}' is missing and the store has no key generator"
                )));
            }
            let generated = store.next_auto;
            store.next_auto += 1;
            map.insert(field.clone(), Value::Uint(generated));
            let key = Key::try_from_value(Value::Uint(generated))?;
            Ok((key, Value::Map(map)))
        }
        Some(part) => {
            let key = Key::try_from_value(part.clone())?;
            // Explicit numeric keys move the generator forward.
            if store.spec.auto_increment {
                match key.as_value() {
                    Value::Uint(n) if *n >= store.next_auto => store.next_auto = *n + 1,
                    #[allow(clippy::cast_sign_loss)]
                    Value::Int(n) if *n >= 0 && (*n as u64) >= store.next_auto => {
                        store.next_auto = *n as u64 + 1;
                    }
                    _ => {}
                }
            }
            Ok((key, Value::Map(map)))
        }
    }
}

///
/// LockTable
/// Shared/exclusive per-store locks with a FIFO wait queue; the
/// capability-side transaction scheduler.
///

#[derive(Default)]
struct LockTable {
    readers: HashMap<String, usize>,
    writers: HashSet<String>,
    queue: VecDeque<Rc<MemoryTransaction>>,
}

impl LockTable {
    fn can_acquire(&self, scope: &[String], mode: TxMode) -> bool {
        scope.iter().all(|store| {
            let no_writer = !self.writers.contains(store);
            match mode {
                TxMode::ReadOnly => no_writer,
                TxMode::ReadWrite => {
                    no_writer && self.readers.get(store).copied().unwrap_or(0) == 0
                }
            }
        })
    }

    fn acquire(&mut self, scope: &[String], mode: TxMode) {
        for store in scope {
            match mode {
                TxMode::ReadOnly => *self.readers.entry(store.clone()).or_insert(0) += 1,
                TxMode::ReadWrite => {
                    self.writers.insert(store.clone());
                }
            }
        }
    }

    fn release(&mut self, scope: &[String], mode: TxMode) {
        for store in scope {
            match mode {
                TxMode::ReadOnly => {
                    if let Some(count) = self.readers.get_mut(store) {
                        *count = count.saturating_sub(1);
                    }
                }
                TxMode::ReadWrite => {
                    self.writers.remove(store);
                }
            }
        }
    }
}

///
/// DbState
///

struct DbState {
    name: String,
    version: Cell<u32>,
    stores: RefCell<BTreeMap<String, StoreState>>,
    connections: RefCell<Vec<Weak<ConnectionState>>>,
    waiting_opens: RefCell<VecDeque<Rc<OpenState>>>,
    locks: RefCell<LockTable>,
}

impl DbState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: Cell::new(0),
            stores: RefCell::new(BTreeMap::new()),
            connections: RefCell::new(Vec::new()),
            waiting_opens: RefCell::new(VecDeque::new()),
            locks: RefCell::new(LockTable::default()),
        }
    }

    fn live_connection_count(&self) -> usize {
        let mut conns = self.connections.borrow_mut();
        conns.retain(|weak| weak.upgrade().is_some_and(|conn| !conn.closed.get()));
        conns.len()
    }

    /// Once the last connection closes, let the oldest blocked open
    /// proceed. One at a time; its own connection gates the rest.
    fn process_waiting(db: &Rc<Self>) {
        if db.live_connection_count() > 0 {
            return;
        }
        let next = db.waiting_opens.borrow_mut().pop_front();
        if let Some(open) = next {
            OpenState::proceed(&open);
        }
    }
}

fn pump_locks(db: &Rc<DbState>) {
    loop {
        let granted = {
            let mut locks = db.locks.borrow_mut();
            match locks.queue.front() {
                Some(tx) if locks.can_acquire(&tx.scope, tx.mode) => {
                    let tx = locks.queue.pop_front().expect("front checked above");
                    locks.acquire(&tx.scope, tx.mode);
                    Some(tx)
                }
                _ => None,
            }
        };
        match granted {
            Some(tx) => MemoryTransaction::activate(&tx),
            None => break,
        }
    }
}

///
/// MemoryTransaction
///

type DeferredOp = Box<dyn FnOnce(Option<InternalError>)>;

enum TxPhase {
    Waiting(VecDeque<DeferredOp>),
    Active,
    Committed,
    Aborted,
}

struct TxInner {
    phase: TxPhase,
    /// Scoped working copies for read-write transactions; written back
    /// on commit, discarded on abort.
    working: BTreeMap<String, StoreState>,
}

struct MemoryTransaction {
    db: Rc<DbState>,
    mode: TxMode,
    scope: Vec<String>,
    version_change: bool,
    upgrade_open: RefCell<Option<Rc<OpenState>>>,
    inner: RefCell<TxInner>,
}

impl MemoryTransaction {
    fn begin(
        db: &Rc<DbState>,
        scope: Vec<String>,
        mode: TxMode,
    ) -> Result<Rc<Self>, InternalError> {
        {
            let stores = db.stores.borrow();
            for name in &scope {
                if !stores.contains_key(name) {
                    return Err(store_err(format!("unknown object store '{name}'")));
                }
            }
        }

        let tx = Rc::new(Self {
            db: db.clone(),
            mode,
            scope,
            version_change: false,
            upgrade_open: RefCell::new(None),
            inner: RefCell::new(TxInner {
                phase: TxPhase::Waiting(VecDeque::new()),
                working: BTreeMap::new(),
            }),
        });

        let granted = {
            let mut locks = db.locks.borrow_mut();
            if locks.queue.is_empty() && locks.can_acquire(&tx.scope, mode) {
                locks.acquire(&tx.scope, mode);
                true
            } else {
                locks.queue.push_back(tx.clone());
                false
            }
        };
        if granted {
            Self::activate(&tx);
        }

        Ok(tx)
    }

    fn activate(tx: &Rc<Self>) {
        let ops = {
            let mut inner = tx.inner.borrow_mut();
            if tx.mode.is_write() {
                let stores = tx.db.stores.borrow();
                inner.working = tx
                    .scope
                    .iter()
                    .filter_map(|name| stores.get(name).map(|s| (name.clone(), s.clone())))
                    .collect();
            }
            match std::mem::replace(&mut inner.phase, TxPhase::Active) {
                TxPhase::Waiting(queue) => queue,
                other => {
                    inner.phase = other;
                    return;
                }
            }
        };
        for op in ops {
            op(None);
        }
    }

    fn run_op(tx: &Rc<Self>, op: DeferredOp) {
        let to_run = {
            let mut inner = tx.inner.borrow_mut();
            match &mut inner.phase {
                TxPhase::Waiting(queue) => {
                    queue.push_back(op);
                    None
                }
                TxPhase::Active => Some((op, None)),
                TxPhase::Committed | TxPhase::Aborted => {
                    Some((op, Some(store_err("transaction is finished"))))
                }
            }
        };
        if let Some((op, err)) = to_run {
            op(err);
        }
    }

    fn with_store<R>(
        &self,
        name: &str,
        f: impl FnOnce(&StoreState) -> Result<R, InternalError>,
    ) -> Result<R, InternalError> {
        if self.mode.is_write() {
            let inner = self.inner.borrow();
            match inner.working.get(name) {
                Some(store) => f(store),
                None => Err(store_err(format!("unknown object store '{name}'"))),
            }
        } else {
            let stores = self.db.stores.borrow();
            match stores.get(name) {
                Some(store) => f(store),
                None => Err(store_err(format!("unknown object store '{name}'"))),
            }
        }
    }

    fn with_store_mut<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut StoreState) -> Result<R, InternalError>,
    ) -> Result<R, InternalError> {
        if !self.mode.is_write() {
            return Err(store_err("write attempted in a read-only transaction"));
        }
        let mut inner = self.inner.borrow_mut();
        match inner.working.get_mut(name) {
            Some(store) => f(store),
            None => Err(store_err(format!("unknown object store '{name}'"))),
        }
    }

    fn finish_commit(tx: &Rc<Self>) -> Result<(), InternalError> {
        {
            let mut inner = tx.inner.borrow_mut();
            if !matches!(inner.phase, TxPhase::Active) {
                return Err(store_err("commit on a finished transaction"));
            }
            if tx.mode.is_write() {
                let working = std::mem::take(&mut inner.working);
                if tx.version_change {
                    *tx.db.stores.borrow_mut() = working;
                } else {
                    let mut stores = tx.db.stores.borrow_mut();
                    for (name, state) in working {
                        stores.insert(name, state);
                    }
                }
            }
            inner.phase = TxPhase::Committed;
        }

        tx.release_locks_and_pump();
        let open = tx.upgrade_open.borrow_mut().take();
        if let Some(open) = open {
            OpenState::finish_upgrade(&open);
        }

        Ok(())
    }

    fn finish_abort(tx: &Rc<Self>) {
        let drained = {
            let mut inner = tx.inner.borrow_mut();
            match std::mem::replace(&mut inner.phase, TxPhase::Aborted) {
                TxPhase::Waiting(queue) => {
                    inner.working.clear();
                    Some((queue, true))
                }
                TxPhase::Active => {
                    inner.working.clear();
                    Some((VecDeque::new(), false))
                }
                finished => {
                    inner.phase = finished;
                    None
                }
            }
        };
        let Some((queue, was_waiting)) = drained else {
            return;
        };

        if was_waiting {
            tx.db
                .locks
                .borrow_mut()
                .queue
                .retain(|queued| !Rc::ptr_eq(queued, tx));
        } else {
            tx.release_locks_and_pump();
        }

        for op in queue {
            op(Some(store_err("transaction aborted")));
        }

        let open = tx.upgrade_open.borrow_mut().take();
        if let Some(open) = open {
            OpenState::fail(&open, store_err("upgrade transaction aborted"));
        }
    }

    fn release_locks_and_pump(&self) {
        {
            let mut locks = self.db.locks.borrow_mut();
            locks.release(&self.scope, self.mode);
        }
        pump_locks(&self.db);
    }

    fn in_scope(&self, name: &str) -> bool {
        self.version_change || self.scope.iter().any(|s| s == name)
    }
}

///
/// TxHandle
///

struct TxHandle(Rc<MemoryTransaction>);

impl Transaction for TxHandle {
    fn mode(&self) -> TxMode {
        self.0.mode
    }

    fn object_store(&self, name: &str) -> Result<Rc<dyn ObjectStore>, InternalError> {
        if !self.0.in_scope(name) {
            return Err(store_err(format!(
                "object store '{name}' is outside this transaction's scope"
            )));
        }
        Ok(Rc::new(MemoryStore {
            tx: self.0.clone(),
            name: name.to_string(),
        }))
    }

    fn commit(&self) -> Rc<dyn Request<()>> {
        let request = MemoryRequest::new();
        let (tx, req) = (self.0.clone(), request.clone());
        MemoryTransaction::run_op(&self.0, Box::new(move |err| {
            if let Some(err) = err {
                req.resolve(Err(err));
                return;
            }
            req.resolve(MemoryTransaction::finish_commit(&tx));
        }));
        request
    }

    fn abort(&self) {
        MemoryTransaction::finish_abort(&self.0);
    }

    fn is_finished(&self) -> bool {
        matches!(
            self.0.inner.borrow().phase,
            TxPhase::Committed | TxPhase::Aborted
        )
    }
}

///
/// MemoryStore
///

struct MemoryStore {
    tx: Rc<MemoryTransaction>,
    name: String,
}

impl MemoryStore {
    fn write_op<T: 'static>(
        &self,
        f: impl FnOnce(&Rc<MemoryTransaction>, &str) -> Result<T, InternalError> + 'static,
    ) -> Rc<dyn Request<T>> {
        let request = MemoryRequest::new();
        let (tx, name, req) = (self.tx.clone(), self.name.clone(), request.clone());
        MemoryTransaction::run_op(&self.tx, Box::new(move |err| {
            if let Some(err) = err {
                req.resolve(Err(err));
                return;
            }
            req.resolve(f(&tx, &name));
        }));
        request
    }
}

impl ObjectStore for MemoryStore {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn add(&self, value: Value) -> Rc<dyn Request<Key>> {
        self.write_op(move |tx, name| {
            tx.with_store_mut(name, |store| {
                let (key, value) = prepare_value_key(store, value)?;
                store.put_row(key.clone(), value, true)?;
                Ok(key)
            })
        })
    }

    fn put(&self, value: Value) -> Rc<dyn Request<Key>> {
        self.write_op(move |tx, name| {
            tx.with_store_mut(name, |store| {
                let (key, value) = prepare_value_key(store, value)?;
                store.put_row(key.clone(), value, false)?;
                Ok(key)
            })
        })
    }

    fn get(&self, key: &Key) -> Rc<dyn Request<Option<Value>>> {
        let key = key.clone();
        self.write_op(move |tx, name| {
            tx.with_store(name, |store| Ok(store.rows.get(&key).cloned()))
        })
    }

    fn get_key(&self, range: &KeyRange) -> Rc<dyn Request<Option<Key>>> {
        let range = range.clone();
        self.write_op(move |tx, name| {
            tx.with_store(name, |store| {
                Ok(store.rows.keys().find(|k| range.contains(k)).cloned())
            })
        })
    }

    fn delete(&self, key: &Key) -> Rc<dyn Request<()>> {
        let key = key.clone();
        self.write_op(move |tx, name| {
            tx.with_store_mut(name, |store| {
                store.remove_row(&key);
                Ok(())
            })
        })
    }

    fn clear(&self) -> Rc<dyn Request<()>> {
        self.write_op(move |tx, name| {
            tx.with_store_mut(name, |store| {
                store.clear_rows();
                Ok(())
            })
        })
    }

    fn count(&self, range: Option<&KeyRange>) -> Rc<dyn Request<u64>> {
        let range = range.cloned();
        self.write_op(move |tx, name| {
            tx.with_store(name, |store| {
                let count = match &range {
                    Some(range) => store.rows.keys().filter(|k| range.contains(k)).count(),
                    None => store.rows.len(),
                };
                Ok(count as u64)
            })
        })
    }

    fn get_all(
        &self,
        range: Option<&KeyRange>,
        limit: Option<usize>,
    ) -> Rc<dyn Request<Vec<Value>>> {
        let range = range.cloned();
        self.write_op(move |tx, name| {
            tx.with_store(name, |store| {
                let values = store
                    .rows
                    .iter()
                    .filter(|(k, _)| range.as_ref().is_none_or(|r| r.contains(k)))
                    .map(|(_, v)| v.clone())
                    .take(limit.unwrap_or(usize::MAX))
                    .collect();
                Ok(values)
            })
        })
    }

    fn index(&self, name: &str) -> Result<Rc<dyn IndexHandle>, InternalError> {
        let exists = {
            let inner = self.tx.inner.borrow();
            let live = matches!(inner.phase, TxPhase::Active) && self.tx.mode.is_write();
            if live {
                inner
                    .working
                    .get(&self.name)
                    .is_some_and(|store| store.indexes.contains_key(name))
            } else {
                self.tx
                    .db
                    .stores
                    .borrow()
                    .get(&self.name)
                    .is_some_and(|store| store.indexes.contains_key(name))
            }
        };
        if !exists {
            return Err(InternalError::new(
                ErrorClass::UnknownIndex,
                ErrorOrigin::Capability,
                format!("index '{name}' does not exist on store '{}'", self.name),
            ));
        }

        Ok(Rc::new(MemoryIndex {
            tx: self.tx.clone(),
            store: self.name.clone(),
            index: name.to_string(),
        }))
    }

    fn open_cursor(&self, range: Option<&KeyRange>, direction: Direction) -> Rc<dyn Cursor> {
        Rc::new(CursorHandle(Rc::new(MemoryCursor {
            tx: self.tx.clone(),
            store: self.name.clone(),
            index: None,
            range: range.cloned(),
            direction,
            last: RefCell::new(None),
            current: RefCell::new(None),
        })))
    }
}

///
/// MemoryIndex
///

struct MemoryIndex {
    tx: Rc<MemoryTransaction>,
    store: String,
    index: String,
}

impl IndexHandle for MemoryIndex {
    fn name(&self) -> String {
        self.index.clone()
    }

    fn open_cursor(&self, range: Option<&KeyRange>, direction: Direction) -> Rc<dyn Cursor> {
        Rc::new(CursorHandle(Rc::new(MemoryCursor {
            tx: self.tx.clone(),
            store: self.store.clone(),
            index: Some(self.index.clone()),
            range: range.cloned(),
            direction,
            last: RefCell::new(None),
            current: RefCell::new(None),
        })))
    }
}

///
/// MemoryCursor
/// Position is `(cursor key, primary key)` so within-transaction row
/// mutations never strand the walk.
///

struct MemoryCursor {
    tx: Rc<MemoryTransaction>,
    store: String,
    index: Option<String>,
    range: Option<KeyRange>,
    direction: Direction,
    last: RefCell<Option<(Key, Key)>>,
    current: RefCell<Option<Key>>,
}

impl MemoryCursor {
    fn in_range(&self, key: &Key) -> bool {
        self.range.as_ref().is_none_or(|range| range.contains(key))
    }

    fn step(cursor: &Rc<Self>) -> Result<Option<CursorRow>, InternalError> {
        let last = cursor.last.borrow().clone();
        let row = cursor.tx.with_store(&cursor.store, |store| {
            match &cursor.index {
                None => {
                    let mut iter: Box<dyn Iterator<Item = (&Key, &Value)> + '_> =
                        match cursor.direction {
                            Direction::Next => Box::new(store.rows.iter()),
                            Direction::Prev => Box::new(store.rows.iter().rev()),
                        };
                    let found = iter.find(|&(key, _)| {
                        cursor.in_range(key)
                            && last.as_ref().is_none_or(|(lk, _)| match cursor.direction {
                                Direction::Next => key > lk,
                                Direction::Prev => key < lk,
                            })
                    });
                    Ok(found.map(|(key, value)| CursorRow {
                        key: key.clone(),
                        primary_key: key.clone(),
                        value: value.clone(),
                    }))
                }
                Some(index_name) => {
                    let Some(index) = store.indexes.get(index_name) else {
                        return Err(InternalError::new(
                            ErrorClass::UnknownIndex,
                            ErrorOrigin::Capability,
                            format!("index '{index_name}' does not exist"),
                        ));
                    };
                    let mut iter: Box<dyn Iterator<Item = &(Key, Key)> + '_> = match cursor.direction
                    {
                        Direction::Next => Box::new(index.entries.iter()),
                        Direction::Prev => Box::new(index.entries.iter().rev()),
                    };
                    let found = iter.find(|entry| {
                        cursor.in_range(&entry.0)
                            && last.as_ref().is_none_or(|prev| match cursor.direction {
                                Direction::Next => *entry > prev,
                                Direction::Prev => *entry < prev,
                            })
                    });
                    Ok(found.and_then(|(index_key, primary)| {
                        store.rows.get(primary).map(|value| CursorRow {
                            key: index_key.clone(),
                            primary_key: primary.clone(),
                            value: value.clone(),
                        })
                    }))
                }
            }
        })?;

        match row {
            Some(row) => {
                *cursor.last.borrow_mut() = Some((row.key.clone(), row.primary_key.clone()));
                *cursor.current.borrow_mut() = Some(row.primary_key.clone());
                Ok(Some(row))
            }
            None => {
                *cursor.current.borrow_mut() = None;
                Ok(None)
            }
        }
    }
}

///
/// CursorHandle
///

struct CursorHandle(Rc<MemoryCursor>);

impl Cursor for CursorHandle {
    fn advance(&self) -> Rc<dyn Request<Option<CursorRow>>> {
        let request = MemoryRequest::new();
        let (cursor, req) = (self.0.clone(), request.clone());
        MemoryTransaction::run_op(&self.0.tx, Box::new(move |err| {
            if let Some(err) = err {
                req.resolve(Err(err));
                return;
            }
            req.resolve(MemoryCursor::step(&cursor));
        }));
        request
    }

    fn update(&self, value: Value) -> Rc<dyn Request<()>> {
        let request = MemoryRequest::new();
        let (cursor, req) = (self.0.clone(), request.clone());
        MemoryTransaction::run_op(&self.0.tx, Box::new(move |err| {
            if let Some(err) = err {
                req.resolve(Err(err));
                return;
            }
            let current = cursor.current.borrow().clone();
            let result = match current {
                None => Err(store_err("cursor has no current row")),
                Some(primary) => cursor.tx.with_store_mut(&cursor.store, |store| {
                    let (key, value) = prepare_value_key(store, value)?;
                    if key != primary {
                        return Err(store_err("cursor update must not change the row key"));
                    }
                    store.put_row(key, value, false)
                }),
            };
            req.resolve(result);
        }));
        request
    }

    fn delete(&self) -> Rc<dyn Request<()>> {
        let request = MemoryRequest::new();
        let (cursor, req) = (self.0.clone(), request.clone());
        MemoryTransaction::run_op(&self.0.tx, Box::new(move |err| {
            if let Some(err) = err {
                req.resolve(Err(err));
                return;
            }
            let current = cursor.current.borrow().clone();
            let result = match current {
                None => Err(store_err("cursor has no current row")),
                Some(primary) => cursor.tx.with_store_mut(&cursor.store, |store| {
                    store.remove_row(&primary);
                    Ok(())
                }),
            };
            req.resolve(result);
        }));
        request
    }
}

///
/// ConnectionState
///

struct ConnectionState {
    db: Rc<DbState>,
    version: u32,
    closed: Cell<bool>,
}

impl Connection for ConnectionState {
    fn name(&self) -> String {
        self.db.name.clone()
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn store_names(&self) -> Vec<String> {
        self.db.stores.borrow().keys().cloned().collect()
    }

    fn transaction(
        &self,
        scope: &[String],
        mode: TxMode,
        _durability: Durability,
    ) -> Result<Rc<dyn Transaction>, InternalError> {
        if self.closed.get() {
            return Err(store_err("connection is closed"));
        }
        let tx = MemoryTransaction::begin(&self.db, scope.to_vec(), mode)?;
        Ok(Rc::new(TxHandle(tx)))
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        DbState::process_waiting(&self.db);
    }

    fn is_closed(&self) -> bool {
        self.closed.get()
    }
}

///
/// UpgradeState
///

struct UpgradeState {
    tx: Rc<MemoryTransaction>,
}

impl UpgradeState {
    fn with_active_working<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, StoreState>) -> Result<R, InternalError>,
    ) -> Result<R, InternalError> {
        let mut inner = self.tx.inner.borrow_mut();
        if !matches!(inner.phase, TxPhase::Active) {
            return Err(store_err("upgrade transaction is finished"));
        }
        f(&mut inner.working)
    }
}

impl UpgradeHandle for UpgradeState {
    fn create_object_store(&self, name: &str, spec: StoreSpec) -> Result<(), InternalError> {
        self.with_active_working(|working| {
            if working.contains_key(name) {
                return Err(store_err(format!("object store '{name}' already exists")));
            }
            working.insert(name.to_string(), StoreState::new(spec));
            Ok(())
        })
    }

    fn delete_object_store(&self, name: &str) -> Result<(), InternalError> {
        self.with_active_working(|working| {
            working
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| store_err(format!("unknown object store '{name}'")))
        })
    }

    fn create_index(&self, store: &str, name: &str, spec: IndexSpec) -> Result<(), InternalError> {
        self.with_active_working(|working| {
            let Some(store_state) = working.get_mut(store) else {
                return Err(store_err(format!("unknown object store '{store}'")));
            };
            if store_state.indexes.contains_key(name) {
                return Err(store_err(format!(
                    "index '{name}' already exists on store '{store}'"
                )));
            }
            let mut index = IndexState {
                spec,
                entries: BTreeSet::new(),
            };
            for (primary, value) in &store_state.rows {
                for index_key in index_keys(&index.spec, value) {
                    index.entries.insert((index_key, primary.clone()));
                }
            }
            store_state.indexes.insert(name.to_string(), index);
            Ok(())
        })
    }

    fn store_names(&self) -> Vec<String> {
        self.tx.inner.borrow().working.keys().cloned().collect()
    }

    fn transaction(&self) -> Rc<dyn Transaction> {
        Rc::new(TxHandle(self.tx.clone()))
    }
}

///
/// OpenState
///

struct OpenState {
    db: Rc<DbState>,
    requested: u32,
    queue: RefCell<VecDeque<OpenEvent>>,
    listener: RefCell<Option<Box<dyn FnMut(OpenEvent)>>>,
    upgrade: RefCell<Option<Rc<UpgradeState>>>,
    connection: RefCell<Option<Rc<ConnectionState>>>,
}

impl OpenState {
    fn new(db: Rc<DbState>, requested: u32) -> Self {
        Self {
            db,
            requested,
            queue: RefCell::new(VecDeque::new()),
            listener: RefCell::new(None),
            upgrade: RefCell::new(None),
            connection: RefCell::new(None),
        }
    }

    fn start(open: &Rc<Self>) {
        let current = open.db.version.get();
        if open.requested > current && open.db.live_connection_count() > 0 {
            open.emit(OpenEvent::Blocked {
                current_version: current,
            });
            open.db.waiting_opens.borrow_mut().push_back(open.clone());
            return;
        }
        Self::proceed(open);
    }

    fn proceed(open: &Rc<Self>) {
        let current = open.db.version.get();
        if open.requested < current {
            Self::fail(
                open,
                store_err(format!(
                    "requested version {} is below the current version {current}",
                    open.requested
                )),
            );
        } else if open.requested == current {
            open.attach_connection();
            open.emit(OpenEvent::Success);
        } else {
            Self::begin_upgrade(open);
        }
    }

    fn begin_upgrade(open: &Rc<Self>) {
        let old_version = open.db.version.get();
        let scope: Vec<String> = open.db.stores.borrow().keys().cloned().collect();
        let working = open.db.stores.borrow().clone();
        let tx = Rc::new(MemoryTransaction {
            db: open.db.clone(),
            mode: TxMode::ReadWrite,
            scope: scope.clone(),
            version_change: true,
            upgrade_open: RefCell::new(Some(open.clone())),
            inner: RefCell::new(TxInner {
                phase: TxPhase::Active,
                working,
            }),
        });
        open.db.locks.borrow_mut().acquire(&scope, TxMode::ReadWrite);
        *open.upgrade.borrow_mut() = Some(Rc::new(UpgradeState { tx }));
        open.emit(OpenEvent::UpgradeNeeded {
            old_version,
            new_version: open.requested,
        });
    }

    fn finish_upgrade(open: &Rc<Self>) {
        open.db.version.set(open.requested);
        *open.upgrade.borrow_mut() = None;
        open.attach_connection();
        open.emit(OpenEvent::Success);
    }

    fn fail(open: &Rc<Self>, err: InternalError) {
        *open.upgrade.borrow_mut() = None;
        open.emit(OpenEvent::Failed(err));
        DbState::process_waiting(&open.db);
    }

    fn attach_connection(&self) {
        let conn = Rc::new(ConnectionState {
            db: self.db.clone(),
            version: self.db.version.get(),
            closed: Cell::new(false),
        });
        self.db.connections.borrow_mut().push(Rc::downgrade(&conn));
        *self.connection.borrow_mut() = Some(conn);
    }

    fn emit(&self, event: OpenEvent) {
        self.queue.borrow_mut().push_back(event);
        self.flush();
    }

    fn flush(&self) {
        loop {
            let Some(mut cb) = self.listener.borrow_mut().take() else {
                return;
            };
            let event = self.queue.borrow_mut().pop_front();
            match event {
                Some(event) => {
                    cb(event);
                    let mut slot = self.listener.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(cb);
                    }
                }
                None => {
                    *self.listener.borrow_mut() = Some(cb);
                    return;
                }
            }
        }
    }
}

impl OpenRequest for OpenState {
    fn subscribe(&self, cb: Box<dyn FnMut(OpenEvent)>) {
        *self.listener.borrow_mut() = Some(cb);
        self.flush();
    }

    fn upgrade(&self) -> Result<Rc<dyn UpgradeHandle>, InternalError> {
        self.upgrade
            .borrow()
            .clone()
            .map(|state| state as Rc<dyn UpgradeHandle>)
            .ok_or_else(|| store_err("no upgrade is in progress"))
    }

    fn connection(&self) -> Result<Rc<dyn Connection>, InternalError> {
        self.connection
            .borrow()
            .clone()
            .map(|conn| conn as Rc<dyn Connection>)
            .ok_or_else(|| store_err("the open has not succeeded yet"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{adapter, record, task::TaskContext};

    fn open_store(name: &str) -> Rc<dyn Connection> {
        MemoryBackend::reset(name);
        let open = MemoryBackend.open(name, 1);
        let upgrade = open.upgrade().expect("first open must enter upgrade");
        upgrade
            .create_object_store(
                "rows",
                StoreSpec {
                    key_path: vec!["id".to_string()],
                    auto_increment: true,
                },
            )
            .unwrap();
        upgrade
            .create_index(
                "rows",
                "byTag",
                IndexSpec {
                    key_path: vec!["tag".to_string()],
                    unique: false,
                    multi_entry: false,
                },
            )
            .unwrap();
        futures::executor::block_on(adapter::request(upgrade.transaction().commit())).unwrap();
        open.connection().expect("open must have succeeded")
    }

    #[tokio::test]
    async fn put_get_and_key_generation() {
        let conn = open_store("mem_put_get");
        let tx = conn
            .transaction(&["rows".to_string()], TxMode::ReadWrite, Durability::Default)
            .unwrap();
        let store = tx.object_store("rows").unwrap();

        let key = adapter::request(store.add(record! { "tag" => "a" }.into_value()))
            .await
            .unwrap();
        assert_eq!(key.as_value(), &Value::Uint(1));

        let row = adapter::request(store.get(&key)).await.unwrap().unwrap();
        let Value::Map(map) = &row else {
            panic!("rows are maps");
        };
        assert_eq!(map.get("id"), Some(&Value::Uint(1)));

        adapter::request(tx.commit()).await.unwrap();
        assert!(tx.is_finished());
    }

    #[tokio::test]
    async fn aborted_transactions_leave_no_trace() {
        let conn = open_store("mem_abort");
        let scope = ["rows".to_string()];

        let tx = conn
            .transaction(&scope, TxMode::ReadWrite, Durability::Default)
            .unwrap();
        let store = tx.object_store("rows").unwrap();
        adapter::request(store.add(record! { "tag" => "a" }.into_value()))
            .await
            .unwrap();
        tx.abort();

        let tx = conn
            .transaction(&scope, TxMode::ReadOnly, Durability::Default)
            .unwrap();
        let store = tx.object_store("rows").unwrap();
        assert_eq!(adapter::request(store.count(None)).await.unwrap(), 0);
        adapter::request(tx.commit()).await.unwrap();
    }

    #[tokio::test]
    async fn waiting_transactions_run_after_the_holder_commits() {
        let conn = open_store("mem_locks");
        let scope = ["rows".to_string()];

        let first = conn
            .transaction(&scope, TxMode::ReadWrite, Durability::Default)
            .unwrap();
        let second = conn
            .transaction(&scope, TxMode::ReadWrite, Durability::Default)
            .unwrap();

        let first_store = first.object_store("rows").unwrap();
        adapter::request(first_store.add(record! { "tag" => "a" }.into_value()))
            .await
            .unwrap();

        // The second transaction's request is queued until the first
        // releases its exclusive locks.
        let second_store = second.object_store("rows").unwrap();
        let queued = second_store.add(record! { "tag" => "b" }.into_value());

        adapter::request(first.commit()).await.unwrap();
        let key = adapter::request(queued).await.unwrap();
        assert_eq!(key.as_value(), &Value::Uint(2));
        adapter::request(second.commit()).await.unwrap();
    }

    #[tokio::test]
    async fn unique_indexes_reject_conflicting_rows() {
        let name = "mem_unique";
        MemoryBackend::reset(name);
        let open = MemoryBackend.open(name, 1);
        let upgrade = open.upgrade().unwrap();
        upgrade
            .create_object_store(
                "rows",
                StoreSpec {
                    key_path: vec!["id".to_string()],
                    auto_increment: true,
                },
            )
            .unwrap();
        upgrade
            .create_index(
                "rows",
                "byTag",
                IndexSpec {
                    key_path: vec!["tag".to_string()],
                    unique: true,
                    multi_entry: false,
                },
            )
            .unwrap();
        adapter::request(upgrade.transaction().commit()).await.unwrap();
        let conn = open.connection().unwrap();

        let tx = conn
            .transaction(&["rows".to_string()], TxMode::ReadWrite, Durability::Default)
            .unwrap();
        let store = tx.object_store("rows").unwrap();
        adapter::request(store.add(record! { "tag" => "same" }.into_value()))
            .await
            .unwrap();
        let err = adapter::request(store.add(record! { "tag" => "same" }.into_value()))
            .await
            .unwrap_err();
        assert!(err.message.contains("unique index 'byTag'"));
    }

    #[tokio::test]
    async fn index_cursors_walk_in_index_order() {
        let conn = open_store("mem_index_cursor");
        let tx = conn
            .transaction(&["rows".to_string()], TxMode::ReadWrite, Durability::Default)
            .unwrap();
        let store = tx.object_store("rows").unwrap();
        for tag in ["m", "a", "z"] {
            adapter::request(store.add(record! { "tag" => tag }.into_value()))
                .await
                .unwrap();
        }

        let cursor = store.index("byTag").unwrap().open_cursor(None, Direction::Next);
        let mut walk = adapter::CursorWalk::new(cursor);
        let mut tags = Vec::new();
        while let Some(row) = walk.next().await.unwrap() {
            tags.push(row.row.key.clone());
        }
        let expect = |s: &str| Key::try_from_value(Value::Text(s.to_string())).unwrap();
        assert_eq!(tags, vec![expect("a"), expect("m"), expect("z")]);

        assert!(store.index("missing").is_err());
        adapter::request(tx.commit()).await.unwrap();
    }

    #[tokio::test]
    async fn task_contexts_fire_post_commit_hooks_in_order() {
        let conn = open_store("mem_task");
        let scope = ["rows".to_string()];
        let tx = conn
            .transaction(&scope, TxMode::ReadWrite, Durability::Default)
            .unwrap();

        let order = Rc::new(RefCell::new(Vec::new()));
        let ctx = TaskContext::new(tx);
        let log = order.clone();
        ctx.clone()
            .run(move |ctx| async move {
                let store = ctx.object_store("rows")?;
                adapter::request(store.add(record! { "tag" => "a" }.into_value())).await?;
                let first = log.clone();
                ctx.on_did_commit(move || first.borrow_mut().push(1));
                let second = log.clone();
                ctx.on_did_commit(move || second.borrow_mut().push(2));
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(*order.borrow(), vec![1, 2]);
    }
}
