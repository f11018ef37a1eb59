//! Module: capability
//! Responsibility: the store capability contract the engine consumes.
//! Does not own: promise/stream adaptation (adapter) or scan patterns (cursor).
//! Boundary: everything below this seam is a page-local store detail; the
//! engine never reaches past these traits.

pub mod memory;

use crate::{
    error::InternalError,
    key::{Key, KeyRange},
    value::Value,
};
use std::rc::Rc;

///
/// RequestSubscriber
/// Completion callback for one capability request.
///

pub type RequestSubscriber<T> = Box<dyn FnOnce(Result<T, InternalError>)>;

///
/// Request
/// A callback-style in-flight store operation. `subscribe` is called at
/// most once and fires immediately when the request already settled.
///

pub trait Request<T> {
    fn subscribe(&self, cb: RequestSubscriber<T>);
}

///
/// TxMode
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

impl TxMode {
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::ReadWrite)
    }
}

///
/// Durability
/// Commit durability hint; the reference backend treats all three alike.
///

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Durability {
    #[default]
    Default,
    Relaxed,
    Strict,
}

///
/// Direction
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Next,
    Prev,
}

///
/// StoreSpec
/// Creation-time shape of one object store: in-line key path (single
/// field or tuple) and the auto-increment flag.
///

#[derive(Clone, Debug)]
pub struct StoreSpec {
    pub key_path: Vec<String>,
    pub auto_increment: bool,
}

///
/// IndexSpec
///

#[derive(Clone, Debug)]
pub struct IndexSpec {
    pub key_path: Vec<String>,
    pub unique: bool,
    pub multi_entry: bool,
}

///
/// OpenEvent
/// Lifecycle notifications for one open handshake, in the order the
/// capability delivers them: zero or more `Blocked`, then optionally
/// `UpgradeNeeded`, then `Success` or `Failed`.
///

#[derive(Clone, Debug)]
pub enum OpenEvent {
    Blocked { current_version: u32 },
    UpgradeNeeded { old_version: u32, new_version: u32 },
    Success,
    Failed(InternalError),
}

///
/// OpenRequest
///

pub trait OpenRequest {
    /// Register the event listener; queued events are replayed through it.
    fn subscribe(&self, cb: Box<dyn FnMut(OpenEvent)>);

    /// The upgrade surface. Valid between `UpgradeNeeded` and `Success`.
    fn upgrade(&self) -> Result<Rc<dyn UpgradeHandle>, InternalError>;

    /// The opened connection. Valid after `Success`.
    fn connection(&self) -> Result<Rc<dyn Connection>, InternalError>;
}

///
/// UpgradeHandle
/// Store/index DDL plus the version-change transaction. Only available
/// while the upgrade transaction is live.
///

pub trait UpgradeHandle {
    fn create_object_store(&self, name: &str, spec: StoreSpec) -> Result<(), InternalError>;
    fn delete_object_store(&self, name: &str) -> Result<(), InternalError>;
    fn create_index(&self, store: &str, name: &str, spec: IndexSpec) -> Result<(), InternalError>;
    fn store_names(&self) -> Vec<String>;
    fn transaction(&self) -> Rc<dyn Transaction>;
}

///
/// StoreBackend
/// Entry point of the capability: open a named database at a version.
///

pub trait StoreBackend {
    fn open(&self, name: &str, version: u32) -> Rc<dyn OpenRequest>;
}

///
/// Connection
///

pub trait Connection {
    fn name(&self) -> String;
    fn version(&self) -> u32;
    fn store_names(&self) -> Vec<String>;
    fn transaction(
        &self,
        scope: &[String],
        mode: TxMode,
        durability: Durability,
    ) -> Result<Rc<dyn Transaction>, InternalError>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

///
/// Transaction
/// A live store transaction. `commit` resolves once the transaction has
/// durably completed; `abort` discards every staged mutation.
///

pub trait Transaction {
    fn mode(&self) -> TxMode;
    fn object_store(&self, name: &str) -> Result<Rc<dyn ObjectStore>, InternalError>;
    fn commit(&self) -> Rc<dyn Request<()>>;
    fn abort(&self);
    fn is_finished(&self) -> bool;
}

///
/// ObjectStore
/// Keys are in-line: `add`/`put` read (or generate) the key from the
/// value via the store's key path and resolve with it.
///

pub trait ObjectStore {
    fn name(&self) -> String;
    fn add(&self, value: Value) -> Rc<dyn Request<Key>>;
    fn put(&self, value: Value) -> Rc<dyn Request<Key>>;
    fn get(&self, key: &Key) -> Rc<dyn Request<Option<Value>>>;
    fn get_key(&self, range: &KeyRange) -> Rc<dyn Request<Option<Key>>>;
    fn delete(&self, key: &Key) -> Rc<dyn Request<()>>;
    fn clear(&self) -> Rc<dyn Request<()>>;
    fn count(&self, range: Option<&KeyRange>) -> Rc<dyn Request<u64>>;
    fn get_all(&self, range: Option<&KeyRange>, limit: Option<usize>)
    -> Rc<dyn Request<Vec<Value>>>;
    fn index(&self, name: &str) -> Result<Rc<dyn IndexHandle>, InternalError>;
    fn open_cursor(&self, range: Option<&KeyRange>, direction: Direction) -> Rc<dyn Cursor>;
}

///
/// IndexHandle
///

pub trait IndexHandle {
    fn name(&self) -> String;
    fn open_cursor(&self, range: Option<&KeyRange>, direction: Direction) -> Rc<dyn Cursor>;
}

///
/// CursorRow
/// One yielded cursor position. For store cursors `key` equals
/// `primary_key`; for index cursors `key` is the index key.
///

#[derive(Clone, Debug)]
pub struct CursorRow {
    pub key: Key,
    pub primary_key: Key,
    pub value: Value,
}

///
/// Cursor
/// Stepwise traversal. `advance` resolves the next row or `None` at
/// exhaustion; `update`/`delete` act on the most recently yielded row.
///

pub trait Cursor {
    fn advance(&self) -> Rc<dyn Request<Option<CursorRow>>>;
    fn update(&self, value: Value) -> Rc<dyn Request<()>>;
    fn delete(&self) -> Rc<dyn Request<()>>;
}
