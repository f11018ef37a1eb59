//! # lagoon
//!
//! `lagoon` is the public facade crate for the lagoon runtime: a
//! schema-driven, relation-aware data-access layer over a page-local
//! object store.
//!
//! It exposes:
//! - declarative schema configuration (collections, indexes, foreign
//!   keys, relations, field shapes),
//! - per-collection facades with typed async CRUD, eager relation
//!   loading, events and active records,
//! - multi-collection transactions with an ambient task context,
//! - memoized reactive selectors with dependency-precise invalidation,
//! - cross-tab coordination over a broadcast bus,
//! - and the declarative key-range DSL (`range!`).
//!
//! Engine internals (value model, store capability, task contexts,
//! cursor patterns) live in `lagoon-core`.

pub mod db;
pub mod error;
pub mod range;
pub mod schema;

pub use db::{
    Database, DatabaseConfig, TransactionScope, UpgradeContext,
    active::ActiveRecord,
    events::{EventKind, ListenerId},
    facade::{Collection, IndexRangeOptions, IterateOptions, QueryOptions},
    relation::{WithEdge, WithSpec},
    selector::{Selector, SelectorCtx, Subscription},
    tabs::TabBus,
};
pub use error::{Error, ErrorKind};

// Core re-exports so downstream code rarely needs `lagoon-core` directly.
pub use lagoon_core::{
    Key, KeyRange,
    capability::{Direction, StoreBackend, TxMode, memory::MemoryBackend},
    record,
    value::{Record, Value},
};

/// Workspace version re-export for downstream tooling/tests.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

///
/// Prelude
/// using _ brings traits into scope and avoids name conflicts
///

pub mod prelude {
    pub use crate::{
        Collection, Database, DatabaseConfig, EventKind, IterateOptions, MemoryBackend,
        QueryOptions, Record, TabBus, Value, WithEdge, WithSpec, range, record,
        schema::{
            CollectionDescriptor, ForeignKeyDescriptor, IndexDescriptor, OnDelete,
            RelationDescriptor, RelationKind, Schema,
        },
    };
}
