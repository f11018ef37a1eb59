//! # lagoon-core
//!
//! Engine kernel for the lagoon data-access runtime.
//!
//! This crate owns the pieces below the schema layer:
//! - `value` / `key`
//!   The canonical value model, store keys and typed key ranges.
//!
//! - `capability`
//!   The store capability contract the engine consumes, plus the
//!   in-memory reference backend used for tests and embedding.
//!
//! - `adapter`
//!   Promise/async-sequence view over callback-style requests.
//!
//! - `task`
//!   The per-transaction scratchpad (pre/post-commit hooks, abort flag,
//!   observed-collection tracking).
//!
//! - `cursor`
//!   Shared serial-scan patterns (predicate find/delete, first-by-direction).
//!
//! - `obs`
//!   The metrics sink boundary; the only bridge between engine logic and
//!   observability state.
//!
//! Higher-level semantics (schema validation, foreign keys, relations,
//! selectors, tab coordination) live in the `lagoon` crate.

pub mod adapter;
pub mod capability;
pub mod cursor;
pub mod error;
pub mod key;
pub mod obs;
pub mod task;
pub mod value;

pub use error::{ErrorClass, ErrorOrigin, InternalError};
pub use key::{Key, KeyError, KeyRange};
pub use value::{Record, Value};
