//! Observability state: counters aggregated from sink events.
//!
//! Engine logic MUST NOT touch this module directly; all instrumentation
//! flows through `obs::sink`.

pub mod sink;

use std::{cell::RefCell, collections::BTreeMap};

thread_local! {
    static STATE: RefCell<MetricsState> = RefCell::new(MetricsState::default());
}

///
/// MetricsState
///

#[derive(Clone, Debug, Default)]
pub struct MetricsState {
    pub tasks_started: u64,
    pub tasks_committed: u64,
    pub tasks_aborted: u64,
    pub post_commit_hooks: u64,
    pub rows_scanned: u64,
    pub fk_checks: u64,
    pub fk_blocked: u64,
    pub events_emitted: u64,
    pub listener_faults: u64,
    pub selector_refreshes: u64,
    pub tab_relays: u64,
    pub collections: BTreeMap<String, CollectionMetrics>,
}

///
/// CollectionMetrics
///

#[derive(Clone, Debug, Default)]
pub struct CollectionMetrics {
    pub rows_scanned: u64,
    pub fk_checks: u64,
    pub fk_blocked: u64,
    pub events_emitted: u64,
    pub listener_faults: u64,
}

pub(crate) fn with_state_mut<R>(f: impl FnOnce(&mut MetricsState) -> R) -> R {
    STATE.with_borrow_mut(f)
}

/// Snapshot the current metrics state for endpoint/test plumbing.
#[must_use]
pub fn report() -> MetricsState {
    STATE.with_borrow(Clone::clone)
}

/// Reset all metrics state.
pub fn reset() {
    STATE.with_borrow_mut(|state| *state = MetricsState::default());
}
