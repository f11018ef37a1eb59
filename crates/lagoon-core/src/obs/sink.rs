//! Metrics sink boundary.
//!
//! Core engine logic MUST NOT depend on obs state directly.
//! All instrumentation flows through MetricsEvent and MetricsSink.
//!
//! This module is the only allowed bridge between execution logic
//! and the thread-local metrics state.

use crate::obs::{self, CollectionMetrics};
use std::{cell::RefCell, rc::Rc};

thread_local! {
    static SINK_OVERRIDE: RefCell<Option<Rc<dyn MetricsSink>>> = const { RefCell::new(None) };
}

///
/// MetricsEvent
///

#[derive(Clone, Debug)]
pub enum MetricsEvent {
    TaskStarted { write: bool },
    TaskCommitted { post_commit_hooks: u64 },
    TaskAborted,
    RowsScanned { collection: String, rows: u64 },
    FkUpstreamCheck { collection: String },
    FkDeleteBlocked { collection: String },
    EventEmitted { collection: String },
    ListenerFault { collection: String },
    SelectorRefresh { selector: String },
    TabRelay { database: String },
}

///
/// MetricsSink
///

pub trait MetricsSink {
    fn record(&self, event: &MetricsEvent);
}

///
/// NoopMetricsSink
///

pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record(&self, _: &MetricsEvent) {}
}

///
/// GlobalMetricsSink
///

pub struct GlobalMetricsSink;

impl GlobalMetricsSink {
    fn collection_entry<'a>(
        state: &'a mut obs::MetricsState,
        collection: &str,
    ) -> &'a mut CollectionMetrics {
        state.collections.entry(collection.to_string()).or_default()
    }
}

impl MetricsSink for GlobalMetricsSink {
    fn record(&self, event: &MetricsEvent) {
        obs::with_state_mut(|state| match event {
            MetricsEvent::TaskStarted { .. } => {
                state.tasks_started = state.tasks_started.saturating_add(1);
            }
            MetricsEvent::TaskCommitted { post_commit_hooks } => {
                state.tasks_committed = state.tasks_committed.saturating_add(1);
                state.post_commit_hooks =
                    state.post_commit_hooks.saturating_add(*post_commit_hooks);
            }
            MetricsEvent::TaskAborted => {
                state.tasks_aborted = state.tasks_aborted.saturating_add(1);
            }
            MetricsEvent::RowsScanned { collection, rows } => {
                state.rows_scanned = state.rows_scanned.saturating_add(*rows);
                let entry = Self::collection_entry(state, collection);
                entry.rows_scanned = entry.rows_scanned.saturating_add(*rows);
            }
            MetricsEvent::FkUpstreamCheck { collection } => {
                state.fk_checks = state.fk_checks.saturating_add(1);
                let entry = Self::collection_entry(state, collection);
                entry.fk_checks = entry.fk_checks.saturating_add(1);
            }
            MetricsEvent::FkDeleteBlocked { collection } => {
                state.fk_blocked = state.fk_blocked.saturating_add(1);
                let entry = Self::collection_entry(state, collection);
                entry.fk_blocked = entry.fk_blocked.saturating_add(1);
            }
            MetricsEvent::EventEmitted { collection } => {
                state.events_emitted = state.events_emitted.saturating_add(1);
                let entry = Self::collection_entry(state, collection);
                entry.events_emitted = entry.events_emitted.saturating_add(1);
            }
            MetricsEvent::ListenerFault { collection } => {
                state.listener_faults = state.listener_faults.saturating_add(1);
                let entry = Self::collection_entry(state, collection);
                entry.listener_faults = entry.listener_faults.saturating_add(1);
            }
            MetricsEvent::SelectorRefresh { .. } => {
                state.selector_refreshes = state.selector_refreshes.saturating_add(1);
            }
            MetricsEvent::TabRelay { .. } => {
                state.tab_relays = state.tab_relays.saturating_add(1);
            }
        });
    }
}

pub const GLOBAL_METRICS_SINK: GlobalMetricsSink = GlobalMetricsSink;

pub fn record(event: &MetricsEvent) {
    let sink = SINK_OVERRIDE.with(|cell| cell.borrow().clone());
    if let Some(sink) = sink {
        sink.record(event);
    } else {
        GLOBAL_METRICS_SINK.record(event);
    }
}

/// Run a closure with a temporary metrics sink override.
pub fn with_metrics_sink<T>(sink: Rc<dyn MetricsSink>, f: impl FnOnce() -> T) -> T {
    struct Guard(Option<Rc<dyn MetricsSink>>);

    impl Drop for Guard {
        fn drop(&mut self) {
            SINK_OVERRIDE.with(|cell| {
                *cell.borrow_mut() = self.0.take();
            });
        }
    }

    let prev = SINK_OVERRIDE.with(|cell| cell.borrow_mut().replace(sink));
    let _guard = Guard(prev);

    f()
}
