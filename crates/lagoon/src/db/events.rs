//! Module: db::events
//! Responsibility: the per-collection event emitter.
//! Boundary: emission happens strictly after commit; callers queue
//! post-commit hooks that land here. Dispatch iterates a snapshot, so a
//! listener that removes itself mid-dispatch does not starve the rest.

use derive_more::Display;
use lagoon_core::{
    error::{ErrorClass, ErrorOrigin, InternalError},
    value::Record,
};
use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    panic::{AssertUnwindSafe, catch_unwind},
    rc::Rc,
    str::FromStr,
};

///
/// EventKind
/// `write` fires for create/update/upsert, `delete` for removals,
/// `write|delete` for either, and `clear` exactly once per truncation.
///

#[derive(Clone, Copy, Debug, Display, Eq, Ord, PartialEq, PartialOrd)]
pub enum EventKind {
    #[display("write")]
    Write,
    #[display("delete")]
    Delete,
    #[display("write|delete")]
    WriteDelete,
    #[display("clear")]
    Clear,
}

impl FromStr for EventKind {
    type Err = InternalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "write" => Ok(Self::Write),
            "delete" => Ok(Self::Delete),
            "write|delete" => Ok(Self::WriteDelete),
            "clear" => Ok(Self::Clear),
            other => Err(InternalError::new(
                ErrorClass::UnknownEvent,
                ErrorOrigin::Facade,
                format!("unknown event kind '{other}'"),
            )),
        }
    }
}

///
/// Listener
/// Invoked synchronously in registration order with the committed
/// record, or `None` for `clear`.
///

pub type Listener = Rc<dyn Fn(Option<&Record>)>;

///
/// ListenerId
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ListenerId(u64);

///
/// EventTarget
///

#[derive(Default)]
pub(crate) struct EventTarget {
    next_id: Cell<u64>,
    listeners: RefCell<BTreeMap<EventKind, Vec<(ListenerId, Listener)>>>,
}

impl EventTarget {
    pub fn add_listener(&self, kind: EventKind, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.listeners
            .borrow_mut()
            .entry(kind)
            .or_default()
            .push((id, listener));
        id
    }

    pub fn remove_listener(&self, kind: EventKind, id: ListenerId) {
        if let Some(list) = self.listeners.borrow_mut().get_mut(&kind) {
            list.retain(|(listener_id, _)| *listener_id != id);
        }
    }

    /// Dispatch over a snapshot. A faulting listener is reported through
    /// `fault` and never prevents the remaining listeners from running.
    pub fn emit(&self, kind: EventKind, payload: Option<&Record>, fault: &dyn Fn(String)) {
        let snapshot: Vec<Listener> = {
            let listeners = self.listeners.borrow();
            let mut snapshot: Vec<Listener> = listeners
                .get(&kind)
                .map(|list| list.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default();
            if matches!(kind, EventKind::Write | EventKind::Delete)
                && let Some(list) = listeners.get(&EventKind::WriteDelete)
            {
                snapshot.extend(list.iter().map(|(_, l)| l.clone()));
            }
            snapshot
        };

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(payload))).is_err() {
                fault(format!("event listener for '{kind}' panicked"));
            }
        }
    }
}
