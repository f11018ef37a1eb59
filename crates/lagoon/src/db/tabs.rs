//! Module: db::tabs
//! Responsibility: the broadcast channel between engine instances
//! ("tabs") sharing one named store, and the message handlers for the
//! version-upgrade handshake and post-commit event relaying.
//! Does not own: event emission; relayed events re-enter through the
//! collection's own emitter with the relaying flag held.

use crate::db::{DbShared, OpenPhase, events::EventKind};
use lagoon_core::{
    obs::sink::{self, MetricsEvent},
    value::Value,
};
use serde::{Deserialize, Serialize};
use std::{cell::RefCell, collections::HashMap, rc::Rc, str::FromStr};

///
/// TabMessage
/// Wire messages on the broadcast channel. Relay payloads are wire
/// values: the sender's write hook has already been applied, and the
/// receiver runs its read hook, so opaque value types round-trip.
///

#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum TabMessage {
    CloseForUpgrade {
        new_version: u32,
    },
    Reinit,
    Relay {
        collection: String,
        event: String,
        wire: Option<Value>,
    },
}

type Handler = Rc<dyn Fn(&TabMessage)>;

#[derive(Default)]
struct BusInner {
    next_id: u64,
    channels: HashMap<String, Vec<(u64, Handler)>>,
}

///
/// TabBus
/// In-process broadcast bus keyed by database name. Every engine
/// instance opened against the same bus and name behaves as one tab
/// among many; messages are delivered to every member but the sender.
///

#[derive(Clone, Default)]
pub struct TabBus {
    inner: Rc<RefCell<BusInner>>,
}

impl TabBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn join(&self, channel: &str, handler: Handler) -> TabMembership {
        let id = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.next_id;
            inner.next_id += 1;
            inner
                .channels
                .entry(channel.to_string())
                .or_default()
                .push((id, handler));
            id
        };
        TabMembership {
            bus: self.clone(),
            channel: channel.to_string(),
            id,
        }
    }

    fn post(&self, channel: &str, sender: u64, message: &TabMessage) {
        let others: Vec<Handler> = {
            let inner = self.inner.borrow();
            inner
                .channels
                .get(channel)
                .map(|members| {
                    members
                        .iter()
                        .filter(|(id, _)| *id != sender)
                        .map(|(_, handler)| handler.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        for handler in others {
            handler(message);
        }
    }

    fn leave(&self, channel: &str, id: u64) {
        let mut inner = self.inner.borrow_mut();
        if let Some(members) = inner.channels.get_mut(channel) {
            members.retain(|(member_id, _)| *member_id != id);
        }
    }
}

///
/// TabMembership
///

pub(crate) struct TabMembership {
    bus: TabBus,
    channel: String,
    id: u64,
}

impl TabMembership {
    pub fn post(&self, message: &TabMessage) {
        self.bus.post(&self.channel, self.id, message);
    }
}

impl Drop for TabMembership {
    fn drop(&mut self) {
        self.bus.leave(&self.channel, self.id);
    }
}

/// Entry point for every broadcast message this database receives.
pub(crate) fn handle_message(db: &Rc<DbShared>, message: &TabMessage) {
    match message {
        TabMessage::CloseForUpgrade { new_version } => on_close_for_upgrade(db, *new_version),
        TabMessage::Reinit => on_reinit(db),
        TabMessage::Relay {
            collection,
            event,
            wire,
        } => on_relay(db, collection, event, wire.clone()),
    }
}

/// A newer tab wants to upgrade: close our connection and remember the
/// version it is moving to.
fn on_close_for_upgrade(db: &Rc<DbShared>, new_version: u32) {
    if db.version.get() >= new_version {
        return;
    }
    if db.latest_known.get() < new_version {
        db.latest_known.set(new_version);
    }
    let mut phase = db.open_phase.borrow_mut();
    if let OpenPhase::Open(conn) = &*phase {
        conn.close();
        *phase = OpenPhase::Closed;
    }
}

/// The upgrading tab finished: run the reinit hook and adopt the new
/// version; the next operation reopens the connection.
fn on_reinit(db: &Rc<DbShared>) {
    let old_version = db.version.get();
    let new_version = db.latest_known.get();
    if old_version >= new_version {
        return;
    }
    if let Some(hook) = &db.hooks.on_before_reinit {
        hook(old_version, new_version);
    }
    db.version.set(new_version);
    let mut phase = db.open_phase.borrow_mut();
    if let OpenPhase::Open(conn) = &*phase {
        conn.close();
        *phase = OpenPhase::Closed;
    }
}

/// A sibling tab committed a mutation: replay the event locally with
/// the relaying flag held so it is not re-broadcast.
fn on_relay(db: &Rc<DbShared>, collection: &str, event: &str, wire: Option<Value>) {
    let Some(core) = db.collection_core(collection) else {
        return;
    };
    let kind = match EventKind::from_str(event) {
        Ok(kind) => kind,
        Err(err) => {
            db.report_error(&err.into());
            return;
        }
    };
    let payload = match wire {
        Some(wire) => match (core.descriptor.serialization.read)(wire) {
            Ok(record) => Some(record),
            Err(err) => {
                db.report_error(&err);
                return;
            }
        },
        None => None,
    };

    sink::record(&MetricsEvent::TabRelay {
        database: db.name.clone(),
    });

    core.relaying.set(true);
    core.events.emit(kind, payload.as_ref(), &|message| {
        db.report_listener_fault(collection, message);
    });
    core.relaying.set(false);
}
