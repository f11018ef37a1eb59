use crate::db::{events::EventKind, tabs::TabBus};
use lagoon_core::{capability::memory::MemoryBackend, record, value::Value};
use std::{cell::RefCell, rc::Rc};

use super::open_tab;

#[tokio::test]
async fn committed_events_relay_to_sibling_tabs() {
    MemoryBackend::reset("tabs_relay");
    let bus = TabBus::new();
    let first = open_tab("tabs_relay", &bus, 1);
    let second = open_tab("tabs_relay", &bus, 1);

    let relayed: Rc<RefCell<Vec<Value>>> = Rc::new(RefCell::new(Vec::new()));
    let log = relayed.clone();
    second
        .collection("users")
        .unwrap()
        .add_event_listener(EventKind::Write, move |payload| {
            let name = payload
                .map(|record| record.field_or_null("name"))
                .unwrap_or(Value::Null);
            log.borrow_mut().push(name);
        });

    first
        .collection("users")
        .unwrap()
        .create(record! { "name" => "ada" })
        .await
        .unwrap();

    assert_eq!(*relayed.borrow(), vec![Value::from("ada")]);

    // Both tabs read one shared store.
    assert_eq!(
        second.collection("users").unwrap().count().await.unwrap(),
        1
    );
}

#[tokio::test]
async fn relayed_events_are_not_rebroadcast() {
    MemoryBackend::reset("tabs_echo");
    let bus = TabBus::new();
    let first = open_tab("tabs_echo", &bus, 1);
    let second = open_tab("tabs_echo", &bus, 1);

    let first_hits = Rc::new(RefCell::new(0u32));
    let count = first_hits.clone();
    first
        .collection("users")
        .unwrap()
        .add_event_listener(EventKind::Write, move |_| *count.borrow_mut() += 1);

    let second_hits = Rc::new(RefCell::new(0u32));
    let count = second_hits.clone();
    second
        .collection("users")
        .unwrap()
        .add_event_listener(EventKind::Write, move |_| *count.borrow_mut() += 1);

    first
        .collection("users")
        .unwrap()
        .create(record! { "name" => "ada" })
        .await
        .unwrap();

    // One local emission, one relayed emission, no echo storm.
    assert_eq!(*first_hits.borrow(), 1);
    assert_eq!(*second_hits.borrow(), 1);
}

#[tokio::test]
async fn relaying_can_be_disabled_per_database() {
    MemoryBackend::reset("tabs_no_relay");
    let bus = TabBus::new();

    let config = crate::DatabaseConfig::new(super::fixture_schema(), 1).relay_events(false);
    let first = crate::Database::open("tabs_no_relay", config, MemoryBackend::new(), &bus).unwrap();
    let second = open_tab("tabs_no_relay", &bus, 1);

    let hits = Rc::new(RefCell::new(0u32));
    let count = hits.clone();
    second
        .collection("users")
        .unwrap()
        .add_event_listener(EventKind::Write, move |_| *count.borrow_mut() += 1);

    first
        .collection("users")
        .unwrap()
        .create(record! { "name" => "ada" })
        .await
        .unwrap();

    assert_eq!(*hits.borrow(), 0);
}

#[test]
fn tab_messages_survive_the_wire() {
    let message = crate::db::tabs::TabMessage::Relay {
        collection: "users".to_string(),
        event: "write|delete".to_string(),
        wire: Some(Value::Map(
            [("id".to_string(), Value::Uint(1))].into_iter().collect(),
        )),
    };

    let encoded = serde_json::to_string(&message).unwrap();
    let decoded: crate::db::tabs::TabMessage = serde_json::from_str(&encoded).unwrap();
    let crate::db::tabs::TabMessage::Relay { collection, event, wire } = decoded else {
        panic!("relay must decode as relay");
    };
    assert_eq!(collection, "users");
    assert_eq!(event, "write|delete");
    assert!(wire.is_some());
}

#[tokio::test]
async fn version_upgrade_handshake_closes_and_reinits_older_tabs() {
    MemoryBackend::reset("tabs_upgrade");
    let bus = TabBus::new();

    let old_tab = open_tab("tabs_upgrade", &bus, 1);
    old_tab
        .collection("users")
        .unwrap()
        .create(record! { "name" => "ada" })
        .await
        .unwrap();
    assert_eq!(old_tab.version(), 1);

    let reinits: Rc<RefCell<Vec<(u32, u32)>>> = Rc::new(RefCell::new(Vec::new()));
    // The reinit hook has to be wired at open time; reopen the old tab
    // with it in place.
    drop(old_tab);
    let log = reinits.clone();
    let config = crate::DatabaseConfig::new(super::fixture_schema(), 1)
        .on_before_reinit(move |old, new| log.borrow_mut().push((old, new)));
    let old_tab =
        crate::Database::open("tabs_upgrade", config, MemoryBackend::new(), &bus).unwrap();
    // Open the store in this tab so the newer tab's open is blocked.
    assert_eq!(old_tab.collection("users").unwrap().count().await.unwrap(), 1);

    let new_tab = open_tab("tabs_upgrade", &bus, 2);
    // First use triggers open → blocked → close-for-upgrade → upgrade →
    // reinit, all over the bus.
    assert_eq!(new_tab.collection("users").unwrap().count().await.unwrap(), 1);

    assert_eq!(new_tab.version(), 2);
    assert_eq!(*reinits.borrow(), vec![(1, 2)]);
    assert_eq!(old_tab.version(), 2);

    // The old tab reopens lazily at the new version and still sees data.
    assert_eq!(old_tab.collection("users").unwrap().count().await.unwrap(), 1);
}
