use crate::{
    db::{
        events::EventKind,
        facade::{IndexRangeOptions, IterateOptions, QueryOptions},
    },
    range,
};
use futures::StreamExt;
use lagoon_core::{record, value::Value};
use std::{cell::RefCell, rc::Rc};

use super::open_fixture;

#[tokio::test]
async fn create_merges_generated_keys() {
    let db = open_fixture("facade_create");
    let users = db.collection("users").unwrap();

    let first = users.create(record! { "name" => "ada" }).await.unwrap();
    let second = users.create(record! { "name" => "grace" }).await.unwrap();

    assert_eq!(first.field_or_null("id"), Value::Uint(1));
    assert_eq!(second.field_or_null("id"), Value::Uint(2));
    assert_eq!(users.count().await.unwrap(), 2);
}

#[tokio::test]
async fn update_rejects_missing_rows() {
    let db = open_fixture("facade_update_missing");
    let users = db.collection("users").unwrap();

    let err = users
        .update(record! { "id" => 41u64, "name" => "nobody" })
        .await
        .unwrap_err();
    assert!(err.has_prefix("not-found"));
}

#[tokio::test]
async fn delete_of_absent_rows_returns_none() {
    let db = open_fixture("facade_delete_absent");
    let users = db.collection("users").unwrap();

    assert!(users.delete(77u64).await.unwrap().is_none());
}

#[tokio::test]
async fn upsert_twice_behaves_like_update_the_second_time() {
    let db = open_fixture("facade_upsert_law");
    let users = db.collection("users").unwrap();

    let created = users.upsert(record! { "name" => "ada" }).await.unwrap();
    let id = created.field_or_null("id");
    assert_eq!(id, Value::Uint(1));

    let mut again = created.clone();
    again.set("name", "ada lovelace");
    let updated = users.upsert(again.clone()).await.unwrap();

    assert_eq!(updated, again);
    assert_eq!(users.count().await.unwrap(), 1);
    let found = users.find(id, None).await.unwrap().unwrap();
    assert_eq!(found.field_or_null("name"), Value::from("ada lovelace"));
}

#[tokio::test]
async fn unwrap_round_trips_wrap() {
    let db = open_fixture("facade_wrap");
    let users = db.collection("users").unwrap();

    let record = record! { "id" => 9u64, "name" => "ada" };
    let active = users.wrap(record.clone()).unwrap();
    assert_eq!(users.unwrap(active), record);
}

#[tokio::test]
async fn active_records_save_and_delete() {
    let db = open_fixture("facade_active");
    let users = db.collection("users").unwrap();

    let mut active = users.create_active(record! { "name" => "ada" }).await.unwrap();
    active.set("name", "countess");
    active.save().await.unwrap();

    let stored = users.find(1u64, None).await.unwrap().unwrap();
    assert_eq!(stored.field_or_null("name"), Value::from("countess"));

    active.delete().await.unwrap();
    assert_eq!(users.count().await.unwrap(), 0);
}

#[tokio::test]
async fn relation_named_fields_are_rejected_on_writes_and_wrap() {
    let db = open_fixture("facade_relation_conflict");
    let users = db.collection("users").unwrap();

    let bad = record! { "name" => "ada", "userPosts" => vec![1i64] };
    assert!(users.create(bad.clone()).await.unwrap_err().has_prefix("relation-conflict"));
    let wrap_err = users.wrap(bad).err().expect("wrap must reject relation fields");
    assert!(wrap_err.has_prefix("relation-conflict"));
}

#[tokio::test]
async fn events_fire_only_after_commit() {
    let db = open_fixture("facade_events");
    let users = db.collection("users").unwrap();

    let seen: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let log = seen.clone();
    users.add_event_listener(EventKind::Write, move |payload| {
        let name = payload
            .and_then(|record| record.field("name").cloned())
            .unwrap_or(Value::Null);
        log.borrow_mut().push(format!("{name:?}"));
    });

    users.create(record! { "name" => "ada" }).await.unwrap();
    assert_eq!(seen.borrow().len(), 1);

    // An aborted transaction emits nothing.
    let result: Result<(), crate::Error> = db
        .transaction(|tx| async move {
            let users = tx.collection("users")?;
            users.create(record! { "name" => "ghost" }).await?;
            Err(crate::Error::new(
                crate::ErrorKind::Internal,
                crate::error::ErrorOrigin::Facade,
                "roll it back",
            ))
        })
        .await;
    assert!(result.is_err());

    assert_eq!(seen.borrow().len(), 1);
    assert_eq!(db.collection("users").unwrap().count().await.unwrap(), 1);
}

#[tokio::test]
async fn clear_emits_one_event_with_no_payload() {
    let db = open_fixture("facade_clear");
    let users = db.collection("users").unwrap();
    users.create(record! { "name" => "a" }).await.unwrap();
    users.create(record! { "name" => "b" }).await.unwrap();

    let clears = Rc::new(RefCell::new(Vec::new()));
    let log = clears.clone();
    users.add_event_listener(EventKind::Clear, move |payload| {
        log.borrow_mut().push(payload.is_none());
    });

    users.clear().await.unwrap();
    assert_eq!(*clears.borrow(), vec![true]);
    assert_eq!(users.count().await.unwrap(), 0);
}

#[tokio::test]
async fn latest_min_and_max_walk_the_right_cursors() {
    let db = open_fixture("facade_extrema");
    let users = db.collection("users").unwrap();
    users.create(record! { "name" => "mid" }).await.unwrap();
    users.create(record! { "name" => "aaa" }).await.unwrap();
    users.create(record! { "name" => "zzz" }).await.unwrap();

    let latest = users.latest(None).await.unwrap().unwrap();
    assert_eq!(latest.field_or_null("id"), Value::Uint(3));

    let min = users.min("byName", None).await.unwrap().unwrap();
    assert_eq!(min.field_or_null("name"), Value::from("aaa"));

    let max = users.max("byName", None).await.unwrap().unwrap();
    assert_eq!(max.field_or_null("name"), Value::from("zzz"));

    let err = users.min("byAge", None).await.unwrap_err();
    assert!(err.has_prefix("unknown-index"));
}

#[tokio::test]
async fn get_index_range_respects_dsl_bounds() {
    let db = open_fixture("facade_index_range");
    let users = db.collection("users").unwrap();
    for name in ["anna", "boris", "clara", "doris"] {
        users.create(record! { "name" => name }).await.unwrap();
    }

    let records = users
        .get_index_range(
            "byName",
            IndexRangeOptions {
                key_range: Some(range!(> "anna", <= "clara").unwrap()),
                ..IndexRangeOptions::default()
            },
        )
        .await
        .unwrap();

    let names: Vec<Value> = records.iter().map(|r| r.field_or_null("name")).collect();
    assert_eq!(names, vec![Value::from("boris"), Value::from("clara")]);
}

#[tokio::test]
async fn find_many_applies_predicate_and_limit() {
    let db = open_fixture("facade_find_many");
    let users = db.collection("users").unwrap();
    for i in 0..6i64 {
        users
            .create(record! { "name" => format!("user-{i}") })
            .await
            .unwrap();
    }

    let matched = users
        .find_many(
            |record| {
                record
                    .field("id")
                    .is_some_and(|id| matches!(id, Value::Uint(n) if n % 2 == 0))
            },
            QueryOptions {
                limit: Some(2),
                with: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(matched.len(), 2);
    assert_eq!(matched[0].field_or_null("id"), Value::Uint(2));
    assert_eq!(matched[1].field_or_null("id"), Value::Uint(4));
}

#[tokio::test]
async fn iterate_yields_records_in_cursor_order() {
    let db = open_fixture("facade_iterate");
    let users = db.collection("users").unwrap();
    for name in ["a", "b", "c"] {
        users.create(record! { "name" => name }).await.unwrap();
    }

    let stream = users.iterate(IterateOptions::default());
    futures::pin_mut!(stream);
    let mut ids = Vec::new();
    while let Some(record) = stream.next().await {
        ids.push(record.unwrap().field_or_null("id"));
    }
    assert_eq!(ids, vec![Value::Uint(1), Value::Uint(2), Value::Uint(3)]);

    // Writes still work after the stream released its read transaction.
    users.create(record! { "name" => "d" }).await.unwrap();
    assert_eq!(users.count().await.unwrap(), 4);
}
