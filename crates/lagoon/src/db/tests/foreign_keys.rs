use crate::db::events::EventKind;
use lagoon_core::{record, value::Value};
use std::{cell::RefCell, rc::Rc};

use super::open_fixture;

#[tokio::test]
async fn upstream_references_must_exist_at_write_time() {
    let db = open_fixture("fk_upstream");
    let posts = db.collection("posts").unwrap();

    let err = posts
        .create(record! { "id" => "p1", "userId" => 99u64 })
        .await
        .unwrap_err();
    assert!(err.has_prefix("fk-missing"));

    // Null is only allowed under set-null.
    let notes = db.collection("notes").unwrap();
    notes.create(record! { "text" => "floating" }).await.unwrap();

    let todos = db.collection("todos").unwrap();
    let err = todos.create(record! { "text" => "floating" }).await.unwrap_err();
    assert!(err.has_prefix("fk-missing"));
}

#[tokio::test]
async fn cascade_across_two_edges_clears_the_whole_chain() {
    let db = open_fixture("fk_cascade_chain");
    let users = db.collection("users").unwrap();
    let posts = db.collection("posts").unwrap();
    let comments = db.collection("comments").unwrap();

    let user = users.create(record! { "name" => "ada" }).await.unwrap();
    let user_id = user.field_or_null("id");
    posts
        .create(record! { "id" => "p1", "userId" => user_id.clone() })
        .await
        .unwrap();
    comments
        .create(record! { "id" => "c1", "postId" => "p1", "userId" => user_id.clone() })
        .await
        .unwrap();

    let deletes: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    for (facade, label) in [(&users, "users"), (&posts, "posts"), (&comments, "comments")] {
        let log = deletes.clone();
        facade.add_event_listener(EventKind::Delete, move |_| log.borrow_mut().push(label));
    }

    let removed = users.delete(user_id).await.unwrap();
    assert!(removed.is_some());

    assert_eq!(users.count().await.unwrap(), 0);
    assert_eq!(posts.count().await.unwrap(), 0);
    assert_eq!(comments.count().await.unwrap(), 0);

    // One delete event per removed row, all inside one commit; the
    // deleted row's own event fires after its dependents'.
    assert_eq!(deletes.borrow().len(), 3);
    assert_eq!(deletes.borrow().last(), Some(&"users"));
    assert!(deletes.borrow().contains(&"posts"));
    assert!(deletes.borrow().contains(&"comments"));
}

#[tokio::test]
async fn restrict_blocks_the_delete_and_emits_nothing() {
    let db = open_fixture("fk_restrict");
    let users = db.collection("users").unwrap();
    let todos = db.collection("todos").unwrap();

    let user = users.create(record! { "name" => "ada" }).await.unwrap();
    let user_id = user.field_or_null("id");
    todos
        .create(record! { "text" => "ship it", "userId" => user_id.clone() })
        .await
        .unwrap();

    let events = Rc::new(RefCell::new(0u32));
    for facade in [&users, &todos] {
        let count = events.clone();
        facade.add_event_listener(EventKind::WriteDelete, move |_| {
            *count.borrow_mut() += 1;
        });
    }

    let err = users.delete(user_id).await.unwrap_err();
    assert!(err.has_prefix("fk-restrict"));

    assert_eq!(users.count().await.unwrap(), 1);
    assert_eq!(todos.count().await.unwrap(), 1);
    assert_eq!(*events.borrow(), 0);
}

#[tokio::test]
async fn set_null_rewrites_referencers_and_emits_a_write() {
    let db = open_fixture("fk_set_null");
    let users = db.collection("users").unwrap();
    let notes = db.collection("notes").unwrap();

    let user = users.create(record! { "name" => "ada" }).await.unwrap();
    let user_id = user.field_or_null("id");
    notes
        .create(record! { "text" => "keep me", "userId" => user_id.clone() })
        .await
        .unwrap();

    let writes = Rc::new(RefCell::new(0u32));
    let deletes = Rc::new(RefCell::new(0u32));
    {
        let count = writes.clone();
        notes.add_event_listener(EventKind::Write, move |_| *count.borrow_mut() += 1);
        let count = deletes.clone();
        users.add_event_listener(EventKind::Delete, move |_| *count.borrow_mut() += 1);
    }

    users.delete(user_id).await.unwrap();

    assert_eq!(users.count().await.unwrap(), 0);
    let survivor = notes.find(1u64, None).await.unwrap().unwrap();
    assert_eq!(survivor.field_or_null("userId"), Value::Null);
    assert_eq!(*writes.borrow(), 1);
    assert_eq!(*deletes.borrow(), 1);
}

#[tokio::test]
async fn no_action_passes_when_repointed_in_the_same_transaction() {
    let db = open_fixture("fk_no_action_repoint");
    let users = db.collection("users").unwrap();
    let na_notes = db.collection("naNotes").unwrap();

    let first = users.create(record! { "name" => "one" }).await.unwrap();
    let second = users.create(record! { "name" => "two" }).await.unwrap();
    let note = na_notes
        .create(record! { "text" => "x", "userId" => first.field_or_null("id") })
        .await
        .unwrap();

    let second_id = second.field_or_null("id");
    let first_id = first.field_or_null("id");
    db.transaction(move |tx| async move {
        let users = tx.collection("users")?;
        let na_notes = tx.collection("naNotes")?;
        users.delete(first_id).await?;
        let mut note = note;
        note.set("userId", second_id);
        na_notes.update(note).await?;
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(users.count().await.unwrap(), 1);
    let survivor = na_notes.find(1u64, None).await.unwrap().unwrap();
    assert_eq!(survivor.field_or_null("userId"), Value::Uint(2));
}

#[tokio::test]
async fn no_action_aborts_when_a_referencer_would_dangle() {
    let db = open_fixture("fk_no_action_dangle");
    let users = db.collection("users").unwrap();
    let na_notes = db.collection("naNotes").unwrap();

    let user = users.create(record! { "name" => "one" }).await.unwrap();
    let user_id = user.field_or_null("id");
    na_notes
        .create(record! { "text" => "x", "userId" => user_id.clone() })
        .await
        .unwrap();

    let moved_id = user_id.clone();
    let err = db
        .transaction(move |tx| async move {
            let users = tx.collection("users")?;
            users.delete(moved_id).await?;
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(err.has_prefix("fk-missing"));

    // The abort rolled the delete back.
    assert_eq!(users.count().await.unwrap(), 1);
    assert_eq!(na_notes.count().await.unwrap(), 1);
}
