use lagoon_core::{record, value::Value};
use std::{cell::RefCell, rc::Rc};

use super::open_fixture;

#[tokio::test]
async fn get_memoizes_until_a_tracked_collection_changes() {
    let db = open_fixture("sel_memo");
    let evaluations = Rc::new(RefCell::new(0u32));

    let count = evaluations.clone();
    let names = db.selector("allUserNames", move |ctx| {
        *count.borrow_mut() += 1;
        async move {
            let users = ctx.collection("users")?;
            let records = users.all(None).await?;
            Ok(records
                .iter()
                .map(|record| record.field_or_null("name"))
                .collect::<Vec<Value>>())
        }
    });

    assert!(names.get().await.unwrap().is_empty());
    assert!(names.get().await.unwrap().is_empty());
    assert_eq!(*evaluations.borrow(), 1);

    db.collection("users")
        .unwrap()
        .create(record! { "name" => "ada" })
        .await
        .unwrap();

    let value = names.get().await.unwrap();
    assert_eq!(*value, vec![Value::from("ada")]);
    assert_eq!(*evaluations.borrow(), 2);
}

#[tokio::test]
async fn subscribers_fire_per_tracked_mutation_only() {
    let db = open_fixture("sel_subscribers");
    let users = db.collection("users").unwrap();
    let posts = db.collection("posts").unwrap();

    let names = db.selector("allUserNames", |ctx| async move {
        let users = ctx.collection("users")?;
        let records = users.all(None).await?;
        Ok(records
            .iter()
            .map(|record| record.field_or_null("name"))
            .collect::<Vec<Value>>())
    });

    // Warm the cache so subscribe observes it immediately.
    names.get().await.unwrap();

    let invocations = Rc::new(RefCell::new(Vec::new()));
    let log = invocations.clone();
    let subscription = names.subscribe(move |value| log.borrow_mut().push(value.len()));
    assert_eq!(*invocations.borrow(), vec![0]);

    let user = users.create(record! { "name" => "x" }).await.unwrap();
    assert_eq!(*invocations.borrow(), vec![0, 1]);

    // A mutation to an untracked collection must not re-evaluate.
    posts
        .create(record! { "id" => "p1", "userId" => user.field_or_null("id") })
        .await
        .unwrap();
    assert_eq!(*invocations.borrow(), vec![0, 1]);

    subscription.unsubscribe();
    users.create(record! { "name" => "y" }).await.unwrap();
    assert_eq!(*invocations.borrow(), vec![0, 1]);
}

#[tokio::test]
async fn batched_mutations_coalesce_into_one_refresh() {
    let db = open_fixture("sel_coalesce");
    let evaluations = Rc::new(RefCell::new(0u32));

    let count = evaluations.clone();
    let totals = db.selector("userCount", move |ctx| {
        *count.borrow_mut() += 1;
        async move {
            let users = ctx.collection("users")?;
            Ok(users.count().await?)
        }
    });
    totals.get().await.unwrap();
    assert_eq!(*evaluations.borrow(), 1);

    db.transaction(|tx| async move {
        let users = tx.collection("users")?;
        for i in 0..4i64 {
            users.create(record! { "name" => format!("u{i}") }).await?;
        }
        Ok(())
    })
    .await
    .unwrap();

    // Four writes, one commit, one re-evaluation.
    assert_eq!(*evaluations.borrow(), 2);
    assert_eq!(*totals.get().await.unwrap(), 4);
}

#[tokio::test]
async fn failed_refreshes_keep_the_cached_value() {
    let db = open_fixture("sel_failure");
    let should_fail = Rc::new(RefCell::new(false));

    let fail = should_fail.clone();
    let names = db.selector("fragile", move |ctx| {
        let fail = *fail.borrow();
        async move {
            if fail {
                return Err(crate::Error::new(
                    crate::ErrorKind::Internal,
                    crate::error::ErrorOrigin::Selector,
                    "evaluation exploded",
                ));
            }
            let users = ctx.collection("users")?;
            Ok(users.count().await?)
        }
    });

    assert_eq!(*names.get().await.unwrap(), 0);

    *should_fail.borrow_mut() = true;
    assert!(names.refresh().await.is_err());

    // The cache survives a failed refresh.
    *should_fail.borrow_mut() = false;
    assert_eq!(*names.get().await.unwrap(), 0);
}
