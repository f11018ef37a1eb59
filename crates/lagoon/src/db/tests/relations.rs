use crate::db::{
    facade::IterateOptions,
    relation::{WithEdge, WithSpec},
};
use futures::StreamExt;
use lagoon_core::{record, value::Value};

use super::open_fixture;

async fn seed_blog(db: &crate::Database) -> Value {
    let users = db.collection("users").unwrap();
    let posts = db.collection("posts").unwrap();
    let comments = db.collection("comments").unwrap();

    let user = users.create(record! { "name" => "ada" }).await.unwrap();
    let user_id = user.field_or_null("id");

    for i in 1..=5i64 {
        let content = if i % 2 == 1 {
            format!("Important update {i}")
        } else {
            format!("minor note {i}")
        };
        posts
            .create(record! {
                "id" => format!("p{i}"),
                "userId" => user_id.clone(),
                "content" => content,
            })
            .await
            .unwrap();
        comments
            .create(record! {
                "id" => format!("c{i}"),
                "postId" => format!("p{i}"),
                "userId" => user_id.clone(),
            })
            .await
            .unwrap();
    }

    user_id
}

#[tokio::test]
async fn eager_loading_with_nested_limit_and_where() {
    let db = open_fixture("rel_nested");
    let user_id = seed_blog(&db).await;
    let users = db.collection("users").unwrap();

    let spec = WithSpec::new().load_with(
        "userPosts",
        WithEdge::new()
            .filter(|post| {
                post.field("content")
                    .and_then(Value::as_text)
                    .is_some_and(|content| content.contains("Important"))
            })
            .limit(2)
            .nested(WithSpec::new().load("postComments")),
    );

    let user = users.find(user_id, Some(spec)).await.unwrap().unwrap();

    let Some(Value::List(loaded)) = user.field("userPosts") else {
        panic!("userPosts must be a populated list");
    };
    assert_eq!(loaded.len(), 2);

    for post in loaded {
        let post = post.as_map().unwrap();
        let content = post.get("content").and_then(Value::as_text).unwrap();
        assert!(content.contains("Important"));

        let Some(Value::List(comments)) = post.get("postComments") else {
            panic!("nested postComments must be populated");
        };
        assert_eq!(comments.len(), 1);
    }
}

#[tokio::test]
async fn one_to_one_edges_attach_a_single_record_or_null() {
    let db = open_fixture("rel_one_to_one");
    seed_blog(&db).await;
    let posts = db.collection("posts").unwrap();

    let post = posts
        .find("p1", Some(WithSpec::new().load("postAuthor")))
        .await
        .unwrap()
        .unwrap();
    let author = post.field("postAuthor").and_then(Value::as_map).unwrap();
    assert_eq!(author.get("name"), Some(&Value::from("ada")));

    // A post whose author key matches nothing resolves to null, not a
    // missing field.
    let notes = db.collection("notes").unwrap();
    notes.create(record! { "text" => "x" }).await.unwrap();
    let all = posts.all(Some(WithSpec::new().load("postAuthor"))).await.unwrap();
    assert!(all.iter().all(|post| post.contains_field("postAuthor")));
}

#[tokio::test]
async fn unknown_relation_names_are_programming_errors() {
    let db = open_fixture("rel_unknown");
    seed_blog(&db).await;
    let users = db.collection("users").unwrap();

    let err = users
        .all(Some(WithSpec::new().load("userFriends")))
        .await
        .unwrap_err();
    assert!(err.message.contains("no relation named 'userFriends'"));
}

#[tokio::test]
async fn iterate_resolves_relations_per_batch() {
    let db = open_fixture("rel_iterate");
    seed_blog(&db).await;
    let posts = db.collection("posts").unwrap();

    let stream = posts.iterate(IterateOptions {
        with: Some(WithSpec::new().load("postComments")),
        ..IterateOptions::default()
    });
    futures::pin_mut!(stream);

    let mut seen = 0usize;
    while let Some(post) = stream.next().await {
        let post = post.unwrap();
        let Some(Value::List(comments)) = post.field("postComments") else {
            panic!("every post must carry its comments");
        };
        assert_eq!(comments.len(), 1);
        seen += 1;
    }
    assert_eq!(seen, 5);
}
