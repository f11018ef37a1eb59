//! Engine-level scenario tests over the in-memory reference backend.
//!
//! Every test opens its own named database so thread-local store state
//! never leaks between tests.

mod facade_ops;
mod foreign_keys;
mod relations;
mod selectors;
mod tabs_coordination;

use crate::{
    db::{Database, DatabaseConfig, tabs::TabBus},
    schema::{
        CollectionDescriptor, ForeignKeyDescriptor, IndexDescriptor, OnDelete,
        RelationDescriptor, RelationKind, Schema,
    },
};
use lagoon_core::capability::memory::MemoryBackend;

/// The shared fixture schema: a small blog domain exercising every
/// on-delete policy and both relation kinds.
fn fixture_schema() -> Schema {
    Schema::new()
        .collection(
            CollectionDescriptor::new("users", &["id"])
                .auto_increment()
                .index(IndexDescriptor::new("byName", &["name"])),
        )
        .collection(
            CollectionDescriptor::new("posts", &["id"])
                .index(IndexDescriptor::new("byUser", &["userId"]))
                .foreign_key(ForeignKeyDescriptor::new("userId", "users", OnDelete::Cascade)),
        )
        .collection(
            CollectionDescriptor::new("comments", &["id"])
                .foreign_key(ForeignKeyDescriptor::new("postId", "posts", OnDelete::Cascade))
                .foreign_key(ForeignKeyDescriptor::new("userId", "users", OnDelete::Cascade)),
        )
        .collection(
            CollectionDescriptor::new("todos", &["id"])
                .auto_increment()
                .foreign_key(ForeignKeyDescriptor::new("userId", "users", OnDelete::Restrict)),
        )
        .collection(
            CollectionDescriptor::new("notes", &["id"])
                .auto_increment()
                .foreign_key(ForeignKeyDescriptor::new("userId", "users", OnDelete::SetNull)),
        )
        .collection(
            CollectionDescriptor::new("naNotes", &["id"])
                .auto_increment()
                .foreign_key(ForeignKeyDescriptor::new("userId", "users", OnDelete::NoAction)),
        )
        .relation(RelationDescriptor::new(
            "userPosts",
            "users",
            "posts",
            RelationKind::OneToMany,
            "id",
            "userId",
        ))
        .relation(RelationDescriptor::new(
            "postComments",
            "posts",
            "comments",
            RelationKind::OneToMany,
            "id",
            "postId",
        ))
        .relation(RelationDescriptor::new(
            "postAuthor",
            "posts",
            "users",
            RelationKind::OneToOne,
            "userId",
            "id",
        ))
}

/// Open a fresh fixture database on its own backend state.
fn open_fixture(name: &str) -> Database {
    MemoryBackend::reset(name);
    Database::open(
        name,
        DatabaseConfig::new(fixture_schema(), 1),
        MemoryBackend::new(),
        &TabBus::new(),
    )
    .expect("fixture schema must validate")
}

/// Join an existing named database as another tab on a shared bus.
fn open_tab(name: &str, bus: &TabBus, version: u32) -> Database {
    Database::open(
        name,
        DatabaseConfig::new(fixture_schema(), version),
        MemoryBackend::new(),
        bus,
    )
    .expect("fixture schema must validate")
}
