//! Module: schema
//! Responsibility: the declarative configuration the engine consumes —
//! collections, indexes, foreign keys, relations, field shapes.
//! Does not own: runtime semantics; descriptors are immutable after
//! validation and read-only thereafter.

pub mod field;
mod validate;

pub use field::{FieldDescriptor, FieldKind, apply_defaults};
pub use validate::validate_schema;

use crate::error::Error;
use lagoon_core::value::{Record, Value};
use std::{collections::BTreeMap, rc::Rc};

///
/// Predicate
/// User-supplied row filter used by predicate reads and per-edge `where`.
///

pub type Predicate = Rc<dyn Fn(&Record) -> bool>;

///
/// Transformer
/// Pure record-to-record function applied before serialization.
///

pub type Transformer = Rc<dyn Fn(Record) -> Record>;

///
/// WriteHook / ReadHook
/// Per-collection serialization pair: `write` maps a record to its wire
/// shape, `read` recovers a record from the wire.
///

pub type WriteHook = Rc<dyn Fn(Record) -> Value>;
pub type ReadHook = Rc<dyn Fn(Value) -> Result<Record, Error>>;

///
/// IdMode
///

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum IdMode {
    #[default]
    UserAssigned,
    /// Only legal when the key path is a single numeric field.
    AutoIncrement,
}

///
/// OnDelete
/// Downstream policy applied when the referenced row is deleted.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OnDelete {
    Cascade,
    Restrict,
    SetNull,
    NoAction,
}

///
/// IndexDescriptor
///

#[derive(Clone, Debug)]
pub struct IndexDescriptor {
    pub name: String,
    pub key: Vec<String>,
    pub unique: bool,
    pub multi_entry: bool,
}

impl IndexDescriptor {
    #[must_use]
    pub fn new(name: &str, key: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            key: key.iter().map(ToString::to_string).collect(),
            unique: false,
            multi_entry: false,
        }
    }

    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    #[must_use]
    pub const fn multi_entry(mut self) -> Self {
        self.multi_entry = true;
        self
    }
}

///
/// ForeignKeyDescriptor
///

#[derive(Clone, Debug)]
pub struct ForeignKeyDescriptor {
    pub source_field: String,
    pub target_collection: String,
    pub on_delete: OnDelete,
}

impl ForeignKeyDescriptor {
    #[must_use]
    pub fn new(source_field: &str, target_collection: &str, on_delete: OnDelete) -> Self {
        Self {
            source_field: source_field.to_string(),
            target_collection: target_collection.to_string(),
            on_delete,
        }
    }
}

///
/// Serialization
///

#[derive(Clone)]
pub struct Serialization {
    pub write: WriteHook,
    pub read: ReadHook,
}

impl Default for Serialization {
    fn default() -> Self {
        Self {
            write: Rc::new(Record::into_value),
            read: Rc::new(|wire| {
                Record::from_value(wire).ok_or_else(|| {
                    Error::new(
                        crate::error::ErrorKind::Store,
                        crate::error::ErrorOrigin::Facade,
                        "wire value is not a record; a custom read hook is required",
                    )
                })
            }),
        }
    }
}

///
/// Transformers
///

#[derive(Clone, Default)]
pub struct Transformers {
    pub create: Option<Transformer>,
    pub update: Option<Transformer>,
}

///
/// CollectionDescriptor
/// Immutable configuration of one collection.
///

#[derive(Clone)]
pub struct CollectionDescriptor {
    pub name: String,
    pub key_path: Vec<String>,
    pub id_mode: IdMode,
    pub indexes: Vec<IndexDescriptor>,
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
    pub fields: Vec<FieldDescriptor>,
    pub serialization: Serialization,
    pub transformers: Transformers,
}

impl CollectionDescriptor {
    #[must_use]
    pub fn new(name: &str, key_path: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            key_path: key_path.iter().map(ToString::to_string).collect(),
            id_mode: IdMode::UserAssigned,
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            fields: Vec::new(),
            serialization: Serialization::default(),
            transformers: Transformers::default(),
        }
    }

    #[must_use]
    pub const fn auto_increment(mut self) -> Self {
        self.id_mode = IdMode::AutoIncrement;
        self
    }

    #[must_use]
    pub fn index(mut self, index: IndexDescriptor) -> Self {
        self.indexes.push(index);
        self
    }

    #[must_use]
    pub fn foreign_key(mut self, fk: ForeignKeyDescriptor) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    #[must_use]
    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn serialization(mut self, write: WriteHook, read: ReadHook) -> Self {
        self.serialization = Serialization { write, read };
        self
    }

    #[must_use]
    pub fn transform_create(mut self, f: Transformer) -> Self {
        self.transformers.create = Some(f);
        self
    }

    #[must_use]
    pub fn transform_update(mut self, f: Transformer) -> Self {
        self.transformers.update = Some(f);
        self
    }
}

///
/// RelationKind
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RelationKind {
    OneToOne,
    OneToMany,
}

///
/// RelationDescriptor
/// Directed named edge `from` → `to` used for eager loading. Multiple
/// named edges may exist between the same pair of collections.
///

#[derive(Clone, Debug)]
pub struct RelationDescriptor {
    pub name: String,
    pub from: String,
    pub to: String,
    pub kind: RelationKind,
    pub source_field: String,
    pub target_field: String,
}

impl RelationDescriptor {
    #[must_use]
    pub fn new(
        name: &str,
        from: &str,
        to: &str,
        kind: RelationKind,
        source_field: &str,
        target_field: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            kind,
            source_field: source_field.to_string(),
            target_field: target_field.to_string(),
        }
    }
}

///
/// Schema
/// The full declarative input: collections, relation edges, and named
/// field shapes referenced by `FieldKind::Shape`.
///

#[derive(Clone, Default)]
pub struct Schema {
    pub collections: Vec<CollectionDescriptor>,
    pub relations: Vec<RelationDescriptor>,
    pub shapes: BTreeMap<String, Vec<FieldDescriptor>>,
}

impl Schema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn collection(mut self, descriptor: CollectionDescriptor) -> Self {
        self.collections.push(descriptor);
        self
    }

    #[must_use]
    pub fn relation(mut self, relation: RelationDescriptor) -> Self {
        self.relations.push(relation);
        self
    }

    #[must_use]
    pub fn shape(mut self, name: &str, fields: Vec<FieldDescriptor>) -> Self {
        self.shapes.insert(name.to_string(), fields);
        self
    }

    #[must_use]
    pub fn collection_named(&self, name: &str) -> Option<&CollectionDescriptor> {
        self.collections.iter().find(|c| c.name == name)
    }
}
