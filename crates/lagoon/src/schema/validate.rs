//! Module: schema::validate
//! Responsibility: whole-schema validation before the store is opened.
//! Boundary: any failure here is fatal to initialization and is never
//! retried; nothing else in the engine re-checks these invariants.

use crate::schema::{FieldDescriptor, FieldKind, IdMode, Schema};
use lagoon_core::{ErrorClass, ErrorOrigin, InternalError};
use std::collections::{BTreeMap, BTreeSet, HashSet};

fn invalid(message: impl Into<String>) -> InternalError {
    InternalError::new(ErrorClass::SchemaInvalid, ErrorOrigin::Schema, message)
}

/// Validate the declarative schema: key paths, id modes, index names,
/// foreign-key targets, relation endpoints, and shape acyclicity.
pub fn validate_schema(schema: &Schema) -> Result<(), InternalError> {
    let mut names = HashSet::new();
    for collection in &schema.collections {
        if !names.insert(collection.name.as_str()) {
            return Err(invalid(format!(
                "duplicate collection name '{}'",
                collection.name
            )));
        }
    }

    for collection in &schema.collections {
        let name = &collection.name;

        if collection.key_path.is_empty() {
            return Err(invalid(format!("collection '{name}' has an empty key path")));
        }
        let mut key_fields = HashSet::new();
        for field in &collection.key_path {
            if field.is_empty() {
                return Err(invalid(format!(
                    "collection '{name}' has an empty key path field"
                )));
            }
            if !key_fields.insert(field.as_str()) {
                return Err(invalid(format!(
                    "collection '{name}' repeats key path field '{field}'"
                )));
            }
        }

        if collection.id_mode == IdMode::AutoIncrement {
            if collection.key_path.len() != 1 {
                return Err(invalid(format!(
                    "collection '{name}' uses auto-increment with a tuple key path"
                )));
            }
            // When the key field has a declared shape it must be numeric.
            let key_field = &collection.key_path[0];
            let declared = collection.fields.iter().find(|f| &f.name == key_field);
            if let Some(field) = declared
                && !matches!(field.kind, FieldKind::Number | FieldKind::BigInt)
            {
                return Err(invalid(format!(
                    "collection '{name}' uses auto-increment on non-numeric field '{key_field}'"
                )));
            }
        }

        let mut index_names = HashSet::new();
        for index in &collection.indexes {
            if !index_names.insert(index.name.as_str()) {
                return Err(invalid(format!(
                    "collection '{name}' repeats index name '{}'",
                    index.name
                )));
            }
            if index.key.is_empty() {
                return Err(invalid(format!(
                    "index '{}' on collection '{name}' has an empty key",
                    index.name
                )));
            }
        }

        for fk in &collection.foreign_keys {
            if fk.source_field.is_empty() {
                return Err(invalid(format!(
                    "collection '{name}' declares a foreign key with an empty source field"
                )));
            }
            if !names.contains(fk.target_collection.as_str()) {
                return Err(invalid(format!(
                    "foreign key '{name}.{}' targets unknown collection '{}'",
                    fk.source_field, fk.target_collection
                )));
            }
        }

        validate_fields(&collection.fields, &schema.shapes, name)?;
    }

    let mut edge_names: HashSet<(&str, &str)> = HashSet::new();
    for relation in &schema.relations {
        if !names.contains(relation.from.as_str()) {
            return Err(invalid(format!(
                "relation '{}' starts at unknown collection '{}'",
                relation.name, relation.from
            )));
        }
        if !names.contains(relation.to.as_str()) {
            return Err(invalid(format!(
                "relation '{}' targets unknown collection '{}'",
                relation.name, relation.to
            )));
        }
        if !edge_names.insert((relation.from.as_str(), relation.name.as_str())) {
            return Err(invalid(format!(
                "collection '{}' declares relation '{}' twice",
                relation.from, relation.name
            )));
        }
    }

    validate_shape_registry(&schema.shapes)?;

    Ok(())
}

fn validate_fields(
    fields: &[FieldDescriptor],
    shapes: &BTreeMap<String, Vec<FieldDescriptor>>,
    context: &str,
) -> Result<(), InternalError> {
    let mut field_names = HashSet::new();
    for field in fields {
        if !field_names.insert(field.name.as_str()) {
            return Err(invalid(format!(
                "'{context}' repeats field name '{}'",
                field.name
            )));
        }
        validate_kind(&field.kind, shapes, context)?;
    }

    Ok(())
}

fn validate_kind(
    kind: &FieldKind,
    shapes: &BTreeMap<String, Vec<FieldDescriptor>>,
    context: &str,
) -> Result<(), InternalError> {
    match kind {
        FieldKind::Record(nested) => validate_fields(nested, shapes, context),
        FieldKind::SequenceOf(element) => validate_kind(element, shapes, context),
        FieldKind::Shape(name) => {
            if shapes.contains_key(name) {
                Ok(())
            } else {
                Err(invalid(format!(
                    "'{context}' references unknown shape '{name}'"
                )))
            }
        }
        _ => Ok(()),
    }
}

/// Reject cyclic shape references with a depth-first walk over the
/// shape registry.
fn validate_shape_registry(
    shapes: &BTreeMap<String, Vec<FieldDescriptor>>,
) -> Result<(), InternalError> {
    let mut finished: BTreeSet<&str> = BTreeSet::new();
    for name in shapes.keys() {
        let mut stack: Vec<&str> = Vec::new();
        walk_shape(name, shapes, &mut stack, &mut finished)?;
    }

    Ok(())
}

fn walk_shape<'a>(
    name: &'a str,
    shapes: &'a BTreeMap<String, Vec<FieldDescriptor>>,
    stack: &mut Vec<&'a str>,
    finished: &mut BTreeSet<&'a str>,
) -> Result<(), InternalError> {
    if finished.contains(name) {
        return Ok(());
    }
    if stack.contains(&name) {
        return Err(invalid(format!(
            "cyclic shape reference: {} -> {name}",
            stack.join(" -> ")
        )));
    }
    let Some(fields) = shapes.get(name) else {
        return Err(invalid(format!("unknown shape '{name}'")));
    };

    stack.push(name);
    for field in fields {
        walk_kind(&field.kind, shapes, stack, finished)?;
    }
    stack.pop();
    finished.insert(name);

    Ok(())
}

fn walk_kind<'a>(
    kind: &'a FieldKind,
    shapes: &'a BTreeMap<String, Vec<FieldDescriptor>>,
    stack: &mut Vec<&'a str>,
    finished: &mut BTreeSet<&'a str>,
) -> Result<(), InternalError> {
    match kind {
        FieldKind::Record(nested) => {
            for field in nested {
                walk_kind(&field.kind, shapes, stack, finished)?;
            }
            Ok(())
        }
        FieldKind::SequenceOf(element) => walk_kind(element, shapes, stack, finished),
        FieldKind::Shape(name) => walk_shape(name, shapes, stack, finished),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{
        CollectionDescriptor, ForeignKeyDescriptor, IndexDescriptor, OnDelete, RelationDescriptor,
        RelationKind, Schema,
    };

    fn base_schema() -> Schema {
        Schema::new()
            .collection(CollectionDescriptor::new("users", &["id"]).auto_increment())
            .collection(CollectionDescriptor::new("posts", &["id"]).foreign_key(
                ForeignKeyDescriptor::new("userId", "users", OnDelete::Cascade),
            ))
    }

    #[test]
    fn accepts_a_well_formed_schema() {
        let schema = base_schema().relation(RelationDescriptor::new(
            "userPosts",
            "users",
            "posts",
            RelationKind::OneToMany,
            "id",
            "userId",
        ));
        assert!(validate_schema(&schema).is_ok());
    }

    #[test]
    fn rejects_duplicate_key_path_fields() {
        let schema = Schema::new().collection(CollectionDescriptor::new("pairs", &["a", "a"]));
        let err = validate_schema(&schema).unwrap_err();
        assert_eq!(err.class, ErrorClass::SchemaInvalid);
    }

    #[test]
    fn rejects_auto_increment_on_tuple_keys() {
        let schema =
            Schema::new().collection(CollectionDescriptor::new("pairs", &["a", "b"]).auto_increment());
        assert!(validate_schema(&schema).is_err());
    }

    #[test]
    fn rejects_duplicate_index_names() {
        let schema = Schema::new().collection(
            CollectionDescriptor::new("users", &["id"])
                .index(IndexDescriptor::new("byName", &["name"]))
                .index(IndexDescriptor::new("byName", &["email"])),
        );
        assert!(validate_schema(&schema).is_err());
    }

    #[test]
    fn rejects_unresolved_foreign_key_targets() {
        let schema = Schema::new().collection(CollectionDescriptor::new("posts", &["id"]).foreign_key(
            ForeignKeyDescriptor::new("userId", "users", OnDelete::Restrict),
        ));
        assert!(validate_schema(&schema).is_err());
    }

    #[test]
    fn rejects_cyclic_shapes() {
        let schema = base_schema()
            .shape(
                "a",
                vec![FieldDescriptor::new("b", FieldKind::Shape("b".to_string()))],
            )
            .shape(
                "b",
                vec![FieldDescriptor::new("a", FieldKind::Shape("a".to_string()))],
            );
        let err = validate_schema(&schema).unwrap_err();
        assert!(err.message.contains("cyclic shape reference"));
    }
}
