//! Field shapes are configuration, not a class hierarchy: each
//! descriptor is a tagged variant, and applying defaults is a fold over
//! the descriptor tree. Named shapes may reference each other; cycles
//! are rejected at schema validation time.

use lagoon_core::value::{Record, Value};
use std::collections::BTreeMap;

///
/// FieldKind
///

#[derive(Clone, Debug)]
pub enum FieldKind {
    Text,
    Number,
    BigInt,
    Boolean,
    Date,
    /// Inline nested record shape.
    Record(Vec<FieldDescriptor>),
    /// Homogeneous sequence of one element kind.
    SequenceOf(Box<FieldKind>),
    /// Reference to a named shape in the schema's shape registry.
    Shape(String),
}

///
/// FieldDescriptor
///

#[derive(Clone, Debug)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    pub default: Option<Value>,
}

impl FieldDescriptor {
    #[must_use]
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            default: None,
        }
    }

    #[must_use]
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// Fold declared defaults into a record: absent fields take their
/// default, nested record shapes recurse, sequences fold per element.
pub fn apply_defaults(
    fields: &[FieldDescriptor],
    shapes: &BTreeMap<String, Vec<FieldDescriptor>>,
    record: &mut Record,
) {
    for field in fields {
        if !record.contains_field(&field.name) {
            if let Some(default) = &field.default {
                record.set(field.name.clone(), default.clone());
            }
        }
        if let Some(value) = record.get_mut(&field.name) {
            fold_value_defaults(&field.kind, shapes, value);
        }
    }
}

fn fold_value_defaults(
    kind: &FieldKind,
    shapes: &BTreeMap<String, Vec<FieldDescriptor>>,
    value: &mut Value,
) {
    match (kind, value) {
        (FieldKind::Record(nested), Value::Map(map)) => {
            let mut record = Record::from_value(Value::Map(std::mem::take(map)))
                .unwrap_or_default();
            apply_defaults(nested, shapes, &mut record);
            if let Value::Map(folded) = record.into_value() {
                *map = folded;
            }
        }
        (FieldKind::SequenceOf(element), Value::List(items)) => {
            for item in items {
                fold_value_defaults(element, shapes, item);
            }
        }
        (FieldKind::Shape(name), value) => {
            // Unknown shapes are caught by schema validation.
            if let Some(nested) = shapes.get(name) {
                fold_value_defaults(&FieldKind::Record(nested.clone()), shapes, value);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lagoon_core::record;

    #[test]
    fn defaults_fold_into_absent_fields_only() {
        let fields = vec![
            FieldDescriptor::new("name", FieldKind::Text).default_value("anonymous"),
            FieldDescriptor::new("age", FieldKind::Number).default_value(0),
        ];

        let mut record = record! { "age" => 30 };
        apply_defaults(&fields, &BTreeMap::new(), &mut record);

        assert_eq!(record.field_or_null("name"), Value::from("anonymous"));
        assert_eq!(record.field_or_null("age"), Value::from(30));
    }

    #[test]
    fn nested_record_shapes_fold_recursively() {
        let fields = vec![FieldDescriptor::new(
            "address",
            FieldKind::Record(vec![
                FieldDescriptor::new("country", FieldKind::Text).default_value("sweden"),
            ]),
        )];

        let mut record = record! { "address" => record! { "city" => "lund" } };
        apply_defaults(&fields, &BTreeMap::new(), &mut record);

        let address = record.field("address").and_then(Value::as_map).unwrap();
        assert_eq!(address.get("country"), Some(&Value::from("sweden")));
        assert_eq!(address.get("city"), Some(&Value::from("lund")));
    }

    #[test]
    fn sequence_elements_fold_through_named_shapes() {
        let mut shapes = BTreeMap::new();
        shapes.insert(
            "tag".to_string(),
            vec![FieldDescriptor::new("weight", FieldKind::Number).default_value(1)],
        );
        let fields = vec![FieldDescriptor::new(
            "tags",
            FieldKind::SequenceOf(Box::new(FieldKind::Shape("tag".to_string()))),
        )];

        let mut record = record! { "tags" => vec![record! { "label" => "a" }] };
        apply_defaults(&fields, &shapes, &mut record);

        let Some(Value::List(items)) = record.field("tags") else {
            panic!("tags must stay a list");
        };
        let tag = items[0].as_map().unwrap();
        assert_eq!(tag.get("weight"), Some(&Value::from(1)));
    }
}
