use crate::{
    record,
    value::{Float, Record, Value, canonical_cmp},
};
use proptest::prelude::*;
use std::cmp::Ordering;

#[test]
fn rank_separates_variant_families() {
    let ordered = [
        Value::Null,
        Value::Bool(false),
        Value::Int(9),
        Value::Timestamp(0),
        Value::Text("a".into()),
        Value::Blob(vec![0]),
        Value::List(vec![]),
        Value::Map(std::collections::BTreeMap::new()),
    ];

    for window in ordered.windows(2) {
        assert_eq!(canonical_cmp(&window[0], &window[1]), Ordering::Less);
    }
}

#[test]
fn numeric_variants_compare_numerically() {
    assert_eq!(
        canonical_cmp(&Value::Int(2), &Value::Uint(2)),
        Ordering::Equal
    );
    assert_eq!(
        canonical_cmp(&Value::Int(-1), &Value::Uint(0)),
        Ordering::Less
    );
    assert_eq!(
        canonical_cmp(&Value::Float(Float(2.5)), &Value::Int(3)),
        Ordering::Less
    );
    assert_eq!(
        canonical_cmp(&Value::Uint(10), &Value::Float(Float(9.5))),
        Ordering::Greater
    );
}

#[test]
fn list_order_is_lexicographic_then_length() {
    let short = Value::from_slice(&[1i64, 2]);
    let long = Value::from_slice(&[1i64, 2, 0]);
    assert_eq!(canonical_cmp(&short, &long), Ordering::Less);

    let bigger_head = Value::from_slice(&[2i64]);
    assert_eq!(canonical_cmp(&bigger_head, &long), Ordering::Greater);
}

#[test]
fn nan_is_not_keyable() {
    assert!(!Value::Float(Float(f64::NAN)).is_keyable());
    assert!(Value::Float(Float(1.0)).is_keyable());
    assert!(!Value::List(vec![Value::Null]).is_keyable());
    assert!(Value::List(vec![Value::Int(1), Value::Text("x".into())]).is_keyable());
}

#[test]
fn record_macro_round_trips_through_value() {
    let rec = record! { "id" => 1, "name" => "ada", "tags" => vec!["a", "b"] };
    let value = rec.clone().into_value();
    assert_eq!(Record::from_value(value), Some(rec));
    assert_eq!(Record::from_value(Value::Int(1)), None);
}

#[test]
fn values_round_trip_through_serde() {
    let value = Value::Map(
        [
            ("id".to_string(), Value::Uint(1)),
            ("score".to_string(), Value::Float(Float(2.5))),
            ("tags".to_string(), Value::from_slice(&["a", "b"])),
        ]
        .into_iter()
        .collect(),
    );

    let encoded = serde_json::to_string(&value).unwrap();
    let decoded: Value = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, value);
}

#[test]
fn absent_field_reads_as_null() {
    let rec = record! { "id" => 1 };
    assert_eq!(rec.field("name"), None);
    assert_eq!(rec.field_or_null("name"), Value::Null);
}

fn arb_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        any::<u64>().prop_map(Value::Uint),
        any::<f64>().prop_map(|f| Value::Float(Float(f))),
        any::<i64>().prop_map(Value::Timestamp),
        "[a-z]{0,8}".prop_map(Value::Text),
        proptest::collection::vec(any::<u8>(), 0..8).prop_map(Value::Blob),
    ];
    leaf.prop_recursive(2, 16, 4, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::List),
            proptest::collection::btree_map("[a-z]{1,4}", inner, 0..4).prop_map(Value::Map),
        ]
    })
}

proptest! {
    #[test]
    fn canonical_cmp_is_reflexive(v in arb_value()) {
        prop_assert_eq!(canonical_cmp(&v, &v), Ordering::Equal);
    }

    #[test]
    fn canonical_cmp_is_antisymmetric(a in arb_value(), b in arb_value()) {
        prop_assert_eq!(canonical_cmp(&a, &b), canonical_cmp(&b, &a).reverse());
    }

    #[test]
    fn canonical_cmp_is_transitive(mut values in proptest::collection::vec(arb_value(), 3)) {
        values.sort_by(canonical_cmp);
        let (a, b, c) = (&values[0], &values[1], &values[2]);
        prop_assert_ne!(canonical_cmp(a, b), Ordering::Greater);
        prop_assert_ne!(canonical_cmp(b, c), Ordering::Greater);
        prop_assert_ne!(canonical_cmp(a, c), Ordering::Greater);
    }
}
