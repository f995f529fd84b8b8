//! Orderable field values
//!
//! JSON scalars are collated null < booleans < numbers < strings. Arrays and
//! objects have no position in the order and are never indexed.

use std::cmp::Ordering;

use serde_json::Value;

#[derive(Clone, Debug)]
pub enum IndexValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl IndexValue {
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(IndexValue::Null),
            Value::Bool(b) => Some(IndexValue::Bool(*b)),
            Value::Number(n) => n.as_f64().map(IndexValue::Number),
            Value::String(s) => Some(IndexValue::String(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            IndexValue::Null => 0,
            IndexValue::Bool(_) => 1,
            IndexValue::Number(_) => 2,
            IndexValue::String(_) => 3,
        }
    }
}

impl From<&str> for IndexValue {
    fn from(s: &str) -> Self {
        IndexValue::String(s.to_string())
    }
}

impl Ord for IndexValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexValue::Null, IndexValue::Null) => Ordering::Equal,
            (IndexValue::Bool(a), IndexValue::Bool(b)) => a.cmp(b),
            (IndexValue::Number(a), IndexValue::Number(b)) => a.total_cmp(b),
            (IndexValue::String(a), IndexValue::String(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for IndexValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for IndexValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexValue {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collation() {
        let mut values: Vec<IndexValue> = [json!("b"), json!(2), json!(null), json!("a"), json!(true), json!(-1.5)]
            .iter()
            .filter_map(IndexValue::from_json)
            .collect();
        values.sort();

        assert_eq!(
            values,
            vec![
                IndexValue::Null,
                IndexValue::Bool(true),
                IndexValue::Number(-1.5),
                IndexValue::Number(2.0),
                IndexValue::from("a"),
                IndexValue::from("b"),
            ]
        );
    }

    #[test]
    fn test_integer_and_float_compare_equal() {
        assert_eq!(IndexValue::from_json(&json!(3)), IndexValue::from_json(&json!(3.0)));
    }

    #[test]
    fn test_containers_are_not_indexable() {
        assert!(IndexValue::from_json(&json!([1])).is_none());
        assert!(IndexValue::from_json(&json!({"a": 1})).is_none());
    }
}
