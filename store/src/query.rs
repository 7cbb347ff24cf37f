//! Key ranges for `get_all` lookups.
//!
//! Ordering follows the structured store: numbers (booleans count as 0/1)
//! sort before strings. Nulls, arrays and objects are not indexable.

use serde_json::Value;
use std::cmp::Ordering;

/// A value as it appears in an index.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    Number(f64),
    Text(String),
}

impl IndexValue {
    /// The indexable form of a JSON value, if it has one.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64().map(IndexValue::Number),
            Value::Bool(b) => Some(IndexValue::Number(if *b { 1.0 } else { 0.0 })),
            Value::String(s) => Some(IndexValue::Text(s.clone())),
            _ => None,
        }
    }
}

impl Eq for IndexValue {}

impl PartialOrd for IndexValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexValue::Number(a), IndexValue::Number(b)) => a.total_cmp(b),
            (IndexValue::Number(_), IndexValue::Text(_)) => Ordering::Less,
            (IndexValue::Text(_), IndexValue::Number(_)) => Ordering::Greater,
            (IndexValue::Text(a), IndexValue::Text(b)) => a.cmp(b),
        }
    }
}

/// One end of a [`KeyRange`].
#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    pub value: IndexValue,
    /// Excludes `value` itself when set
    pub open: bool,
}

/// A range over primary keys or index values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyRange {
    pub lower: Option<Bound>,
    pub upper: Option<Bound>,
}

impl KeyRange {
    /// Matches exactly one value.
    pub fn only(value: impl Into<Value>) -> Self {
        let value = index_value(value.into());
        Self {
            lower: Some(Bound {
                value: value.clone(),
                open: false,
            }),
            upper: Some(Bound { value, open: false }),
        }
    }

    pub fn lower_bound(value: impl Into<Value>, open: bool) -> Self {
        Self {
            lower: Some(Bound {
                value: index_value(value.into()),
                open,
            }),
            upper: None,
        }
    }

    pub fn upper_bound(value: impl Into<Value>, open: bool) -> Self {
        Self {
            lower: None,
            upper: Some(Bound {
                value: index_value(value.into()),
                open,
            }),
        }
    }

    pub fn bound(
        lower: impl Into<Value>,
        upper: impl Into<Value>,
        lower_open: bool,
        upper_open: bool,
    ) -> Self {
        Self {
            lower: Some(Bound {
                value: index_value(lower.into()),
                open: lower_open,
            }),
            upper: Some(Bound {
                value: index_value(upper.into()),
                open: upper_open,
            }),
        }
    }

    /// Whether an indexed value falls inside the range.
    pub fn includes(&self, value: &IndexValue) -> bool {
        let above_lower = self.lower.as_ref().map_or(true, |bound| {
            match value.cmp(&bound.value) {
                Ordering::Greater => true,
                Ordering::Equal => !bound.open,
                Ordering::Less => false,
            }
        });
        let below_upper = self.upper.as_ref().map_or(true, |bound| {
            match value.cmp(&bound.value) {
                Ordering::Less => true,
                Ordering::Equal => !bound.open,
                Ordering::Greater => false,
            }
        });
        above_lower && below_upper
    }
}

// Unindexable bounds compare as text so a range built from them simply
// matches nothing numeric.
fn index_value(value: Value) -> IndexValue {
    IndexValue::from_json(&value).unwrap_or_else(|| IndexValue::Text(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn iv(value: Value) -> IndexValue {
        IndexValue::from_json(&value).unwrap()
    }

    #[test]
    fn numbers_sort_before_strings() {
        assert!(iv(json!(1000)) < iv(json!("1")));
        assert!(iv(json!(2)) < iv(json!(10)));
        assert!(iv(json!("apples")) < iv(json!("pears")));
        assert_eq!(iv(json!(true)), IndexValue::Number(1.0));
    }

    #[test]
    fn unindexable_values() {
        assert!(IndexValue::from_json(&json!(null)).is_none());
        assert!(IndexValue::from_json(&json!([1])).is_none());
        assert!(IndexValue::from_json(&json!({"a": 1})).is_none());
    }

    #[test]
    fn only_matches_single_value() {
        let range = KeyRange::only("Tomatoes");
        assert!(range.includes(&iv(json!("Tomatoes"))));
        assert!(!range.includes(&iv(json!("Tomato"))));
    }

    #[test]
    fn bounds_respect_open_ends() {
        let range = KeyRange::bound("2024-01-01", "2024-01-31", false, true);
        assert!(range.includes(&iv(json!("2024-01-01"))));
        assert!(range.includes(&iv(json!("2024-01-15"))));
        assert!(!range.includes(&iv(json!("2024-01-31"))));
        assert!(!range.includes(&iv(json!("2023-12-31"))));

        let range = KeyRange::lower_bound(10, true);
        assert!(!range.includes(&iv(json!(10))));
        assert!(range.includes(&iv(json!(10.5))));

        let range = KeyRange::upper_bound(10, false);
        assert!(range.includes(&iv(json!(10))));
        assert!(!range.includes(&iv(json!(11))));
    }
}
