//! # Row Ordering
//!
//! Multi-key ordering over rows whose schemas differ per source.
//!
//! Each sort field is classified once over every row that will be merged
//! (numeric, text or boolean). Classification is where incomparable values
//! are rejected, so the comparator itself never has to fail and can back a
//! heap. Absent and `null` values sort after every present value in both
//! directions.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::row::{MergeRow, RowMap};

/// Anything a [`SortPlan`] can read sort fields from.
pub trait SortFields {
    fn sort_field(&self, field: &str) -> Option<&Value>;
}

impl SortFields for RowMap {
    fn sort_field(&self, field: &str) -> Option<&Value> {
        self.get(field)
    }
}

impl SortFields for MergeRow {
    fn sort_field(&self, field: &str) -> Option<&Value> {
        self.get(field)
    }
}

/// A signed sort key: `"-time"` is descending, `"time"` ascending.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderKey {
    pub field: String,
    pub descending: bool,
}

impl OrderKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }

    /// Parse `-field`, `+field` or `field`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (field, descending) = match raw.strip_prefix('-') {
            Some(rest) => (rest, true),
            None => (raw.strip_prefix('+').unwrap_or(raw), false),
        };
        let field = field.trim();
        if field.is_empty() {
            return Err(Error::compile(format!("invalid order key '{}'", raw)));
        }
        Ok(Self {
            field: field.to_string(),
            descending,
        })
    }
}

impl TryFrom<String> for OrderKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<OrderKey> for String {
    fn from(key: OrderKey) -> Self {
        key.to_string()
    }
}

impl std::fmt::Display for OrderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.descending {
            write!(f, "-{}", self.field)
        } else {
            write!(f, "{}", self.field)
        }
    }
}

/// How the present values of one sort field compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKind {
    /// No row carries the field.
    Empty,
    /// JSON numbers and numeric strings.
    Numeric,
    Text,
    Boolean,
}

/// A validated comparator for one merge.
#[derive(Debug, Clone)]
pub struct SortPlan {
    keys: Vec<(OrderKey, SortKind)>,
}

impl SortPlan {
    /// Classify every sort field over `rows`, failing on mixed kinds.
    pub fn new<'a, R, I>(order_by: &[OrderKey], rows: I) -> Result<Self>
    where
        R: SortFields + 'a,
        I: IntoIterator<Item = &'a R> + Clone,
    {
        let mut keys = Vec::with_capacity(order_by.len());
        for key in order_by {
            let values = rows.clone().into_iter().map(|r| r.sort_field(&key.field));
            let kind = classify(&key.field, values)?;
            keys.push((key.clone(), kind));
        }
        Ok(Self { keys })
    }

    /// Compare two rows under the declared keys. Equal rows need a
    /// caller-side tie-break.
    pub fn compare<R: SortFields>(&self, a: &R, b: &R) -> Ordering {
        for (key, kind) in &self.keys {
            let ord = compare_field(
                *kind,
                key.descending,
                a.sort_field(&key.field),
                b.sort_field(&key.field),
            );
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

fn present(value: Option<&Value>) -> Option<&Value> {
    match value {
        None | Some(Value::Null) => None,
        Some(v) => Some(v),
    }
}

fn classify<'a>(field: &str, values: impl Iterator<Item = Option<&'a Value>>) -> Result<SortKind> {
    let mut numbers = false;
    let mut numeric_strings = false;
    let mut texts = false;
    let mut bools = false;

    for value in values.filter_map(present) {
        match value {
            Value::Number(_) => numbers = true,
            Value::String(s) if parse_number(s).is_some() => numeric_strings = true,
            Value::String(_) => texts = true,
            Value::Bool(_) => bools = true,
            other => {
                return Err(Error::merge(format!(
                    "field '{}' holds a non-scalar value: {}",
                    field, other
                )))
            }
        }
    }

    let scalar = numbers || numeric_strings || texts;
    match (bools, scalar) {
        (true, true) => Err(Error::merge(format!(
            "field '{}' mixes booleans with other values",
            field
        ))),
        (true, false) => Ok(SortKind::Boolean),
        (false, false) => Ok(SortKind::Empty),
        (false, true) if texts && numbers => Err(Error::merge(format!(
            "field '{}' mixes numbers with non-numeric strings",
            field
        ))),
        (false, true) if texts => Ok(SortKind::Text),
        (false, true) => Ok(SortKind::Numeric),
    }
}

fn compare_field(kind: SortKind, descending: bool, a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (present(a), present(b)) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => {
            let ord = compare_present(kind, a, b);
            if descending {
                ord.reverse()
            } else {
                ord
            }
        }
    }
}

fn compare_present(kind: SortKind, a: &Value, b: &Value) -> Ordering {
    match kind {
        SortKind::Numeric => match (as_number(a), as_number(b)) {
            (Some(a), Some(b)) => a.cmp_with(&b),
            _ => Ordering::Equal,
        },
        SortKind::Text => value_text(a).cmp(&value_text(b)),
        SortKind::Boolean => a.as_bool().cmp(&b.as_bool()),
        SortKind::Empty => Ordering::Equal,
    }
}

#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn cmp_with(&self, other: &Number) -> Ordering {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a.cmp(b),
            _ => self
                .as_f64()
                .partial_cmp(&other.as_f64())
                .unwrap_or(Ordering::Equal),
        }
    }

    fn as_f64(&self) -> f64 {
        match *self {
            Number::Int(v) => v as f64,
            Number::Float(v) => v,
        }
    }
}

fn parse_number(s: &str) -> Option<Number> {
    let s = s.trim();
    if let Ok(v) = s.parse::<i64>() {
        return Some(Number::Int(v));
    }
    s.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(Number::Float)
}

fn as_number(value: &Value) -> Option<Number> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(Number::Int)
            .or_else(|| n.as_f64().map(Number::Float)),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

fn value_text(value: &Value) -> &str {
    value.as_str().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::SourceId;
    use serde_json::json;

    fn row(fields: Value) -> MergeRow {
        MergeRow::new(
            fields.as_object().cloned().unwrap_or_default(),
            SourceId::new("t", "c", 0),
        )
    }

    #[test]
    fn test_parse_signed_keys() {
        assert_eq!(OrderKey::parse("-time").unwrap(), OrderKey::desc("time"));
        assert_eq!(OrderKey::parse("+g").unwrap(), OrderKey::asc("g"));
        assert_eq!(OrderKey::parse("g").unwrap(), OrderKey::asc("g"));
        assert!(OrderKey::parse("-").is_err());
        assert_eq!(OrderKey::desc("time").to_string(), "-time");
    }

    #[test]
    fn test_mixed_directions_in_one_comparator() {
        let rows = [
            row(json!({"time": 100, "g": 1})),
            row(json!({"time": 100, "g": 2})),
            row(json!({"time": 90, "g": 5})),
        ];
        let plan = SortPlan::new(&[OrderKey::desc("time"), OrderKey::asc("g")], rows.iter()).unwrap();
        assert_eq!(plan.compare(&rows[0], &rows[1]), Ordering::Less);
        assert_eq!(plan.compare(&rows[1], &rows[2]), Ordering::Less);
        assert_eq!(plan.compare(&rows[2], &rows[0]), Ordering::Greater);
    }

    #[test]
    fn test_absent_sorts_last_in_both_directions() {
        let rows = [row(json!({"g": 1})), row(json!({"other": 1})), row(json!({"g": null}))];
        for key in [OrderKey::asc("g"), OrderKey::desc("g")] {
            let plan = SortPlan::new(&[key], rows.iter()).unwrap();
            assert_eq!(plan.compare(&rows[0], &rows[1]), Ordering::Less);
            assert_eq!(plan.compare(&rows[1], &rows[0]), Ordering::Greater);
            assert_eq!(plan.compare(&rows[1], &rows[2]), Ordering::Equal);
        }
    }

    #[test]
    fn test_numeric_strings_compare_numerically() {
        let rows = [row(json!({"n": "9"})), row(json!({"n": "10"})), row(json!({"n": 10.5}))];
        let plan = SortPlan::new(&[OrderKey::asc("n")], rows.iter()).unwrap();
        assert_eq!(plan.compare(&rows[0], &rows[1]), Ordering::Less);
        assert_eq!(plan.compare(&rows[1], &rows[2]), Ordering::Less);
    }

    #[test]
    fn test_text_compares_lexicographically() {
        let rows = [row(json!({"s": "b"})), row(json!({"s": "a"})), row(json!({"s": "10"}))];
        let plan = SortPlan::new(&[OrderKey::asc("s")], rows.iter()).unwrap();
        assert_eq!(plan.compare(&rows[0], &rows[1]), Ordering::Greater);
        assert_eq!(plan.compare(&rows[2], &rows[1]), Ordering::Less);
    }

    #[test]
    fn test_incomparable_kinds_fail_loudly() {
        let mixed = [row(json!({"k": 1})), row(json!({"k": "abc"}))];
        assert!(matches!(
            SortPlan::new(&[OrderKey::asc("k")], mixed.iter()),
            Err(Error::Merge(_))
        ));

        let bools = [row(json!({"k": true})), row(json!({"k": 1}))];
        assert!(SortPlan::new(&[OrderKey::asc("k")], bools.iter()).is_err());

        let nested = [row(json!({"k": {"a": 1}}))];
        assert!(SortPlan::new(&[OrderKey::asc("k")], nested.iter()).is_err());
    }

    #[test]
    fn test_large_integers_keep_precision() {
        let rows = [
            row(json!({"ts": 1_700_000_000_000_000_001i64})),
            row(json!({"ts": 1_700_000_000_000_000_002i64})),
        ];
        let plan = SortPlan::new(&[OrderKey::asc("ts")], rows.iter()).unwrap();
        assert_eq!(plan.compare(&rows[0], &rows[1]), Ordering::Less);
    }
}
