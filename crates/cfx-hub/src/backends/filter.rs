//! # Row Filter
//!
//! Evaluates pushed-down conditions and the time range against raw rows
//! for the in-memory backends.

use cfx_core::{CompareOp, Condition, RowMap, SortPlan};
use chrono::DateTime;
use regex::Regex;
use serde_json::Value;

use super::BackendError;
use crate::query::PhysicalQuery;

/// Filter `rows` by `query` and order them by its order-by. Each match
/// keeps its position in `rows`, which the in-memory backends use as the
/// document id. Ties keep storage order.
pub fn select<'a>(
    rows: &'a [RowMap],
    query: &PhysicalQuery,
    time_field: &str,
) -> Result<Vec<(usize, &'a RowMap)>, BackendError> {
    let filter = RowFilter::new(query, time_field)?;
    let mut matched: Vec<(usize, &RowMap)> = rows
        .iter()
        .enumerate()
        .filter(|(_, row)| filter.matches(row))
        .collect();
    if !query.order_by.is_empty() {
        let plan = SortPlan::new(&query.order_by, matched.iter().map(|(_, row)| *row))?;
        matched.sort_by(|a, b| plan.compare(a.1, b.1));
    }
    Ok(matched)
}

/// Keep only the requested columns; no columns keeps the whole row.
pub fn project(row: &RowMap, fields: &[String]) -> RowMap {
    if fields.is_empty() {
        return row.clone();
    }
    fields
        .iter()
        .filter_map(|f| row.get(f).map(|v| (f.clone(), v.clone())))
        .collect()
}

/// Conditions of one physical query, with regexes compiled once.
pub struct RowFilter {
    conditions: Vec<(Condition, Option<Regex>)>,
    time_field: String,
    start_ms: Option<i64>,
    end_ms: Option<i64>,
}

impl RowFilter {
    pub fn new(query: &PhysicalQuery, time_field: &str) -> Result<Self, regex::Error> {
        let conditions = query
            .conditions
            .iter()
            .map(|cond| {
                let regex = match cond.op {
                    CompareOp::Matches => Some(Regex::new(&value_to_string(&cond.value))?),
                    _ => None,
                };
                Ok((cond.clone(), regex))
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;

        Ok(Self {
            conditions,
            time_field: time_field.to_string(),
            start_ms: query.start_ms,
            end_ms: query.end_ms,
        })
    }

    pub fn matches(&self, row: &RowMap) -> bool {
        self.in_time_range(row)
            && self
                .conditions
                .iter()
                .all(|(cond, regex)| evaluate_condition(row, cond, regex.as_ref()))
    }

    /// Inclusive start, exclusive end. Rows without a readable time are
    /// dropped only when a range is requested.
    fn in_time_range(&self, row: &RowMap) -> bool {
        if self.start_ms.is_none() && self.end_ms.is_none() {
            return true;
        }
        let Some(ts) = extract_field(row, &self.time_field).and_then(|v| timestamp_ms(&v)) else {
            return false;
        };
        self.start_ms.map_or(true, |s| ts >= s) && self.end_ms.map_or(true, |e| ts < e)
    }
}

/// Epoch milliseconds from a number or an RFC 3339 string.
pub fn timestamp_ms(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse::<i64>().ok().or_else(|| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.timestamp_millis())
        }),
        _ => None,
    }
}

fn evaluate_condition(row: &RowMap, cond: &Condition, regex: Option<&Regex>) -> bool {
    match extract_field(row, &cond.field) {
        Some(val) => compare(&val, cond.op, &cond.value, regex),
        // Absent fields only satisfy "not equal".
        None => cond.op == CompareOp::Neq,
    }
}

/// Top-level key first, then a dotted path into nested objects
/// (`"resource.host"` reads `/resource/host`).
fn extract_field(row: &RowMap, field: &str) -> Option<Value> {
    if let Some(val) = row.get(field) {
        return Some(val.clone());
    }
    let pointer = if field.starts_with('/') {
        field.to_string()
    } else {
        format!("/{}", field.replace('.', "/"))
    };
    let mut parts = pointer.trim_start_matches('/').splitn(2, '/');
    let head = parts.next()?;
    let rest = parts.next()?;
    row.get(head)?.pointer(&format!("/{}", rest)).cloned()
}

fn compare(a: &Value, op: CompareOp, b: &Value, regex: Option<&Regex>) -> bool {
    match op {
        CompareOp::Eq => values_equal(a, b),
        CompareOp::Neq => !values_equal(a, b),
        CompareOp::Gt => numeric_cmp(a, b).map_or(false, |o| o == std::cmp::Ordering::Greater),
        CompareOp::Gte => numeric_cmp(a, b).map_or(false, |o| o != std::cmp::Ordering::Less),
        CompareOp::Lt => numeric_cmp(a, b).map_or(false, |o| o == std::cmp::Ordering::Less),
        CompareOp::Lte => numeric_cmp(a, b).map_or(false, |o| o != std::cmp::Ordering::Greater),
        CompareOp::Contains => value_to_string(a).contains(&value_to_string(b)),
        CompareOp::StartsWith => value_to_string(a).starts_with(&value_to_string(b)),
        CompareOp::Matches => regex.map_or(false, |re| re.is_match(&value_to_string(a))),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(an), Some(bn)) = (value_to_f64(a), value_to_f64(b)) {
        return (an - bn).abs() < f64::EPSILON;
    }
    value_to_string(a) == value_to_string(b)
}

fn numeric_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    let an = value_to_f64(a)?;
    let bn = value_to_f64(b)?;
    an.partial_cmp(&bn)
}

fn value_to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::tests::physical;
    use serde_json::json;

    fn row(value: Value) -> RowMap {
        value.as_object().cloned().unwrap_or_default()
    }

    fn cond(field: &str, op: CompareOp, value: Value) -> Condition {
        Condition {
            field: field.into(),
            op,
            value,
        }
    }

    #[test]
    fn test_conditions_and_nested_fields() {
        let mut q = physical("log.app", "mem://a");
        q.conditions = vec![
            cond("status", CompareOp::Gte, json!(500)),
            cond("resource.host", CompareOp::StartsWith, json!("web-")),
        ];
        let filter = RowFilter::new(&q, "time").unwrap();
        assert!(filter.matches(&row(json!({"status": 503, "resource": {"host": "web-1"}}))));
        assert!(!filter.matches(&row(json!({"status": 200, "resource": {"host": "web-1"}}))));
        assert!(!filter.matches(&row(json!({"status": 503}))));
    }

    #[test]
    fn test_regex_condition() {
        let mut q = physical("log.app", "mem://a");
        q.conditions = vec![cond("path", CompareOp::Matches, json!("^/api/v[0-9]+/"))];
        let filter = RowFilter::new(&q, "time").unwrap();
        assert!(filter.matches(&row(json!({"path": "/api/v2/users"}))));
        assert!(!filter.matches(&row(json!({"path": "/static/app.js"}))));

        q.conditions = vec![cond("path", CompareOp::Matches, json!("(unclosed"))];
        assert!(RowFilter::new(&q, "time").is_err());
    }

    #[test]
    fn test_time_range_is_half_open() {
        let mut q = physical("log.app", "mem://a");
        q.start_ms = Some(100);
        q.end_ms = Some(200);
        let filter = RowFilter::new(&q, "time").unwrap();
        assert!(filter.matches(&row(json!({"time": 100}))));
        assert!(filter.matches(&row(json!({"time": "150"}))));
        assert!(!filter.matches(&row(json!({"time": 200}))));
        assert!(!filter.matches(&row(json!({"other": 1}))));
    }

    #[test]
    fn test_select_filters_and_orders() {
        let rows = vec![
            row(json!({"time": 1, "level": "info"})),
            row(json!({"time": 3, "level": "error"})),
            row(json!({"time": 2, "level": "error"})),
        ];
        let mut q = physical("log.app", "mem://a");
        q.conditions = vec![cond("level", CompareOp::Eq, json!("error"))];
        q.order_by = vec![cfx_core::OrderKey::desc("time")];
        let picked: Vec<usize> = select(&rows, &q, "time")
            .unwrap()
            .into_iter()
            .map(|(i, _)| i)
            .collect();
        assert_eq!(picked, vec![1, 2]);

        let projected = project(&rows[1], &["level".to_string(), "missing".to_string()]);
        assert_eq!(Value::Object(projected), json!({"level": "error"}));
    }

    #[test]
    fn test_rfc3339_timestamps() {
        assert_eq!(timestamp_ms(&json!("1970-01-01T00:00:01Z")), Some(1000));
        assert_eq!(timestamp_ms(&json!(true)), None);
    }
}
