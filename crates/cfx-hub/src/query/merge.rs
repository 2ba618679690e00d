//! # Merge Engine
//!
//! k-way merge of per-source row batches under the caller's multi-key
//! order. Each batch is stably sorted first, so the backend's own order
//! only matters for ties; a min-heap then interleaves the batch heads.
//!
//! Ties on every sort key fall back to (source identity, position within
//! the source), which makes the output independent of the order in which
//! concurrent executions finished.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use cfx_core::{MergeRow, OrderKey, Result, SortPlan, SourceId};

/// Rows one physical execution contributed.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub source: SourceId,
    pub rows: Vec<MergeRow>,
    /// Backend-reported total for this source.
    pub total: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutput {
    pub rows: Vec<MergeRow>,
    /// Sum of every batch total, independent of the window.
    pub total: u64,
}

struct HeadEntry<'a> {
    plan: &'a SortPlan,
    row: &'a MergeRow,
    batch: usize,
    pos: usize,
}

impl PartialEq for HeadEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeadEntry<'_> {}

impl PartialOrd for HeadEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeadEntry<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.plan
            .compare(self.row, other.row)
            .then(self.batch.cmp(&other.batch))
            .then(self.pos.cmp(&other.pos))
    }
}

/// Merge `batches` into one ordered sequence and cut `[from, from + limit)`
/// out of it. `limit = None` keeps every row after `from`.
///
/// Fails with a merge error when a sort field holds values that cannot be
/// compared with each other.
pub fn merge(
    mut batches: Vec<SourceBatch>,
    order_by: &[OrderKey],
    from: usize,
    limit: Option<usize>,
) -> Result<MergeOutput> {
    let total = batches.iter().map(|b| b.total).sum();
    batches.sort_by(|a, b| a.source.cmp(&b.source));

    let plan = SortPlan::new(order_by, batches.iter().flat_map(|b| b.rows.iter()))?;
    for batch in &mut batches {
        batch.rows.sort_by(|a, b| plan.compare(a, b));
    }

    let need = limit.map(|l| from.saturating_add(l));
    let mut picks: Vec<(usize, usize)> = Vec::new();
    {
        let mut heap: BinaryHeap<Reverse<HeadEntry<'_>>> = batches
            .iter()
            .enumerate()
            .filter_map(|(batch, b)| {
                b.rows.first().map(|row| {
                    Reverse(HeadEntry {
                        plan: &plan,
                        row,
                        batch,
                        pos: 0,
                    })
                })
            })
            .collect();

        while let Some(Reverse(entry)) = heap.pop() {
            picks.push((entry.batch, entry.pos));
            if need.map_or(false, |n| picks.len() >= n) {
                break;
            }
            let next = entry.pos + 1;
            if let Some(row) = batches[entry.batch].rows.get(next) {
                heap.push(Reverse(HeadEntry {
                    plan: &plan,
                    row,
                    batch: entry.batch,
                    pos: next,
                }));
            }
        }
    }

    let mut slots: Vec<Vec<Option<MergeRow>>> = batches
        .into_iter()
        .map(|b| b.rows.into_iter().map(Some).collect())
        .collect();
    let rows = picks
        .into_iter()
        .skip(from)
        .filter_map(|(batch, pos)| slots[batch][pos].take())
        .collect();

    Ok(MergeOutput { rows, total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfx_core::Error;
    use serde_json::{json, Value};

    fn batch(table: &str, connection: &str, rows: Vec<Value>, total: u64) -> SourceBatch {
        let source = SourceId::new(table, connection, 0);
        SourceBatch {
            rows: rows
                .into_iter()
                .map(|v| MergeRow::new(v.as_object().cloned().unwrap(), source.clone()))
                .collect(),
            source,
            total,
        }
    }

    fn keys(order: &[&str]) -> Vec<OrderKey> {
        order.iter().map(|k| OrderKey::parse(k).unwrap()).collect()
    }

    fn column(rows: &[MergeRow], field: &str) -> Vec<Value> {
        rows.iter()
            .map(|r| r.get(field).cloned().unwrap_or(Value::Null))
            .collect()
    }

    #[test]
    fn test_cross_source_order_with_mixed_directions() {
        let a = batch(
            "log.a",
            "es://a",
            (0..4).rev().map(|i| json!({"time": 100, "g": 1, "i": i})).collect(),
            4,
        );
        let b = batch(
            "log.b",
            "es://b",
            vec![
                json!({"time": 100, "g": 3, "i": 2}),
                json!({"time": 100, "g": 2, "i": 3}),
                json!({"time": 100, "g": 3, "i": 0}),
                json!({"time": 100, "g": 2, "i": 1}),
                json!({"time": 100, "g": 3, "i": 1}),
                json!({"time": 100, "g": 2, "i": 2}),
            ],
            6,
        );
        let out = merge(vec![a, b], &keys(&["-time", "-g", "-i"]), 0, None).unwrap();
        let pairs: Vec<_> = out
            .rows
            .iter()
            .map(|r| (r.get("g").cloned().unwrap(), r.get("i").cloned().unwrap()))
            .collect();
        assert_eq!(
            pairs[..7],
            [
                (json!(3), json!(2)),
                (json!(3), json!(1)),
                (json!(3), json!(0)),
                (json!(2), json!(3)),
                (json!(2), json!(2)),
                (json!(2), json!(1)),
                (json!(1), json!(3)),
            ]
        );
        assert_eq!(out.total, 10);
    }

    #[test]
    fn test_window_applies_after_global_order() {
        let a = batch("t", "c1", vec![json!({"n": 1}), json!({"n": 4}), json!({"n": 5})], 30);
        let b = batch("t", "c2", vec![json!({"n": 2}), json!({"n": 3}), json!({"n": 6})], 12);
        let out = merge(vec![a, b], &keys(&["n"]), 2, Some(3)).unwrap();
        assert_eq!(column(&out.rows, "n"), vec![json!(3), json!(4), json!(5)]);
        assert_eq!(out.total, 42);
    }

    #[test]
    fn test_ties_break_by_source_then_position() {
        let late = batch("t", "zz", vec![json!({"k": 1, "id": "z0"}), json!({"k": 1, "id": "z1"})], 2);
        let early = batch("t", "aa", vec![json!({"k": 1, "id": "a0"})], 1);
        let first = merge(vec![late.clone(), early.clone()], &keys(&["k"]), 0, None).unwrap();
        let second = merge(vec![early, late], &keys(&["k"]), 0, None).unwrap();
        assert_eq!(column(&first.rows, "id"), vec![json!("a0"), json!("z0"), json!("z1")]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_differing_schemas_keep_rows() {
        let a = batch("t", "c1", vec![json!({"time": 2, "host": "a"})], 1);
        let b = batch("t", "c2", vec![json!({"msg": "no time"}), json!({"time": 3})], 2);
        let out = merge(vec![a, b], &keys(&["-time"]), 0, None).unwrap();
        assert_eq!(column(&out.rows, "time"), vec![json!(3), json!(2), Value::Null]);
        assert_eq!(out.rows[2].get("msg"), Some(&json!("no time")));
    }

    #[test]
    fn test_incomparable_keys_fail_loudly() {
        let a = batch("t", "c1", vec![json!({"k": 1})], 1);
        let b = batch("t", "c2", vec![json!({"k": "abc"})], 1);
        assert!(matches!(
            merge(vec![a, b], &keys(&["k"]), 0, None),
            Err(Error::Merge(_))
        ));
    }

    #[test]
    fn test_window_past_the_end_is_empty() {
        let a = batch("t", "c1", vec![json!({"n": 1})], 1);
        let out = merge(vec![a], &keys(&["n"]), 5, Some(5)).unwrap();
        assert!(out.rows.is_empty());
        assert_eq!(out.total, 1);
    }
}
