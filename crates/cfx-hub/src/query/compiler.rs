//! # Query Compiler
//!
//! Turns one [`LogicalQuery`] into physical queries grouped by backend
//! connection. Compilation is pure: it reads the table resolver and the
//! scroll session it is handed, and nothing is written until the result is
//! executed.

use std::collections::BTreeMap;
use std::sync::Arc;

use cfx_core::{Error, LogicalQuery, OrderKey, Result, SubQuery};
use cfx_session::{ScrollSession, SlicePlanner, SliceTarget};

use super::{parse_time_expr, PhysicalQuery};
use crate::backends::registry::{TableResolver, TableTarget};

/// Physical queries plus the merge window that reassembles them.
///
/// Outside scroll mode every physical query is ordered by the merge order
/// whenever one is given, so a source's head is its head under the final
/// ordering too. A sub-query's own `order_by` only applies to scroll pages
/// or when the logical query has no order of its own.
#[derive(Debug, Clone, Default)]
pub struct CompiledQuery {
    /// Physical queries keyed by backend connection.
    pub groups: BTreeMap<String, Vec<PhysicalQuery>>,
    /// Rows to skip after the global order is established.
    pub merge_from: usize,
    /// Rows to keep after skipping; `None` keeps everything fetched.
    pub merge_limit: Option<usize>,
    pub order_by: Vec<OrderKey>,
}

impl CompiledQuery {
    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn physical_queries(&self) -> impl Iterator<Item = &PhysicalQuery> {
        self.groups.values().flatten()
    }
}

/// Shared fields resolved for one sub-query.
struct Effective<'a> {
    sub: &'a SubQuery,
    start_ms: Option<i64>,
    end_ms: Option<i64>,
    timezone: Option<String>,
    order_by: Vec<OrderKey>,
    limit: usize,
    from: usize,
    targets: Vec<TableTarget>,
}

pub struct QueryCompiler {
    resolver: Arc<dyn TableResolver>,
    planner: SlicePlanner,
}

impl QueryCompiler {
    pub fn new(resolver: Arc<dyn TableResolver>, planner: SlicePlanner) -> Self {
        Self { resolver, planner }
    }

    /// Compile `query` against the current `session`. `now_ms` anchors
    /// relative time expressions.
    pub fn compile(
        &self,
        query: &LogicalQuery,
        session: &ScrollSession,
        now_ms: i64,
    ) -> Result<CompiledQuery> {
        query.validate()?;

        let subs = query
            .queries
            .iter()
            .map(|sub| self.effective(query, sub, now_ms))
            .collect::<Result<Vec<_>>>()?;

        let mut compiled = CompiledQuery {
            order_by: query.order_by.clone(),
            ..Default::default()
        };

        if query.is_scroll() {
            // Every page is returned whole; `limit` is the per-slice page size.
            for sub in &subs {
                for target in &sub.targets {
                    let slices = self.planner.plan(
                        SliceTarget {
                            table_id: &sub.sub.table_id,
                            connection: &target.connection,
                            storage: target.storage,
                            shards: target.shards,
                        },
                        session,
                        sub.limit,
                    )?;
                    for slice in slices {
                        let physical = build(
                            sub,
                            target,
                            &sub.order_by,
                            sub.limit,
                            query.scroll_secs,
                            slice,
                        );
                        push(&mut compiled, physical);
                    }
                }
            }
            return Ok(compiled);
        }

        let fan_out: usize = subs.iter().map(|s| s.targets.len()).sum();
        if fan_out == 1 {
            // One source: push the window straight down.
            let sub = &subs[0];
            let target = &sub.targets[0];
            let slice = self.planner.single(target.storage, sub.from);
            let order = window_order(query, sub);
            push(&mut compiled, build(sub, target, order, sub.limit, None, slice));
            compiled.merge_limit = Some(sub.limit);
        } else {
            // Several sources: every one fetches its head up to the window end
            // and the window is cut after the global merge.
            for sub in &subs {
                if sub.from != query.from {
                    return Err(Error::compile(format!(
                        "'{}' sets its own from ({}); a query over several sources pages with the shared from ({})",
                        sub.sub.table_id, sub.from, query.from
                    )));
                }
                let order = window_order(query, sub);
                let size = query.from.saturating_add(sub.limit);
                for target in &sub.targets {
                    let slice = self.planner.single(target.storage, 0);
                    push(&mut compiled, build(sub, target, order, size, None, slice));
                }
            }
            compiled.merge_from = query.from;
            compiled.merge_limit = Some(query.limit);
        }
        Ok(compiled)
    }

    fn effective<'a>(
        &self,
        query: &LogicalQuery,
        sub: &'a SubQuery,
        now_ms: i64,
    ) -> Result<Effective<'a>> {
        let targets = self.resolver.resolve(&sub.table_id, &query.tenant)?;
        if targets.is_empty() {
            return Err(Error::compile(format!(
                "table '{}' resolves to no backend tables",
                sub.table_id
            )));
        }

        let timezone = sub.timezone.clone().or_else(|| query.timezone.clone());
        let time = |own: &Option<String>, shared: &Option<String>| {
            own.as_deref()
                .or(shared.as_deref())
                .map(|raw| parse_time_expr(raw, now_ms, timezone.as_deref()))
                .transpose()
        };
        let start_ms = time(&sub.start, &query.start)?;
        let end_ms = time(&sub.end, &query.end)?;
        if let (Some(start), Some(end)) = (start_ms, end_ms) {
            if start > end {
                return Err(Error::compile(format!(
                    "time range of '{}' starts after it ends ({} > {})",
                    sub.table_id, start, end
                )));
            }
        }

        let limit = sub.limit.unwrap_or(query.limit);
        if limit == 0 {
            return Err(Error::compile(format!(
                "limit of '{}' must be greater than zero",
                sub.table_id
            )));
        }

        Ok(Effective {
            sub,
            start_ms,
            end_ms,
            order_by: if sub.order_by.is_empty() {
                query.order_by.clone()
            } else {
                sub.order_by.clone()
            },
            timezone,
            limit,
            from: sub.from.unwrap_or(query.from),
            targets,
        })
    }
}

/// Order a windowed physical query by the merge order when there is one.
fn window_order<'a>(query: &'a LogicalQuery, sub: &'a Effective<'_>) -> &'a [OrderKey] {
    if query.order_by.is_empty() {
        &sub.order_by
    } else {
        &query.order_by
    }
}

fn build(
    sub: &Effective<'_>,
    target: &TableTarget,
    order_by: &[OrderKey],
    size: usize,
    scroll_secs: Option<u64>,
    slice: cfx_core::SliceInfo,
) -> PhysicalQuery {
    PhysicalQuery {
        table_id: sub.sub.table_id.clone(),
        backend_table: target.backend_table.clone(),
        connection: target.connection.clone(),
        storage: target.storage,
        conditions: sub.sub.conditions.clone(),
        fields: sub.sub.fields.clone(),
        start_ms: sub.start_ms,
        end_ms: sub.end_ms,
        timezone: sub.timezone.clone(),
        order_by: order_by.to_vec(),
        size,
        scroll_secs,
        slice,
    }
}

fn push(compiled: &mut CompiledQuery, physical: PhysicalQuery) {
    compiled
        .groups
        .entry(physical.connection.clone())
        .or_default()
        .push(physical);
}
