//! # In-Memory SQL Backend
//!
//! Offset-paged reference backend behaving like a columnar SQL engine:
//! `ORDER BY ... LIMIT size OFFSET n` over fixture tables.

use std::collections::HashMap;

use cfx_core::{Continuation, ContinuationHint, RowMap, StorageType};
use tokio::sync::mpsc;

use super::filter::{project, select};
use super::{BackendError, BackendInfo, BackendKind, RawOutcome, RawQueryBackend, RawRow};
use crate::query::PhysicalQuery;

pub struct MemorySqlBackend {
    connection: String,
    storage: StorageType,
    tables: HashMap<String, Vec<RowMap>>,
    time_field: String,
    created_at: String,
}

impl MemorySqlBackend {
    pub fn new(connection: impl Into<String>, tables: HashMap<String, Vec<RowMap>>) -> Self {
        Self {
            connection: connection.into(),
            storage: StorageType::Sql,
            tables,
            time_field: "time".into(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Serve as a time-series store instead of a SQL engine. Pagination is
    /// the same.
    pub fn as_time_series(mut self) -> Self {
        self.storage = StorageType::TimeSeries;
        self
    }

    pub fn with_time_field(mut self, field: impl Into<String>) -> Self {
        self.time_field = field.into();
        self
    }
}

#[async_trait::async_trait]
impl RawQueryBackend for MemorySqlBackend {
    fn connection(&self) -> &str {
        &self.connection
    }

    fn storage(&self) -> StorageType {
        self.storage
    }

    async fn raw_query(
        &self,
        query: &PhysicalQuery,
        rows: mpsc::Sender<RawRow>,
    ) -> Result<RawOutcome, BackendError> {
        let offset = match query.slice.continuation {
            Continuation::Offset { offset } => offset,
            Continuation::Scroll { .. } => {
                return Err(format!("{} does not issue scroll handles", self.connection).into())
            }
        };
        let table = self
            .tables
            .get(&query.backend_table)
            .ok_or_else(|| format!("table '{}' does not exist", query.backend_table))?;

        let matched = select(table, query, &self.time_field)?;
        let matched_total = matched.len();

        let mut sent = 0usize;
        for (_, row) in matched.into_iter().skip(offset).take(query.size) {
            let raw = RawRow {
                fields: project(row, &query.fields),
                doc_id: None,
            };
            if rows.send(raw).await.is_err() {
                break;
            }
            sent += 1;
        }

        // Scroll callers count the page; offset callers want the full match count.
        let total = if query.scroll_secs.is_some() {
            sent
        } else {
            matched_total
        };
        let hint = if sent > 0 {
            ContinuationHint::NextOffset(offset + sent)
        } else {
            ContinuationHint::None
        };
        tracing::debug!(
            connection = %self.connection,
            table = %query.backend_table,
            offset,
            sent,
            "sql page served"
        );
        Ok(RawOutcome {
            total: total as u64,
            hint,
        })
    }

    fn info(&self) -> BackendInfo {
        let mut tables: Vec<String> = self.tables.keys().cloned().collect();
        tables.sort();
        BackendInfo {
            connection: self.connection.clone(),
            kind: BackendKind::MemorySql,
            storage: self.storage,
            tables,
            created_at: self.created_at.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::tests::physical;
    use cfx_core::OrderKey;
    use serde_json::json;

    fn backend() -> MemorySqlBackend {
        let rows: Vec<RowMap> = (0..5)
            .map(|i| json!({"time": i, "msg": format!("m{}", i)}).as_object().cloned().unwrap())
            .collect();
        MemorySqlBackend::new("sql://local", HashMap::from([("logs".to_string(), rows)]))
    }

    async fn run(backend: &MemorySqlBackend, query: &PhysicalQuery) -> (Vec<RawRow>, RawOutcome) {
        let (tx, mut rx) = mpsc::channel(16);
        let outcome = backend.raw_query(query, tx).await.unwrap();
        let mut rows = Vec::new();
        while let Some(r) = rx.recv().await {
            rows.push(r);
        }
        (rows, outcome)
    }

    #[tokio::test]
    async fn test_offset_page() {
        let backend = backend();
        let mut q = physical("log.app", "sql://local");
        q.backend_table = "logs".into();
        q.order_by = vec![OrderKey::desc("time")];
        q.size = 2;
        q.slice.continuation = Continuation::Offset { offset: 1 };
        q.fields = vec!["time".into()];

        let (rows, outcome) = run(&backend, &q).await;
        let times: Vec<_> = rows.iter().map(|r| r.fields["time"].clone()).collect();
        assert_eq!(times, vec![json!(3), json!(2)]);
        assert!(rows.iter().all(|r| r.fields.get("msg").is_none()));
        assert_eq!(outcome.total, 5);
        assert_eq!(outcome.hint, ContinuationHint::NextOffset(3));
    }

    #[tokio::test]
    async fn test_scroll_total_counts_the_page() {
        let backend = backend();
        let mut q = physical("log.app", "sql://local");
        q.backend_table = "logs".into();
        q.size = 10;
        q.scroll_secs = Some(60);
        q.slice.continuation = Continuation::Offset { offset: 4 };
        let (rows, outcome) = run(&backend, &q).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(outcome.total, 1);

        q.slice.continuation = Continuation::Offset { offset: 40 };
        let (rows, outcome) = run(&backend, &q).await;
        assert!(rows.is_empty());
        assert_eq!(outcome, RawOutcome::default());
    }

    #[tokio::test]
    async fn test_unknown_table_and_scroll_handles_fail() {
        let backend = backend();
        let (tx, _rx) = mpsc::channel(1);
        let q = physical("log.app", "sql://local");
        assert!(backend.raw_query(&q, tx.clone()).await.is_err());

        let mut q = physical("log.app", "sql://local");
        q.backend_table = "logs".into();
        q.slice.continuation = Continuation::Scroll { scroll_id: None };
        assert!(backend.raw_query(&q, tx).await.is_err());
    }
}
