//! # Backend Execution Adapter
//!
//! Runs one [`PhysicalQuery`] against its backend, drains the emitted rows
//! through a bounded queue and turns the backend's continuation hint into
//! the slice's next [`ResultTableOption`]. Nothing is persisted here; the
//! engine commits the options once the whole page has been gathered.

use cfx_core::{Error, MergeRow, ResultTableOption, SliceStatus, SourceId};
use cfx_session::advance;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::PhysicalQuery;
use crate::backends::{RawQueryBackend, RawRow};

/// What one physical execution produced.
#[derive(Debug)]
pub struct SliceExecution {
    pub source: SourceId,
    /// At most `size` rows, in backend order.
    pub rows: Vec<MergeRow>,
    pub total: u64,
    /// The slice's cursor after this call (`failed` on backend error).
    pub option: ResultTableOption,
    pub error: Option<Error>,
}

#[derive(Debug, Clone, Copy)]
pub struct SliceExecutor {
    row_buffer: usize,
}

impl SliceExecutor {
    pub fn new(row_buffer: usize) -> Self {
        Self {
            row_buffer: row_buffer.max(1),
        }
    }

    /// Execute `query`. Backend failures come back inside the
    /// [`SliceExecution`] as a `failed` option.
    pub async fn execute(
        &self,
        backend: &dyn RawQueryBackend,
        query: &PhysicalQuery,
    ) -> SliceExecution {
        let source = query.source();
        let (tx, mut rx) = mpsc::channel::<RawRow>(self.row_buffer);

        let drain = async {
            let mut rows = Vec::with_capacity(query.size.min(self.row_buffer));
            let mut dropped = 0usize;
            while let Some(raw) = rx.recv().await {
                if rows.len() < query.size {
                    rows.push(MergeRow::new(raw.fields, source.clone()).with_doc_id(raw.doc_id));
                } else {
                    dropped += 1;
                }
            }
            (rows, dropped)
        };
        let (outcome, (rows, dropped)) = tokio::join!(backend.raw_query(query, tx), drain);

        if dropped > 0 {
            warn!(
                table_id = %query.table_id,
                connection = %query.connection,
                slice = query.slice.slice_index,
                size = query.size,
                dropped,
                "backend returned more rows than requested"
            );
        }

        match outcome {
            Ok(outcome) => {
                let option = advance(
                    &query.slice,
                    &query.table_id,
                    &query.connection,
                    &outcome.hint,
                    rows.len(),
                    query.size,
                );
                debug!(
                    table_id = %query.table_id,
                    connection = %query.connection,
                    slice = query.slice.slice_index,
                    rows = rows.len(),
                    total = outcome.total,
                    status = %option.status,
                    "slice executed"
                );
                SliceExecution {
                    source,
                    rows,
                    total: outcome.total,
                    option,
                    error: None,
                }
            }
            Err(e) => {
                let message = e.to_string();
                warn!(
                    table_id = %query.table_id,
                    connection = %query.connection,
                    slice = query.slice.slice_index,
                    error = %message,
                    "slice failed"
                );
                let option = query
                    .slice
                    .to_option(&query.table_id, &query.connection, SliceStatus::Running)
                    .into_failed(message.clone());
                SliceExecution {
                    source,
                    rows: Vec::new(),
                    total: 0,
                    option,
                    error: Some(Error::backend(&query.table_id, &query.connection, message)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendError, BackendInfo, BackendKind, RawOutcome};
    use crate::query::tests::physical;
    use cfx_core::{Continuation, ContinuationHint, StorageType};
    use serde_json::json;

    /// Emits `rows` numbered rows, then reports `hint`, or fails.
    struct Scripted {
        rows: usize,
        hint: ContinuationHint,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl RawQueryBackend for Scripted {
        fn connection(&self) -> &str {
            "mock://scripted"
        }

        fn storage(&self) -> StorageType {
            StorageType::Sql
        }

        async fn raw_query(
            &self,
            _query: &PhysicalQuery,
            rows: mpsc::Sender<RawRow>,
        ) -> std::result::Result<RawOutcome, BackendError> {
            for n in 0..self.rows {
                let fields = json!({"n": n}).as_object().cloned().unwrap_or_default();
                if rows.send(RawRow { fields, doc_id: None }).await.is_err() {
                    break;
                }
            }
            if self.fail {
                return Err("connection reset".into());
            }
            Ok(RawOutcome {
                total: 99,
                hint: self.hint.clone(),
            })
        }

        fn info(&self) -> BackendInfo {
            BackendInfo {
                connection: "mock://scripted".into(),
                kind: BackendKind::MemorySql,
                storage: StorageType::Sql,
                tables: Vec::new(),
                created_at: String::new(),
            }
        }
    }

    #[tokio::test]
    async fn test_drains_through_small_buffer_and_caps_rows() {
        let backend = Scripted {
            rows: 15,
            hint: ContinuationHint::NextOffset(15),
            fail: false,
        };
        let query = physical("log.app", "mock://scripted");
        let exec = SliceExecutor::new(2).execute(&backend, &query).await;
        assert_eq!(exec.rows.len(), 10);
        assert_eq!(exec.total, 99);
        assert_eq!(exec.option.status, SliceStatus::Running);
        assert_eq!(exec.option.continuation, Continuation::Offset { offset: 10 });
    }

    #[tokio::test]
    async fn test_empty_page_completes_slice() {
        let backend = Scripted {
            rows: 0,
            hint: ContinuationHint::None,
            fail: false,
        };
        let query = physical("log.app", "mock://scripted");
        let exec = SliceExecutor::new(8).execute(&backend, &query).await;
        assert!(exec.error.is_none());
        assert_eq!(exec.option.key(), query.option_key());
        assert_eq!(exec.option.status, SliceStatus::Completed);
    }

    #[tokio::test]
    async fn test_backend_failure_keeps_cursor_and_marks_failed() {
        let backend = Scripted {
            rows: 3,
            hint: ContinuationHint::None,
            fail: true,
        };
        let mut query = physical("log.app", "mock://scripted");
        query.slice.continuation = Continuation::Offset { offset: 40 };
        let exec = SliceExecutor::new(8).execute(&backend, &query).await;

        assert!(exec.rows.is_empty());
        assert!(matches!(exec.error, Some(Error::Backend { .. })));
        assert_eq!(exec.option.status, SliceStatus::Failed);
        assert_eq!(exec.option.continuation, Continuation::Offset { offset: 40 });
        assert!(exec.option.error.as_deref().unwrap_or_default().contains("reset"));
    }
}
