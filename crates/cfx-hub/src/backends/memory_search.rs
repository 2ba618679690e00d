//! # In-Memory Search Backend
//!
//! Reference backend with search-engine pagination: parallel slices
//! (a document belongs to slice `id % max`) and stateful scroll contexts
//! addressed by opaque handles. Contexts expire after their keep-alive and
//! are dropped once a page comes back empty.

use std::collections::HashMap;
use std::time::Duration;

use cfx_core::{Continuation, ContinuationHint, RowMap, StorageType};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use super::filter::{project, select};
use super::{BackendError, BackendInfo, BackendKind, RawOutcome, RawQueryBackend, RawRow};
use crate::query::PhysicalQuery;

const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

struct ScrollContext {
    /// Remaining hits as (doc id, projected row).
    hits: Vec<(String, RowMap)>,
    position: usize,
    expires_at: Instant,
}

pub struct MemorySearchBackend {
    connection: String,
    shards: usize,
    tables: HashMap<String, Vec<RowMap>>,
    time_field: String,
    scrolls: Mutex<HashMap<String, ScrollContext>>,
    created_at: String,
}

impl MemorySearchBackend {
    pub fn new(connection: impl Into<String>, tables: HashMap<String, Vec<RowMap>>) -> Self {
        Self {
            connection: connection.into(),
            shards: 1,
            tables,
            time_field: "time".into(),
            scrolls: Mutex::new(HashMap::new()),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards.max(1);
        self
    }

    pub fn with_time_field(mut self, field: impl Into<String>) -> Self {
        self.time_field = field.into();
        self
    }

    /// Open scroll contexts.
    pub async fn open_scrolls(&self) -> usize {
        self.scrolls.lock().await.len()
    }

    fn table(&self, name: &str) -> Result<&[RowMap], BackendError> {
        self.tables
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| format!("index '{}' does not exist", name).into())
    }

    /// Hits of one slice, in query order.
    fn slice_hits(&self, query: &PhysicalQuery) -> Result<Vec<(String, RowMap)>, BackendError> {
        let table = self.table(&query.backend_table)?;
        let slice_max = query.slice.slice_max.max(1);
        let slice_index = query.slice.slice_index;
        Ok(select(table, query, &self.time_field)?
            .into_iter()
            .filter(|(id, _)| id % slice_max == slice_index)
            .map(|(id, row)| (id.to_string(), project(row, &query.fields)))
            .collect())
    }

    /// Next page of an existing or fresh scroll, plus the slice total.
    async fn scroll_page(
        &self,
        query: &PhysicalQuery,
        scroll_id: Option<&str>,
    ) -> Result<(String, Vec<(String, RowMap)>, usize), BackendError> {
        let keep_alive = query
            .scroll_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_KEEP_ALIVE);
        let now = Instant::now();
        let mut scrolls = self.scrolls.lock().await;
        scrolls.retain(|_, ctx| ctx.expires_at > now);

        let id = match scroll_id {
            Some(id) => {
                if !scrolls.contains_key(id) {
                    return Err(format!("no search context found for id [{}]", id).into());
                }
                id.to_string()
            }
            None => {
                let id = format!("scroll-{}", uuid::Uuid::new_v4().as_simple());
                let hits = self.slice_hits(query)?;
                scrolls.insert(
                    id.clone(),
                    ScrollContext {
                        hits,
                        position: 0,
                        expires_at: now,
                    },
                );
                id
            }
        };

        let ctx = scrolls
            .get_mut(&id)
            .ok_or_else(|| format!("no search context found for id [{}]", id))?;
        let end = (ctx.position + query.size).min(ctx.hits.len());
        let page = ctx.hits[ctx.position..end].to_vec();
        ctx.position = end;
        ctx.expires_at = now + keep_alive;
        let total = ctx.hits.len();

        if page.is_empty() {
            scrolls.remove(&id);
        }
        Ok((id, page, total))
    }
}

#[async_trait::async_trait]
impl RawQueryBackend for MemorySearchBackend {
    fn connection(&self) -> &str {
        &self.connection
    }

    fn storage(&self) -> StorageType {
        StorageType::Search
    }

    fn shards(&self) -> Option<usize> {
        Some(self.shards)
    }

    async fn raw_query(
        &self,
        query: &PhysicalQuery,
        rows: mpsc::Sender<RawRow>,
    ) -> Result<RawOutcome, BackendError> {
        let (page, total, hint) = match &query.slice.continuation {
            Continuation::Scroll { scroll_id } => {
                let (id, page, total) = self.scroll_page(query, scroll_id.as_deref()).await?;
                (page, total, ContinuationHint::Handle(id))
            }
            Continuation::Offset { offset } => {
                let hits = self.slice_hits(query)?;
                let total = hits.len();
                let page: Vec<_> = hits.into_iter().skip(*offset).take(query.size).collect();
                let hint = if page.is_empty() {
                    ContinuationHint::None
                } else {
                    ContinuationHint::NextOffset(offset + page.len())
                };
                (page, total, hint)
            }
        };

        tracing::debug!(
            connection = %self.connection,
            index = %query.backend_table,
            slice = query.slice.slice_index,
            hits = page.len(),
            "search page served"
        );
        for (doc_id, fields) in page {
            let raw = RawRow {
                fields,
                doc_id: Some(doc_id),
            };
            if rows.send(raw).await.is_err() {
                break;
            }
        }
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
            kind: BackendKind::MemorySearch,
            storage: StorageType::Search,
            tables,
            created_at: self.created_at.clone(),
        }
    }
}
