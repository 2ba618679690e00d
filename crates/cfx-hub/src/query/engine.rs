//! # Query Engine
//!
//! Orchestrates one logical query end to end: session lock, compilation,
//! parallel fan-out to every physical query, a full join barrier, merge,
//! and the cursors handed back to the caller.
//!
//! Scroll queries hold the session lock for the whole page and always
//! release it, including on cancellation and deadline expiry. Cancellation
//! is signalled through a [`CancellationToken`]; the work itself is never
//! dropped halfway through a lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cfx_core::{
    session_key, Error, LogicalQuery, MergeRow, PageResponse, Result, ResultTableOptions,
};
use cfx_session::{ScrollSession, SessionStore, SlicePlanner};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::compiler::{CompiledQuery, QueryCompiler};
use super::executor::{SliceExecution, SliceExecutor};
use super::merge::{merge, SourceBatch};
use crate::backends::registry::{BackendRegistry, TableResolver};
use crate::backends::RawQueryBackend;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline for one logical query, fan-out included.
    pub request_timeout: Duration,
    /// Row queue capacity per physical execution.
    pub row_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            row_buffer: 1024,
        }
    }
}

pub struct QueryEngine {
    registry: Arc<BackendRegistry>,
    compiler: QueryCompiler,
    sessions: Arc<SessionStore>,
    executor: SliceExecutor,
    config: EngineConfig,
}

impl QueryEngine {
    pub fn new(
        registry: Arc<BackendRegistry>,
        resolver: Arc<dyn TableResolver>,
        sessions: Arc<SessionStore>,
        planner: SlicePlanner,
        config: EngineConfig,
    ) -> Self {
        Self {
            executor: SliceExecutor::new(config.row_buffer),
            compiler: QueryCompiler::new(resolver, planner),
            registry,
            sessions,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Run one page of `query`. `cancel` aborts every outstanding physical
    /// execution; so does the configured request deadline.
    pub async fn query_raw(
        &self,
        query: LogicalQuery,
        cancel: CancellationToken,
    ) -> Result<PageResponse> {
        query.validate()?;
        let started = Instant::now();

        let token = cancel.child_token();
        let deadline = {
            let token = token.clone();
            let timeout = self.config.request_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            })
        };

        let result = if query.is_scroll() {
            self.scroll_page(&query, &token).await
        } else {
            self.single_page(&query, &token).await
        };
        deadline.abort();

        match &result {
            Ok(page) => info!(
                tables = query.queries.len(),
                scroll = query.is_scroll(),
                rows = page.rows.len(),
                total = page.total,
                done = page.done,
                failed = page.failed_sources().len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "query served"
            ),
            Err(e) => warn!(
                scroll = query.is_scroll(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %e,
                "query failed"
            ),
        }
        result
    }

    /// One-shot offset query; never touches the session store.
    async fn single_page(
        &self,
        query: &LogicalQuery,
        token: &CancellationToken,
    ) -> Result<PageResponse> {
        let now = chrono::Utc::now().timestamp_millis();
        let compiled = self.compiler.compile(query, &ScrollSession::default(), now)?;
        let backends = self.backends_for(&compiled).await?;
        let executions = self.dispatch(&compiled, &backends, token).await?;
        let (options, batches) = collect(executions);

        let merged = merge(
            batches,
            &compiled.order_by,
            compiled.merge_from,
            compiled.merge_limit,
        )?;
        let rows = merged.rows.into_iter().map(MergeRow::into_row_map).collect();
        Ok(PageResponse::new(rows, merged.total, options))
    }

    async fn scroll_page(
        &self,
        query: &LogicalQuery,
        token: &CancellationToken,
    ) -> Result<PageResponse> {
        let key = session_key(query)?;
        let (lease, stored) = self
            .sessions
            .acquire(&key, self.sessions.config().lock_ttl)
            .await?;

        let result = self.scroll_locked(query, &key, stored, token).await;

        if let Err(e) = self.sessions.release(&lease).await {
            warn!(key = %key, error = %e, "session release failed; lock expires with its TTL");
        }
        result
    }

    async fn scroll_locked(
        &self,
        query: &LogicalQuery,
        key: &str,
        stored: ScrollSession,
        token: &CancellationToken,
    ) -> Result<PageResponse> {
        let mut session = if query.clear_cache {
            ScrollSession::empty(key)
        } else {
            stored
        };

        // Echoed cursors win over stored ones. Cursors for tables outside
        // this query are ignored.
        let echoed: ResultTableOptions = query
            .result_table_options
            .values()
            .filter(|o| query.queries.iter().any(|sub| sub.table_id == o.table_id))
            .map(|o| (o.key(), o.clone()))
            .collect();
        session.overlay(&echoed);

        let anchor = session
            .anchor_ms
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let compiled = self.compiler.compile(query, &session, anchor)?;
        let backends = self.backends_for(&compiled).await?;

        // Compiled cleanly: make the stored session match what was compiled.
        if query.clear_cache {
            self.sessions.remove(key).await?;
            debug!(key = %key, "session cleared on request");
        }
        for option in echoed.values() {
            self.sessions.put(key, option).await?;
        }
        if session.anchor_ms.is_none() {
            self.sessions.pin_anchor(key, anchor).await?;
        }

        let executions = if compiled.is_empty() {
            debug!(key = %key, "every slice is terminal, nothing to fetch");
            Vec::new()
        } else {
            self.dispatch(&compiled, &backends, token).await?
        };

        // Every slice finished: the page is deliverable, so its cursors
        // may move.
        let (fresh, batches) = collect(executions);
        let merged = merge(batches, &compiled.order_by, 0, None)?;

        let mut options = session.options;
        options.extend(fresh.clone());
        let rows = merged.rows.into_iter().map(MergeRow::into_row_map).collect();
        let page = PageResponse::new(rows, merged.total, options);

        if page.done {
            self.sessions.remove(key).await?;
            debug!(key = %key, "session complete");
        } else {
            for option in fresh.values() {
                self.sessions.put(key, option).await?;
            }
        }
        Ok(page)
    }

    /// Backends for every connection in `compiled`. Runs before anything is
    /// dispatched so a misrouted table never half-executes.
    async fn backends_for(
        &self,
        compiled: &CompiledQuery,
    ) -> Result<HashMap<String, Arc<dyn RawQueryBackend>>> {
        let mut backends = HashMap::with_capacity(compiled.groups.len());
        for (connection, queries) in &compiled.groups {
            let backend = self.registry.get(connection).await.ok_or_else(|| {
                Error::compile(format!("no backend registered for '{}'", connection))
            })?;
            if let Some(q) = queries.iter().find(|q| q.storage != backend.storage()) {
                return Err(Error::compile(format!(
                    "table '{}' routes to '{}' as {} storage, backend serves {}",
                    q.table_id,
                    connection,
                    q.storage,
                    backend.storage()
                )));
            }
            backends.insert(connection.clone(), backend);
        }
        Ok(backends)
    }

    /// Fan out every physical query and wait for all of them. Any
    /// cancellation discards the whole page.
    async fn dispatch(
        &self,
        compiled: &CompiledQuery,
        backends: &HashMap<String, Arc<dyn RawQueryBackend>>,
        token: &CancellationToken,
    ) -> Result<Vec<SliceExecution>> {
        let mut tasks = JoinSet::new();
        for (connection, queries) in &compiled.groups {
            let backend = backends.get(connection).cloned().ok_or_else(|| {
                Error::compile(format!("no backend registered for '{}'", connection))
            })?;
            for query in queries {
                let executor = self.executor;
                let backend = backend.clone();
                let query = query.clone();
                let token = token.clone();
                tasks.spawn(async move {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => None,
                        exec = executor.execute(backend.as_ref(), &query) => Some(exec),
                    }
                });
            }
        }

        let mut executions = Vec::with_capacity(compiled.len());
        let mut cancelled = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(exec)) => executions.push(exec),
                Ok(None) => cancelled = true,
                Err(e) => error!("slice task panicked: {}", e),
            }
        }

        if cancelled || token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        executions.sort_by(|a, b| a.source.cmp(&b.source));
        Ok(executions)
    }
}

fn collect(executions: Vec<SliceExecution>) -> (ResultTableOptions, Vec<SourceBatch>) {
    let mut options = ResultTableOptions::new();
    let mut batches = Vec::with_capacity(executions.len());
    for exec in executions {
        if let Some(e) = &exec.error {
            debug!(source = %exec.source, error = %e, "slice reported as failed");
        }
        options.insert(exec.option.key(), exec.option);
        batches.push(SourceBatch {
            source: exec.source,
            rows: exec.rows,
            total: exec.total,
        });
    }
    (options, batches)
}
