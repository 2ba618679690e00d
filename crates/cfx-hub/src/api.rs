//! # API Handlers
//!
//! Axum handlers for the federation endpoints.

use crate::backends::BackendInfo;
use crate::query::QueryRequest;
use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use cfx_core::{Error, PageResponse};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Query
// =============================================================================

/// Run one page of a logical query.
///
/// The engine runs on its own task so that a dropped connection cancels
/// the fan-out through the token instead of abandoning a held session lock.
pub async fn query_raw(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<PageResponse>, (StatusCode, String)> {
    let query = req.into_logical(state.default_page_size).map_err(reject)?;

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let engine = state.engine.clone();
    let page = tokio::spawn(async move { engine.query_raw(query, cancel).await })
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("query task failed: {}", e),
            )
        })?;
    guard.disarm();

    page.map(Json).map_err(reject)
}

/// Map an engine error onto an HTTP rejection.
pub fn reject(e: Error) -> (StatusCode, String) {
    let status = match e {
        Error::Compile(_) => StatusCode::BAD_REQUEST,
        Error::LockBusy { .. } => StatusCode::CONFLICT,
        Error::Cancelled => StatusCode::REQUEST_TIMEOUT,
        Error::Merge(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Backend { .. } | Error::Session(_) | Error::Json(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, e.to_string())
}

// =============================================================================
// Backends
// =============================================================================

pub async fn list_backends(State(state): State<Arc<AppState>>) -> Json<Vec<BackendInfo>> {
    Json(state.engine.registry().list().await)
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub backends: usize,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        backends: state.engine.registry().list().await.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory_sql::MemorySqlBackend;
    use crate::backends::registry::{BackendRegistry, StaticTableResolver, TableTarget};
    use crate::query::engine::{EngineConfig, QueryEngine};
    use cfx_core::StorageType;
    use cfx_session::{MemorySessionBackend, SessionConfig, SessionStore, SlicePlanner};
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Instant;

    async fn state() -> Arc<AppState> {
        let registry = Arc::new(BackendRegistry::new());
        let rows = (0..3)
            .map(|n| json!({"time": n}).as_object().cloned().unwrap())
            .collect();
        registry
            .add(Arc::new(MemorySqlBackend::new(
                "sql://local",
                HashMap::from([("logs".to_string(), rows)]),
            )))
            .await;
        let mut resolver = StaticTableResolver::default();
        resolver.insert(
            "log.app",
            "*",
            vec![TableTarget {
                backend_table: "logs".into(),
                connection: "sql://local".into(),
                storage: StorageType::Sql,
                shards: None,
            }],
        );
        let sessions = Arc::new(SessionStore::new(
            Arc::new(MemorySessionBackend::new()),
            SessionConfig::default(),
        ));
        Arc::new(AppState {
            engine: Arc::new(QueryEngine::new(
                registry,
                Arc::new(resolver),
                sessions,
                SlicePlanner::default(),
                EngineConfig::default(),
            )),
            default_page_size: 2,
            start_time: Instant::now(),
        })
    }

    #[tokio::test]
    async fn test_text_query_pages_with_default_size() {
        let req = QueryRequest {
            query: Some("SELECT * FROM log.app ORDER BY -time".into()),
            ..Default::default()
        };
        let Json(page) = query_raw(State(state().await), Json(req)).await.unwrap();
        let times: Vec<_> = page.rows.iter().map(|r| r["time"].clone()).collect();
        assert_eq!(times, vec![json!(2), json!(1)]);
        assert_eq!(page.total, 3);
    }

    #[tokio::test]
    async fn test_errors_map_to_status_codes() {
        let req = QueryRequest {
            query: Some("SELECT * FROM log.unknown".into()),
            ..Default::default()
        };
        let (status, _) = query_raw(State(state().await), Json(req)).await.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let busy = Error::LockBusy {
            key: "k".into(),
            holder: "h".into(),
        };
        assert_eq!(reject(busy).0, StatusCode::CONFLICT);
        assert_eq!(reject(Error::Cancelled).0, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(reject(Error::merge("x")).0, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            reject(Error::session("down")).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_backends_and_health() {
        let state = state().await;
        let Json(backends) = list_backends(State(state.clone())).await;
        assert_eq!(backends[0].connection, "sql://local");
        let Json(health) = health(State(state)).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.backends, 1);
    }
}
