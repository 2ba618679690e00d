use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cfx_session::{MemorySessionBackend, SessionConfig, SessionStore, SlicePlanner, SlicePolicy};

use backends::registry::{BackendConfig, BackendRegistry, StaticTableResolver, TableConfig};
use query::engine::{EngineConfig, QueryEngine};

mod api;
mod backends;
mod query;

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(
    name = "cfx-hub",
    version = "0.1.0",
    about = "CONFLUX Federation Hub"
)]
struct Args {
    /// Server bind address
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind: String,

    /// Path to config file
    #[arg(long, default_value = "cfx-hub.toml")]
    config: PathBuf,
}

// =============================================================================
// Config
// =============================================================================

#[derive(Deserialize, Default, Clone)]
struct Config {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    session: SessionSection,
    #[serde(default)]
    slices: SliceSection,
    #[serde(default)]
    backends: Vec<BackendConfig>,
    #[serde(default)]
    tables: Vec<TableConfig>,
}

#[derive(Deserialize, Clone)]
struct ServerConfig {
    #[serde(default = "default_request_timeout")]
    request_timeout_ms: u64,
    #[serde(default = "default_row_buffer")]
    row_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            row_buffer: 1024,
        }
    }
}

#[derive(Deserialize, Clone)]
struct SessionSection {
    #[serde(default = "default_session_ttl")]
    ttl_secs: u64,
    #[serde(default = "default_lock_ttl")]
    lock_ttl_secs: u64,
    #[serde(default = "default_prefix")]
    prefix: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            lock_ttl_secs: 60,
            prefix: "cfx".into(),
        }
    }
}

#[derive(Deserialize, Clone)]
struct SliceSection {
    #[serde(default = "default_max_scroll_slices")]
    max_scroll_slices: usize,
    #[serde(default = "default_offset_slices")]
    offset_slices: usize,
    #[serde(default = "default_page_size")]
    default_page_size: usize,
}

impl Default for SliceSection {
    fn default() -> Self {
        Self {
            max_scroll_slices: 3,
            offset_slices: 1,
            default_page_size: cfx_core::DEFAULT_LIMIT,
        }
    }
}

fn default_request_timeout() -> u64 {
    30_000
}
fn default_row_buffer() -> usize {
    1024
}
fn default_session_ttl() -> u64 {
    300
}
fn default_lock_ttl() -> u64 {
    60
}
fn default_prefix() -> String {
    "cfx".into()
}
fn default_max_scroll_slices() -> usize {
    3
}
fn default_offset_slices() -> usize {
    1
}
fn default_page_size() -> usize {
    cfx_core::DEFAULT_LIMIT
}

impl Config {
    /// Missing file: defaults. Unreadable or malformed file: logged, defaults.
    fn load(path: &Path) -> Self {
        if !path.exists() {
            tracing::info!("No config at {:?}, using defaults", path);
            return Self::default();
        }
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                tracing::error!("Failed to read config {:?}: {}", path, e);
                return Self::default();
            }
        };
        toml::from_str(&content).unwrap_or_else(|e| {
            tracing::error!("Malformed config {:?}, using defaults: {}", path, e);
            Self::default()
        })
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ttl: Duration::from_secs(self.session.ttl_secs),
            lock_ttl: Duration::from_secs(self.session.lock_ttl_secs),
            prefix: self.session.prefix.clone(),
        }
    }

    fn slice_policy(&self) -> SlicePolicy {
        SlicePolicy {
            max_scroll_slices: self.slices.max_scroll_slices,
            offset_slices: self.slices.offset_slices,
        }
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            request_timeout: Duration::from_millis(self.server.request_timeout_ms),
            row_buffer: self.server.row_buffer,
        }
    }
}

// =============================================================================
// Application State
// =============================================================================

pub struct AppState {
    engine: Arc<QueryEngine>,
    /// Page size of text queries without a `LIMIT`.
    default_page_size: usize,
    start_time: Instant,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cfx_hub=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config);

    let registry = Arc::new(BackendRegistry::new());
    for backend in &config.backends {
        match registry.create_from_config(backend).await {
            Ok(info) => tracing::info!(
                "Backend {} ({}, {} tables)",
                info.connection,
                info.kind,
                info.tables.len()
            ),
            Err(e) => tracing::error!("Failed to start backend {}: {}", backend.connection, e),
        }
    }

    let resolver = StaticTableResolver::new(&config.tables)
        .with_shards_from(&registry)
        .await;
    let sessions = Arc::new(SessionStore::new(
        Arc::new(MemorySessionBackend::new()),
        config.session_config(),
    ));
    let engine = Arc::new(QueryEngine::new(
        registry,
        Arc::new(resolver),
        sessions,
        SlicePlanner::new(config.slice_policy()),
        config.engine_config(),
    ));

    let state = Arc::new(AppState {
        engine,
        default_page_size: config.slices.default_page_size,
        start_time: Instant::now(),
    });

    let app = Router::new()
        .route("/api/health", get(api::health))
        .route("/api/backends", get(api::list_backends))
        .route("/api/query/raw", post(api::query_raw))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = match args.bind.parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("Invalid bind address {}: {}", args.bind, e);
            std::process::exit(1);
        }
    };
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("  CONFLUX v0.1.0");
    tracing::info!("  API:        http://{}/api/query/raw", addr);
    tracing::info!("  Backends:   {}", config.backends.len());
    tracing::info!("  Tables:     {}", config.tables.len());
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_fill_missing_sections() {
        let config: Config = toml::from_str(
            r#"
            [server]
            row_buffer = 64

            [slices]
            offset_slices = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.server.row_buffer, 64);
        assert_eq!(config.server.request_timeout_ms, 30_000);
        assert_eq!(config.slice_policy().offset_slices, 3);
        assert_eq!(config.slice_policy().max_scroll_slices, 3);
        assert_eq!(config.session_config().lock_ttl, Duration::from_secs(60));
        assert!(config.backends.is_empty());
    }

    #[test]
    fn test_backends_and_tables_parse() {
        let config: Config = toml::from_str(
            r#"
            [[backends]]
            connection = "es://local"
            kind = "memory_search"
            shards = 4

            [[backends]]
            connection = "sql://local"
            kind = "memory_sql"
            fixture = "fixtures/sql.json"

            [[tables]]
            table_id = "log.app"
            routes = [{ backend_table = "logs", connection = "es://local", storage = "search" }]
            "#,
        )
        .unwrap();
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].shards, Some(4));
        assert_eq!(config.backends[1].fixture.as_deref(), Some("fixtures/sql.json"));
        assert_eq!(config.tables[0].tenant, "*");
    }

    #[test]
    fn test_missing_or_malformed_file_uses_defaults() {
        let missing = Config::load(Path::new("/nonexistent/cfx-hub.toml"));
        assert_eq!(missing.slices.default_page_size, cfx_core::DEFAULT_LIMIT);

        let path = std::env::temp_dir().join(format!("cfx-hub-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[server\nrow_buffer = ").unwrap();
        let malformed = Config::load(&path);
        assert_eq!(malformed.server.row_buffer, 1024);
        std::fs::remove_file(&path).unwrap();
    }
}
