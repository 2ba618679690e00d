//! # Backend Registry
//!
//! Thread-safe map of connection string to [`RawQueryBackend`], plus the
//! static table resolution that turns a logical table id into the backend
//! tables serving it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use cfx_core::{Error, Result, RowMap, StorageType};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::memory_search::MemorySearchBackend;
use super::memory_sql::MemorySqlBackend;
use super::{BackendError, BackendInfo, BackendKind, RawQueryBackend};

/// Central registry for every configured backend.
#[derive(Default)]
pub struct BackendRegistry {
    backends: RwLock<HashMap<String, Arc<dyn RawQueryBackend>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its connection string. Replaces any
    /// backend already serving that connection.
    pub async fn add(&self, backend: Arc<dyn RawQueryBackend>) {
        let connection = backend.connection().to_string();
        let replaced = self
            .backends
            .write()
            .await
            .insert(connection.clone(), backend)
            .is_some();
        tracing::info!(connection = %connection, replaced, "backend registered");
    }

    pub async fn get(&self, connection: &str) -> Option<Arc<dyn RawQueryBackend>> {
        self.backends.read().await.get(connection).cloned()
    }

    /// Every backend's info, sorted by connection.
    pub async fn list(&self) -> Vec<BackendInfo> {
        let mut infos: Vec<BackendInfo> =
            self.backends.read().await.values().map(|b| b.info()).collect();
        infos.sort_by(|a, b| a.connection.cmp(&b.connection));
        infos
    }

    /// Build a backend from config and register it.
    pub async fn create_from_config(
        &self,
        config: &BackendConfig,
    ) -> std::result::Result<BackendInfo, BackendError> {
        let tables = match &config.fixture {
            Some(path) => load_fixture(path)?,
            None => HashMap::new(),
        };
        let backend: Arc<dyn RawQueryBackend> = match config.kind {
            BackendKind::MemorySearch => Arc::new(
                MemorySearchBackend::new(config.connection.clone(), tables)
                    .with_shards(config.shards.unwrap_or(1))
                    .with_time_field(config.time_field.clone()),
            ),
            BackendKind::MemorySql => {
                let backend = MemorySqlBackend::new(config.connection.clone(), tables)
                    .with_time_field(config.time_field.clone());
                if config.time_series {
                    Arc::new(backend.as_time_series())
                } else {
                    Arc::new(backend)
                }
            }
        };
        let info = backend.info();
        self.add(backend).await;
        Ok(info)
    }
}

/// `[[backends]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub connection: String,
    pub kind: BackendKind,
    /// Shard count of a search backend; caps its slice count.
    #[serde(default)]
    pub shards: Option<usize>,
    /// JSON file of `{"table": [rows]}`.
    #[serde(default)]
    pub fixture: Option<String>,
    #[serde(default = "default_time_field")]
    pub time_field: String,
    /// Serve a `memory_sql` backend as time-series storage.
    #[serde(default)]
    pub time_series: bool,
}

fn default_time_field() -> String {
    "time".into()
}

fn load_fixture(path: impl AsRef<Path>) -> std::result::Result<HashMap<String, Vec<RowMap>>, BackendError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read fixture {}: {}", path.display(), e))?;
    let tables: HashMap<String, Vec<RowMap>> = serde_json::from_str(&content)
        .map_err(|e| format!("fixture {} is not {{table: [rows]}}: {}", path.display(), e))?;
    Ok(tables)
}

// =============================================================================
// Table Resolution
// =============================================================================

/// One concrete backend table serving a logical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableTarget {
    pub backend_table: String,
    pub connection: String,
    pub storage: StorageType,
    /// Shard count, when the backend reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shards: Option<usize>,
}

/// Maps a logical table id to its backend tables. Must be a pure lookup.
pub trait TableResolver: Send + Sync {
    fn resolve(&self, table_id: &str, tenant: &str) -> Result<Vec<TableTarget>>;
}

/// `[[tables]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    pub table_id: String,
    /// `*` (the default) serves every tenant.
    #[serde(default = "any_tenant")]
    pub tenant: String,
    pub routes: Vec<TableTarget>,
}

fn any_tenant() -> String {
    ANY_TENANT.into()
}

const ANY_TENANT: &str = "*";

/// Resolution from a fixed routing table.
#[derive(Debug, Clone, Default)]
pub struct StaticTableResolver {
    routes: HashMap<(String, String), Vec<TableTarget>>,
}

impl StaticTableResolver {
    pub fn new(tables: &[TableConfig]) -> Self {
        let mut resolver = Self::default();
        for table in tables {
            resolver.insert(&table.table_id, &table.tenant, table.routes.clone());
        }
        resolver
    }

    pub fn insert(&mut self, table_id: &str, tenant: &str, targets: Vec<TableTarget>) {
        self.routes
            .entry((table_id.to_string(), tenant.to_string()))
            .or_default()
            .extend(targets);
    }

    /// Fill in shard counts from the registered backends.
    pub async fn with_shards_from(mut self, registry: &BackendRegistry) -> Self {
        for targets in self.routes.values_mut() {
            for target in targets.iter_mut().filter(|t| t.shards.is_none()) {
                if let Some(backend) = registry.get(&target.connection).await {
                    target.shards = backend.shards();
                }
            }
        }
        self
    }
}

impl TableResolver for StaticTableResolver {
    /// The tenant's own routes win over the `*` routes.
    fn resolve(&self, table_id: &str, tenant: &str) -> Result<Vec<TableTarget>> {
        let exact = self.routes.get(&(table_id.to_string(), tenant.to_string()));
        let any = self.routes.get(&(table_id.to_string(), ANY_TENANT.to_string()));
        match exact.or(any) {
            Some(targets) if !targets.is_empty() => Ok(targets.clone()),
            _ => Err(Error::compile(format!(
                "table '{}' does not resolve for tenant '{}'",
                table_id, tenant
            ))),
        }
    }
}
