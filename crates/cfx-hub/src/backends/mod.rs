//! # Backend Raw-Query Framework
//!
//! The narrow contract the engine needs from every storage family. A
//! backend receives one [`PhysicalQuery`], streams its rows into the
//! provided channel and reports a total plus a continuation hint. Wire
//! protocol details stay behind the trait.

pub mod filter;
pub mod memory_search;
pub mod memory_sql;
pub mod registry;

use cfx_core::{ContinuationHint, RowMap, StorageType};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::query::PhysicalQuery;

pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// One row as the backend produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub fields: RowMap,
    /// Backend document id, when the storage has one.
    pub doc_id: Option<String>,
}

/// What a backend reports once its row stream ends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawOutcome {
    /// Backend-reported total for this call.
    pub total: u64,
    pub hint: ContinuationHint,
}

/// Backend implementation descriptor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    MemorySearch,
    MemorySql,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MemorySearch => write!(f, "memory_search"),
            Self::MemorySql => write!(f, "memory_sql"),
        }
    }
}

/// Serializable backend info for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub connection: String,
    pub kind: BackendKind,
    pub storage: StorageType,
    pub tables: Vec<String>,
    pub created_at: String,
}

/// The trait every storage backend implements.
#[async_trait::async_trait]
pub trait RawQueryBackend: Send + Sync {
    /// Connection string this backend serves.
    fn connection(&self) -> &str;

    fn storage(&self) -> StorageType;

    /// Shard count of the backing index, for slice planning.
    fn shards(&self) -> Option<usize> {
        None
    }

    /// Execute one physical query. Rows go into `rows` in backend order;
    /// a closed receiver means the caller has seen enough.
    async fn raw_query(
        &self,
        query: &PhysicalQuery,
        rows: mpsc::Sender<RawRow>,
    ) -> Result<RawOutcome, BackendError>;

    fn info(&self) -> BackendInfo;
}
