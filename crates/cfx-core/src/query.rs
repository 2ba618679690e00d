//! # Logical Query Model
//!
//! The caller's single, backend-agnostic request. One [`LogicalQuery`]
//! fans out to one or more [`SubQuery`]s, each naming a logical table that
//! table resolution maps onto concrete backend tables.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::option::ResultTableOptions;
use crate::order::OrderKey;

/// Default page size when the caller does not ask for one.
pub const DEFAULT_LIMIT: usize = 100;

/// Storage families the engine knows how to paginate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// Full-text / log search engine with parallel slices and scroll handles.
    Search,
    /// Columnar SQL engine paged by offset.
    Sql,
    /// Time-series database paged by offset.
    TimeSeries,
}

impl StorageType {
    /// Whether this storage resumes through backend-issued scroll handles.
    pub fn uses_scroll_handle(self) -> bool {
        matches!(self, Self::Search)
    }
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Search => write!(f, "search"),
            Self::Sql => write!(f, "sql"),
            Self::TimeSeries => write!(f, "time_series"),
        }
    }
}

/// A field filter pushed down to the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    pub field: String,
    pub op: CompareOp,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    StartsWith,
    /// Regular expression match on the string form of the field.
    Matches,
}

/// One per-table part of a logical query.
///
/// Any of the shared fields left unset here inherit the value from the
/// enclosing [`LogicalQuery`] during compilation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubQuery {
    pub table_id: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Result-row columns; empty selects every column.
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<usize>,
}

impl SubQuery {
    pub fn new(table_id: impl Into<String>) -> Self {
        Self {
            table_id: table_id.into(),
            ..Default::default()
        }
    }
}

/// The caller's request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogicalQuery {
    /// Tenant / space identifier handed to table resolution.
    #[serde(default)]
    pub tenant: String,
    pub queries: Vec<SubQuery>,
    /// Time range: RFC 3339 timestamps or relative expressions (`5m`, `2h`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default)]
    pub order_by: Vec<OrderKey>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub from: usize,
    /// Scroll window in seconds. When set, pages resume through continuation
    /// state instead of `from`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_secs: Option<u64>,
    /// Continuation state echoed back by the caller.
    #[serde(default, skip_serializing_if = "ResultTableOptions::is_empty")]
    pub result_table_options: ResultTableOptions,
    /// Drop any stored session for this query and start over.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub clear_cache: bool,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

impl Default for LogicalQuery {
    fn default() -> Self {
        Self {
            tenant: String::new(),
            queries: Vec::new(),
            start: None,
            end: None,
            timezone: None,
            order_by: Vec::new(),
            limit: DEFAULT_LIMIT,
            from: 0,
            scroll_secs: None,
            result_table_options: ResultTableOptions::new(),
            clear_cache: false,
        }
    }
}

impl LogicalQuery {
    pub fn is_scroll(&self) -> bool {
        self.scroll_secs.is_some()
    }

    /// Reject contradictory requests before any backend is touched.
    pub fn validate(&self) -> Result<()> {
        if self.queries.is_empty() {
            return Err(Error::compile("query names no tables"));
        }
        if let Some(sub) = self.queries.iter().find(|q| q.table_id.trim().is_empty()) {
            return Err(Error::compile(format!(
                "sub-query with empty table id: {:?}",
                sub
            )));
        }
        if self.limit == 0 {
            return Err(Error::compile("limit must be greater than zero"));
        }
        if self.is_scroll() {
            if self.scroll_secs == Some(0) {
                return Err(Error::compile("scroll window must be positive"));
            }
            if self.from != 0 || self.queries.iter().any(|q| q.from.unwrap_or(0) != 0) {
                return Err(Error::compile(
                    "scroll queries resume from continuation state; `from` must be 0",
                ));
            }
        }
        Ok(())
    }
}
