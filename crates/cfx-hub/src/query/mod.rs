//! # Federated Query Pipeline
//!
//! Logical query in, one ordered page out: the compiler fans a
//! [`LogicalQuery`] out into [`PhysicalQuery`]s, the executor runs each one
//! against its backend, and the merge engine re-establishes the caller's
//! order across every source.

pub mod compiler;
pub mod engine;
pub mod executor;
pub mod merge;
pub mod parser;

use cfx_core::{
    option_key, Condition, Error, LogicalQuery, OrderKey, Result, ResultTableOptions, SliceInfo,
    SourceId, StorageType,
};
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// One backend-specific realization of one sub-query slice.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PhysicalQuery {
    /// Logical table id the rows are reported under.
    pub table_id: String,
    /// Concrete table or index on the backend.
    pub backend_table: String,
    pub connection: String,
    pub storage: StorageType,
    pub conditions: Vec<Condition>,
    pub fields: Vec<String>,
    /// Half-open time range in epoch milliseconds.
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
    pub timezone: Option<String>,
    pub order_by: Vec<OrderKey>,
    /// Rows requested from the backend for this call.
    pub size: usize,
    /// Scroll keep-alive, set only for scroll requests.
    pub scroll_secs: Option<u64>,
    pub slice: SliceInfo,
}

impl PhysicalQuery {
    pub fn source(&self) -> SourceId {
        SourceId::new(&self.table_id, &self.connection, self.slice.slice_index)
    }

    pub fn option_key(&self) -> String {
        option_key(&self.table_id, &self.connection, self.slice.slice_index)
    }
}

/// Request body for `POST /api/query/raw`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryRequest {
    /// Raw query text (parsed by the DSL parser).
    pub query: Option<String>,
    /// Structured query (alternative to raw text).
    pub structured: Option<LogicalQuery>,
    #[serde(default)]
    pub tenant: Option<String>,
    /// Cursors echoed from the previous page.
    #[serde(default)]
    pub result_table_options: ResultTableOptions,
    #[serde(default)]
    pub clear_cache: bool,
}

impl QueryRequest {
    /// The logical query this request carries. `default_limit` is the page
    /// size of text queries without a `LIMIT` clause.
    pub fn into_logical(self, default_limit: usize) -> Result<LogicalQuery> {
        let mut query = match (self.structured, self.query) {
            (Some(structured), _) => structured,
            (None, Some(text)) => parser::parse_with_limit(&text, default_limit)?,
            (None, None) => {
                return Err(Error::compile(
                    "request carries neither 'query' nor 'structured'",
                ))
            }
        };
        if let Some(tenant) = self.tenant {
            query.tenant = tenant;
        }
        query.result_table_options.extend(self.result_table_options);
        query.clear_cache |= self.clear_cache;
        Ok(query)
    }
}

/// Resolve a time expression to epoch milliseconds.
///
/// Accepts RFC 3339, epoch milliseconds, `now`, relative offsets into the
/// past (`30s`, `5m`, `2h`, `1d`) measured from `now_ms`, and naive
/// `YYYY-MM-DD HH:MM:SS` read in `timezone` (a fixed offset such as
/// `+08:00`, UTC when absent).
pub fn parse_time_expr(raw: &str, now_ms: i64, timezone: Option<&str>) -> Result<i64> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(Error::compile("empty time expression"));
    }
    if value.eq_ignore_ascii_case("now") {
        return Ok(now_ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.timestamp_millis());
    }
    if let Ok(ms) = value.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        let offset = parse_offset(timezone)?;
        return offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.timestamp_millis())
            .ok_or_else(|| Error::compile(format!("ambiguous local time '{}'", value)));
    }

    let (number, unit) = value.split_at(value.len().saturating_sub(1));
    let amount: i64 = number
        .parse()
        .map_err(|_| Error::compile(format!("unrecognized time expression '{}'", value)))?;
    let duration = match unit {
        "s" => Duration::seconds(amount),
        "m" => Duration::minutes(amount),
        "h" => Duration::hours(amount),
        "d" => Duration::days(amount),
        _ => return Err(Error::compile(format!("unknown time unit in '{}'", value))),
    };
    Ok(now_ms - duration.num_milliseconds())
}

/// Keep-alive durations such as `90s` or `5m`, in seconds.
pub fn parse_duration_secs(raw: &str) -> Result<u64> {
    let value = raw.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(secs);
    }
    let (number, unit) = value.split_at(value.len().saturating_sub(1));
    let amount: u64 = number
        .parse()
        .map_err(|_| Error::compile(format!("unrecognized duration '{}'", value)))?;
    let scale = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        _ => return Err(Error::compile(format!("unknown duration unit in '{}'", value))),
    };
    Ok(amount * scale)
}

fn parse_offset(timezone: Option<&str>) -> Result<FixedOffset> {
    match timezone.map(str::trim) {
        None | Some("") | Some("UTC") | Some("utc") | Some("Z") => Ok(Utc.fix()),
        Some(tz) => tz
            .parse::<FixedOffset>()
            .map_err(|e| Error::compile(format!("unsupported timezone '{}': {}", tz, e))),
    }
}
