//! # Rows and Pages

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::option::{ResultTableOptions, SliceStatus};

/// One backend row: field name to JSON value.
pub type RowMap = serde_json::Map<String, Value>;

/// Provenance columns added to every output row.
pub const RESULT_TABLE_FIELD: &str = "__result_table";
pub const CONNECTION_FIELD: &str = "__connection";
pub const DOC_ID_FIELD: &str = "__doc_id";

/// Identity of one physical slice. Its `Ord` is the cross-source tie-break.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId {
    pub table_id: String,
    pub connection: String,
    pub slice_index: usize,
}

impl SourceId {
    pub fn new(table_id: impl Into<String>, connection: impl Into<String>, slice_index: usize) -> Self {
        Self {
            table_id: table_id.into(),
            connection: connection.into(),
            slice_index,
        }
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}#{}", self.table_id, self.connection, self.slice_index)
    }
}

/// A resolved row plus where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeRow {
    pub fields: RowMap,
    pub source: SourceId,
    pub doc_id: Option<String>,
}

impl MergeRow {
    pub fn new(fields: RowMap, source: SourceId) -> Self {
        Self {
            fields,
            source,
            doc_id: None,
        }
    }

    pub fn with_doc_id(mut self, doc_id: Option<String>) -> Self {
        self.doc_id = doc_id;
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Flatten into the caller-facing row, adding provenance columns.
    pub fn into_row_map(self) -> RowMap {
        let mut fields = self.fields;
        fields.insert(RESULT_TABLE_FIELD.into(), Value::String(self.source.table_id));
        fields.insert(CONNECTION_FIELD.into(), Value::String(self.source.connection));
        if let Some(doc_id) = self.doc_id {
            fields.insert(DOC_ID_FIELD.into(), Value::String(doc_id));
        }
        fields
    }
}

/// What one logical query call hands back to its caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PageResponse {
    pub rows: Vec<RowMap>,
    pub total: u64,
    pub result_table_options: ResultTableOptions,
    /// Every slice is `completed` or `failed`.
    pub done: bool,
}

impl PageResponse {
    pub fn new(rows: Vec<RowMap>, total: u64, result_table_options: ResultTableOptions) -> Self {
        let done = result_table_options.values().all(|o| o.status.is_terminal());
        Self {
            rows,
            total,
            result_table_options,
            done,
        }
    }

    /// Options of slices that ended in `failed`.
    pub fn failed_sources(&self) -> BTreeSet<String> {
        self.result_table_options
            .iter()
            .filter(|(_, o)| o.status == SliceStatus::Failed)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::option::{Continuation, ResultTableOption};
    use serde_json::json;

    #[test]
    fn test_row_map_carries_provenance() {
        let row = MergeRow::new(
            json!({"time": 1}).as_object().cloned().unwrap(),
            SourceId::new("log.app", "es://a", 2),
        )
        .with_doc_id(Some("d-1".into()));
        let map = row.into_row_map();
        assert_eq!(map[RESULT_TABLE_FIELD], "log.app");
        assert_eq!(map[CONNECTION_FIELD], "es://a");
        assert_eq!(map[DOC_ID_FIELD], "d-1");
        assert_eq!(map["time"], 1);
    }

    #[test]
    fn test_source_order_is_table_then_connection_then_slice() {
        let a = SourceId::new("a", "z", 9);
        let b = SourceId::new("b", "a", 0);
        let c = SourceId::new("b", "a", 1);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_done_requires_every_slice_terminal() {
        let mut options = ResultTableOptions::new();
        let mut option = ResultTableOption {
            table_id: "t".into(),
            connection: "c".into(),
            slice_index: 0,
            slice_max: 2,
            continuation: Continuation::Offset { offset: 0 },
            status: SliceStatus::Completed,
            error: None,
        };
        options.insert(option.key(), option.clone());
        option.slice_index = 1;
        option.status = SliceStatus::Running;
        options.insert(option.key(), option.clone());
        assert!(!PageResponse::new(Vec::new(), 0, options.clone()).done);

        option.status = SliceStatus::Failed;
        options.insert(option.key(), option.clone());
        let page = PageResponse::new(Vec::new(), 0, options);
        assert!(page.done);
        assert_eq!(page.failed_sources().len(), 1);
    }
}
