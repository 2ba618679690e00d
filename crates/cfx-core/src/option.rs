//! # Continuation State
//!
//! A [`ResultTableOption`] is the persisted cursor for one slice of one
//! (logical table, backend connection) pair. Search engines resume through
//! an opaque scroll handle; offset-paged engines resume through a numeric
//! offset. Both shapes live behind [`Continuation`] so that only the slice
//! planner and the execution adapter need to know which one they hold.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hash::option_key;
use crate::query::StorageType;

/// Continuation state keyed by `"{table_id}|{connection_hash}|{slice_index}"`.
pub type ResultTableOptions = BTreeMap<String, ResultTableOption>;

/// Slice lifecycle.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SliceStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl SliceStatus {
    /// Terminal slices are never planned again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for SliceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Where a slice resumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Continuation {
    /// Numeric offset into the backend's ordered result.
    Offset { offset: usize },
    /// Backend-issued scroll handle; `None` opens a fresh scroll.
    Scroll {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scroll_id: Option<String>,
    },
}

impl Continuation {
    /// The starting point of slice `slice_index` for a storage type.
    pub fn initial(storage: StorageType, slice_index: usize, page_size: usize) -> Self {
        if storage.uses_scroll_handle() {
            Continuation::Scroll { scroll_id: None }
        } else {
            Continuation::Offset {
                offset: slice_index * page_size,
            }
        }
    }

    pub fn offset(&self) -> Option<usize> {
        match self {
            Continuation::Offset { offset } => Some(*offset),
            Continuation::Scroll { .. } => None,
        }
    }

    pub fn scroll_id(&self) -> Option<&str> {
        match self {
            Continuation::Scroll { scroll_id } => scroll_id.as_deref(),
            Continuation::Offset { .. } => None,
        }
    }
}

/// What a backend says about where its next page starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ContinuationHint {
    #[default]
    None,
    Handle(String),
    NextOffset(usize),
}

/// Persisted continuation state for one slice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultTableOption {
    pub table_id: String,
    pub connection: String,
    pub slice_index: usize,
    pub slice_max: usize,
    #[serde(flatten)]
    pub continuation: Continuation,
    #[serde(default)]
    pub status: SliceStatus,
    /// Last backend error for a `failed` slice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultTableOption {
    pub fn key(&self) -> String {
        option_key(&self.table_id, &self.connection, self.slice_index)
    }

    /// Same position, marked failed. The continuation is left untouched so
    /// the last good cursor can be inspected or retried.
    pub fn into_failed(self, message: impl Into<String>) -> Self {
        Self {
            status: SliceStatus::Failed,
            error: Some(message.into()),
            ..self
        }
    }
}

/// Ephemeral descriptor for one physical call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SliceInfo {
    pub slice_index: usize,
    pub slice_max: usize,
    pub continuation: Continuation,
    pub storage: StorageType,
}

impl SliceInfo {
    /// The option this slice was planned from, stamped with `status`.
    pub fn to_option(
        &self,
        table_id: &str,
        connection: &str,
        status: SliceStatus,
    ) -> ResultTableOption {
        ResultTableOption {
            table_id: table_id.to_string(),
            connection: connection.to_string(),
            slice_index: self.slice_index,
            slice_max: self.slice_max,
            continuation: self.continuation.clone(),
            status,
            error: None,
        }
    }
}
