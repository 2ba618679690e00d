//! # cfx-core — The "Model" of CONFLUX
//!
//! Types shared by the session store, the query compiler and the merge
//! engine: the caller's [`LogicalQuery`], the persisted continuation state
//! ([`ResultTableOption`]), merged rows and the page handed back to the
//! caller. Also home to the error taxonomy and the multi-key row ordering.

pub mod error;
pub mod hash;
pub mod option;
pub mod order;
pub mod query;
pub mod row;

pub use error::{Error, Result};
pub use hash::{connection_hash, option_key, session_key};
pub use option::{
    Continuation, ContinuationHint, ResultTableOption, ResultTableOptions, SliceInfo, SliceStatus,
};
pub use order::{OrderKey, SortFields, SortPlan};
pub use query::{CompareOp, Condition, LogicalQuery, StorageType, SubQuery, DEFAULT_LIMIT};
pub use row::{MergeRow, PageResponse, RowMap, SourceId};
