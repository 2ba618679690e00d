//! # Slice Planner
//!
//! Decides, per (table, connection), how many slices to issue and where
//! each one resumes, then derives the next cursor from what the backend
//! returned.
//!
//! Search-style storage opens one scroll per slice and must echo the handle
//! returned for that exact slice index. Offset-paged storage strides: slice
//! `i` of `n` starts at `i * size` and each call advances by `n * size`.

use cfx_core::{
    Continuation, ContinuationHint, Error, ResultTableOption, Result, SliceInfo, SliceStatus,
    StorageType,
};
use tracing::debug;

use crate::session::ScrollSession;

/// Slice-count policy.
#[derive(Debug, Clone)]
pub struct SlicePolicy {
    /// Upper bound on parallel scroll slices for search-style storage.
    pub max_scroll_slices: usize,
    /// Parallel offset windows for offset-paged storage.
    pub offset_slices: usize,
}

impl Default for SlicePolicy {
    fn default() -> Self {
        Self {
            max_scroll_slices: 3,
            offset_slices: 1,
        }
    }
}

/// One (table, connection) pair to plan for.
#[derive(Debug, Clone, Copy)]
pub struct SliceTarget<'a> {
    pub table_id: &'a str,
    pub connection: &'a str,
    pub storage: StorageType,
    /// Shard count reported for the backend table, if known.
    pub shards: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct SlicePlanner {
    policy: SlicePolicy,
}

impl SlicePlanner {
    pub fn new(policy: SlicePolicy) -> Self {
        Self { policy }
    }

    /// `min(max, shards)` for scroll storage, the configured width otherwise.
    pub fn slice_count(&self, storage: StorageType, shards: Option<usize>) -> usize {
        let count = if storage.uses_scroll_handle() {
            let max = self.policy.max_scroll_slices;
            shards.map_or(max, |s| s.min(max))
        } else {
            self.policy.offset_slices
        };
        count.max(1)
    }

    /// Slices still to be fetched for `target` in a scroll session.
    /// Completed and failed slices are left out.
    pub fn plan(
        &self,
        target: SliceTarget<'_>,
        session: &ScrollSession,
        page_size: usize,
    ) -> Result<Vec<SliceInfo>> {
        let known: Vec<&ResultTableOption> = session
            .options_for(target.table_id, target.connection)
            .collect();

        let slice_max = match known.first() {
            Some(first) => first.slice_max,
            None => self.slice_count(target.storage, target.shards),
        };
        if slice_max == 0 {
            return Err(Error::compile(format!(
                "slice_max of 0 recorded for {}@{}",
                target.table_id, target.connection
            )));
        }
        if let Some(bad) = known
            .iter()
            .find(|o| o.slice_max != slice_max || o.slice_index >= slice_max)
        {
            return Err(Error::compile(format!(
                "inconsistent slice {}/{} for {}@{} (expected {} slices)",
                bad.slice_index, bad.slice_max, target.table_id, target.connection, slice_max
            )));
        }

        let mut slices = Vec::with_capacity(slice_max);
        for slice_index in 0..slice_max {
            let stored = known.iter().find(|o| o.slice_index == slice_index);
            let continuation = match stored {
                Some(option) if option.status.is_terminal() => {
                    debug!(
                        table_id = %target.table_id,
                        connection = %target.connection,
                        slice = slice_index,
                        status = %option.status,
                        "slice skipped"
                    );
                    continue;
                }
                Some(option) => {
                    validate_resume(target, option)?;
                    option.continuation.clone()
                }
                None => Continuation::initial(target.storage, slice_index, page_size),
            };
            slices.push(SliceInfo {
                slice_index,
                slice_max,
                continuation,
                storage: target.storage,
            });
        }
        Ok(slices)
    }

    /// The single offset window of a non-scroll request.
    pub fn single(&self, storage: StorageType, offset: usize) -> SliceInfo {
        SliceInfo {
            slice_index: 0,
            slice_max: 1,
            continuation: Continuation::Offset { offset },
            storage,
        }
    }
}

fn validate_resume(target: SliceTarget<'_>, option: &ResultTableOption) -> Result<()> {
    let shape_ok = match option.continuation {
        Continuation::Scroll { ref scroll_id } => {
            // A running scroll always carries the handle of its previous page.
            target.storage.uses_scroll_handle()
                && !(option.status == SliceStatus::Running && scroll_id.is_none())
        }
        Continuation::Offset { .. } => !target.storage.uses_scroll_handle(),
    };
    if shape_ok {
        Ok(())
    } else {
        Err(Error::compile(format!(
            "slice {} of {}@{} cannot resume {} storage from {:?} ({})",
            option.slice_index,
            option.table_id,
            option.connection,
            target.storage,
            option.continuation,
            option.status
        )))
    }
}

/// Derive the cursor that follows one successful physical call.
///
/// Scroll slices: no handle, or a handle with zero rows, completes the
/// slice; a handle with rows keeps it running on that handle. Offset
/// slices: zero rows completes; otherwise the offset advances by the rows
/// the whole slice group requested, so a short page never overlaps the
/// next one.
pub fn advance(
    slice: &SliceInfo,
    table_id: &str,
    connection: &str,
    hint: &ContinuationHint,
    rows: usize,
    page_size: usize,
) -> ResultTableOption {
    let (continuation, status) = match &slice.continuation {
        Continuation::Scroll { .. } => match hint {
            ContinuationHint::Handle(handle) => {
                let status = if rows > 0 {
                    SliceStatus::Running
                } else {
                    SliceStatus::Completed
                };
                (
                    Continuation::Scroll {
                        scroll_id: Some(handle.clone()),
                    },
                    status,
                )
            }
            ContinuationHint::None | ContinuationHint::NextOffset(_) => {
                (slice.continuation.clone(), SliceStatus::Completed)
            }
        },
        Continuation::Offset { offset } => {
            if rows == 0 {
                (slice.continuation.clone(), SliceStatus::Completed)
            } else {
                (
                    Continuation::Offset {
                        offset: offset + page_size * slice.slice_max,
                    },
                    SliceStatus::Running,
                )
            }
        }
    };
    ResultTableOption {
        table_id: table_id.to_string(),
        connection: connection.to_string(),
        slice_index: slice.slice_index,
        slice_max: slice.slice_max,
        continuation,
        status,
        error: None,
    }
}
