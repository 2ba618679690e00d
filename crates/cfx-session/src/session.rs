//! # Scroll Session
//!
//! The in-memory view of one persisted session: every slice cursor keyed by
//! option key, plus the pinned "now" used to resolve relative time ranges.

use std::collections::HashMap;

use cfx_core::{Error, ResultTableOption, ResultTableOptions, Result};

/// Hash field holding the pinned time anchor (epoch milliseconds).
pub(crate) const ANCHOR_FIELD: &str = "__anchor_ms";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrollSession {
    pub key: String,
    pub options: ResultTableOptions,
    pub anchor_ms: Option<i64>,
}

impl ScrollSession {
    pub fn empty(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    /// Decode the hash fields written by [`crate::SessionStore::put`].
    pub(crate) fn from_fields(key: &str, fields: HashMap<String, String>) -> Result<Self> {
        let mut session = Self::empty(key);
        for (field, raw) in fields {
            if field == ANCHOR_FIELD {
                let anchor = raw.parse::<i64>().map_err(|e| {
                    Error::session(format!("session '{}' has a bad anchor '{}': {}", key, raw, e))
                })?;
                session.anchor_ms = Some(anchor);
                continue;
            }
            let option: ResultTableOption = serde_json::from_str(&raw).map_err(|e| {
                Error::session(format!("session '{}' field '{}' is unreadable: {}", key, field, e))
            })?;
            session.options.insert(field, option);
        }
        Ok(session)
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Every known slice has reached `completed` or `failed`.
    pub fn is_done(&self) -> bool {
        !self.options.is_empty() && self.options.values().all(|o| o.status.is_terminal())
    }

    /// Slices recorded for one (table, connection) pair.
    pub fn options_for<'a>(
        &'a self,
        table_id: &'a str,
        connection: &'a str,
    ) -> impl Iterator<Item = &'a ResultTableOption> + 'a {
        self.options
            .values()
            .filter(move |o| o.table_id == table_id && o.connection == connection)
    }

    /// Apply caller-echoed cursors over the stored ones.
    pub fn overlay(&mut self, echoed: &ResultTableOptions) {
        for (key, option) in echoed {
            self.options.insert(key.clone(), option.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfx_core::{Continuation, SliceStatus};

    fn option(table: &str, index: usize, status: SliceStatus) -> ResultTableOption {
        ResultTableOption {
            table_id: table.into(),
            connection: "c".into(),
            slice_index: index,
            slice_max: 2,
            continuation: Continuation::Offset { offset: index * 10 },
            status,
            error: None,
        }
    }

    #[test]
    fn test_from_fields_reads_options_and_anchor() {
        let opt = option("t", 1, SliceStatus::Running);
        let mut fields = HashMap::new();
        fields.insert(opt.key(), serde_json::to_string(&opt).unwrap());
        fields.insert(ANCHOR_FIELD.to_string(), "1700000000000".to_string());

        let session = ScrollSession::from_fields("k", fields).unwrap();
        assert_eq!(session.anchor_ms, Some(1_700_000_000_000));
        assert_eq!(session.options[&opt.key()], opt);
    }

    #[test]
    fn test_from_fields_rejects_garbage() {
        let mut fields = HashMap::new();
        fields.insert("t|0|0".to_string(), "{not json".to_string());
        assert!(matches!(
            ScrollSession::from_fields("k", fields),
            Err(Error::Session(_))
        ));
    }

    #[test]
    fn test_done_and_overlay() {
        let mut session = ScrollSession::empty("k");
        assert!(!session.is_done());

        let a = option("t", 0, SliceStatus::Completed);
        let b = option("t", 1, SliceStatus::Running);
        session.options.insert(a.key(), a.clone());
        session.options.insert(b.key(), b.clone());
        assert!(!session.is_done());
        assert_eq!(session.options_for("t", "c").count(), 2);
        assert_eq!(session.options_for("t", "other").count(), 0);

        let mut echoed = ResultTableOptions::new();
        echoed.insert(b.key(), option("t", 1, SliceStatus::Failed));
        session.overlay(&echoed);
        assert!(session.is_done());
    }
}
