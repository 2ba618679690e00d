//! Stable identifiers: session keys, connection hashes and option keys.

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::query::LogicalQuery;

/// SHA-256 over the canonical JSON of `query`, ignoring fields that do not
/// change which rows the query selects.
///
/// `serde_json::Map` is ordered, so the serialization is canonical.
pub fn session_key(query: &LogicalQuery) -> Result<String> {
    let mut normalized = query.clone();
    normalized.result_table_options.clear();
    normalized.clear_cache = false;

    let canonical = serde_json::to_vec(&serde_json::to_value(&normalized)?)?;
    let digest = Sha256::digest(&canonical);
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

pub fn connection_hash(connection: &str) -> String {
    format!("{:08x}", crc32fast::hash(connection.as_bytes()))
}

pub fn option_key(table_id: &str, connection: &str, slice_index: usize) -> String {
    format!("{}|{}|{}", table_id, connection_hash(connection), slice_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::option::{Continuation, ResultTableOption, SliceStatus};
    use crate::query::SubQuery;

    fn query() -> LogicalQuery {
        LogicalQuery {
            queries: vec![SubQuery::new("log.app")],
            scroll_secs: Some(60),
            ..Default::default()
        }
    }

    #[test]
    fn test_session_key_ignores_cache_busting_fields() {
        let base = session_key(&query()).unwrap();

        let mut busted = query();
        busted.clear_cache = true;
        busted.result_table_options.insert(
            "k".into(),
            ResultTableOption {
                table_id: "log.app".into(),
                connection: "c".into(),
                slice_index: 0,
                slice_max: 1,
                continuation: Continuation::Offset { offset: 10 },
                status: SliceStatus::Running,
                error: None,
            },
        );
        assert_eq!(session_key(&busted).unwrap(), base);
        assert_eq!(base.len(), 64);
    }

    #[test]
    fn test_session_key_tracks_selection() {
        let mut other = query();
        other.queries[0].table_id = "log.other".into();
        assert_ne!(session_key(&other).unwrap(), session_key(&query()).unwrap());
    }

    #[test]
    fn test_option_key_layout() {
        let key = option_key("log.app", "es://a", 2);
        let parts: Vec<&str> = key.split('|').collect();
        assert_eq!(parts, vec!["log.app", connection_hash("es://a").as_str(), "2"]);
        assert_eq!(connection_hash("es://a").len(), 8);
    }
}
