//! # Session Persistence
//!
//! The key/value contract a scroll session needs from its store: SETNX with
//! expiry for the lock, field-level get/set on a hash-shaped value for the
//! per-slice cursors, and explicit delete. Any Redis-like service fits.
//! [`MemorySessionBackend`] is the in-process implementation.

use std::collections::HashMap;
use std::time::Duration;

use cfx_core::{Error, Result};
use tokio::sync::RwLock;
use tokio::time::Instant;

#[async_trait::async_trait]
pub trait SessionBackend: Send + Sync {
    /// Set `key` to `value` only if absent. Returns `true` when set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete `key` only while it still holds `value`. Returns `true` when deleted.
    async fn delete_if_eq(&self, key: &str, value: &str) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Every field of a hash value; empty when the key does not exist.
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Set `field` only if the hash does not hold it yet. Returns the stored value.
    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<String>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
}

#[derive(Debug, Clone)]
enum Stored {
    Text(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process session backend with lazy TTL expiry.
#[derive(Default)]
pub struct MemorySessionBackend {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemorySessionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn wrong_type(key: &str) -> Error {
    Error::session(format!("key '{}' holds a value of the wrong type", key))
}

#[async_trait::async_trait]
impl SessionBackend for MemorySessionBackend {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Stored::Text(value.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        match entries.get(key).filter(|e| e.is_live(now)) {
            None => Ok(None),
            Some(Entry {
                value: Stored::Text(v),
                ..
            }) => Ok(Some(v.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn delete_if_eq(&self, key: &str, value: &str) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let matches = matches!(
            entries.get(key).filter(|e| e.is_live(now)),
            Some(Entry { value: Stored::Text(v), .. }) if v == value
        );
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        match entries.get(key).filter(|e| e.is_live(now)) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Stored::Hash(h),
                ..
            }) => Ok(h.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(key.to_string())
            .and_modify(|e| {
                if !e.is_live(now) {
                    *e = Entry {
                        value: Stored::Hash(HashMap::new()),
                        expires_at: None,
                    };
                }
            })
            .or_insert_with(|| Entry {
                value: Stored::Hash(HashMap::new()),
                expires_at: None,
            });
        match &mut entry.value {
            Stored::Hash(h) => {
                h.insert(field.to_string(), value.to_string());
                Ok(())
            }
            Stored::Text(_) => Err(wrong_type(key)),
        }
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<String> {
        let existing = self.hget_all(key).await?;
        if let Some(v) = existing.get(field) {
            return Ok(v.clone());
        }
        self.hset(key, field, value).await?;
        Ok(value.to_string())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        if let Some(entry) = self.entries.write().await.get_mut(key) {
            if entry.is_live(now) {
                entry.expires_at = Some(now + ttl);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_holds_until_expiry() {
        tokio::time::pause();
        let backend = MemorySessionBackend::new();
        assert!(backend.set_nx("lock", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!backend.set_nx("lock", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(backend.get("lock").await.unwrap().as_deref(), Some("a"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(backend.get("lock").await.unwrap(), None);
        assert!(backend.set_nx("lock", "b", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_if_eq_only_removes_own_value() {
        let backend = MemorySessionBackend::new();
        backend.set_nx("lock", "a", Duration::from_secs(5)).await.unwrap();
        assert!(!backend.delete_if_eq("lock", "b").await.unwrap());
        assert!(backend.delete_if_eq("lock", "a").await.unwrap());
        assert!(!backend.delete_if_eq("lock", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_hash_fields_are_independent() {
        tokio::time::pause();
        let backend = MemorySessionBackend::new();
        backend.hset("s", "f1", "1").await.unwrap();
        backend.hset("s", "f2", "2").await.unwrap();
        backend.hset("s", "f1", "3").await.unwrap();
        let all = backend.hget_all("s").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["f1"], "3");

        assert_eq!(backend.hset_nx("s", "f2", "9").await.unwrap(), "2");

        backend.expire("s", Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(backend.hget_all("s").await.unwrap().is_empty());
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_an_error() {
        let backend = MemorySessionBackend::new();
        backend.set_nx("k", "v", Duration::from_secs(5)).await.unwrap();
        assert!(backend.hset("k", "f", "v").await.is_err());
        assert!(backend.hget_all("k").await.is_err());
    }
}
