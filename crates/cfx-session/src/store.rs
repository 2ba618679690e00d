//! # Session Store
//!
//! Externally persisted, lock-protected cursor state keyed by the stable
//! hash of a logical query. The lock is taken with SETNX and fails fast:
//! a busy session means "retry later", never "wait".

use std::sync::Arc;
use std::time::Duration;

use cfx_core::{Error, ResultTableOption, Result};
use tracing::debug;

use crate::backend::SessionBackend;
use crate::session::{ScrollSession, ANCHOR_FIELD};

/// Session store configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long an idle session survives.
    pub ttl: Duration,
    /// Upper bound on how long one execution may hold a session.
    pub lock_ttl: Duration,
    /// Namespace prepended to every backend key.
    pub prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            lock_ttl: Duration::from_secs(60),
            prefix: "cfx".into(),
        }
    }
}

/// Proof of holding a session lock. Pass it back to [`SessionStore::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLease {
    pub key: String,
    token: String,
}

pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    holder_id: String,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>, config: SessionConfig) -> Self {
        Self {
            backend,
            holder_id: format!("cfx-{}", uuid::Uuid::new_v4().as_simple()),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:lock:{}", self.config.prefix, key)
    }

    fn session_key(&self, key: &str) -> String {
        format!("{}:session:{}", self.config.prefix, key)
    }

    /// Take the lock for `key` and load its session.
    ///
    /// Fails with [`Error::LockBusy`] without touching any state when
    /// another execution holds the lock.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<(SessionLease, ScrollSession)> {
        let lock_key = self.lock_key(key);
        let token = format!("{}:{}", self.holder_id, uuid::Uuid::new_v4().as_simple());

        if !self.backend.set_nx(&lock_key, &token, ttl).await? {
            let holder = self
                .backend
                .get(&lock_key)
                .await?
                .map(|t| t.split(':').next().unwrap_or_default().to_string())
                .unwrap_or_default();
            debug!(key = %key, holder = %holder, "session busy");
            return Err(Error::LockBusy {
                key: key.to_string(),
                holder,
            });
        }

        let lease = SessionLease {
            key: key.to_string(),
            token,
        };
        debug!(key = %key, holder = %self.holder_id, ttl_ms = ttl.as_millis() as u64, "session acquired");

        match self.get(key).await {
            Ok(session) => Ok((lease, session)),
            Err(e) => {
                self.release(&lease).await?;
                Err(e)
            }
        }
    }

    /// Idempotent. Only removes the lock while this lease still owns it.
    pub async fn release(&self, lease: &SessionLease) -> Result<()> {
        let released = self
            .backend
            .delete_if_eq(&self.lock_key(&lease.key), &lease.token)
            .await?;
        debug!(key = %lease.key, released, "session released");
        Ok(())
    }

    /// The stored session, or an empty one.
    pub async fn get(&self, key: &str) -> Result<ScrollSession> {
        let fields = self.backend.hget_all(&self.session_key(key)).await?;
        ScrollSession::from_fields(key, fields)
    }

    /// Write one slice cursor and refresh the session TTL.
    pub async fn put(&self, key: &str, option: &ResultTableOption) -> Result<()> {
        let session_key = self.session_key(key);
        let raw = serde_json::to_string(option)?;
        self.backend.hset(&session_key, &option.key(), &raw).await?;
        self.backend.expire(&session_key, self.config.ttl).await?;
        debug!(
            key = %key,
            table_id = %option.table_id,
            connection = %option.connection,
            slice = option.slice_index,
            status = %option.status,
            "slice cursor stored"
        );
        Ok(())
    }

    /// Pin the time anchor for `key`, returning whichever anchor won.
    pub async fn pin_anchor(&self, key: &str, anchor_ms: i64) -> Result<i64> {
        let session_key = self.session_key(key);
        let stored = self
            .backend
            .hset_nx(&session_key, ANCHOR_FIELD, &anchor_ms.to_string())
            .await?;
        self.backend.expire(&session_key, self.config.ttl).await?;
        stored
            .parse::<i64>()
            .map_err(|e| Error::session(format!("bad anchor for '{}': {}", key, e)))
    }

    /// Drop the stored session (not the lock).
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.backend.delete(&self.session_key(key)).await?;
        debug!(key = %key, "session removed");
        Ok(())
    }
}
