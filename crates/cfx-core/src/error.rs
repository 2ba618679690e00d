//! Error taxonomy shared by every CONFLUX crate.

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Federation engine error.
#[derive(Error, Debug)]
pub enum Error {
    /// The logical query cannot be turned into physical queries.
    /// Raised before any backend call is made.
    #[error("compile error: {0}")]
    Compile(String),

    /// Another execution holds the scroll session for this key.
    #[error("session '{key}' is busy (held by '{holder}'), retry later")]
    LockBusy { key: String, holder: String },

    /// A backend call failed for one (table, connection) slice.
    #[error("backend error on {table_id}@{connection}: {message}")]
    Backend {
        table_id: String,
        connection: String,
        message: String,
    },

    /// Sort keys could not be compared.
    #[error("merge error: {0}")]
    Merge(String),

    /// Session persistence is unavailable or holds unreadable state.
    #[error("session store error: {0}")]
    Session(String),

    /// The governing cancellation token fired or the deadline elapsed.
    #[error("query cancelled")]
    Cancelled,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a compile error
    pub fn compile(msg: impl Into<String>) -> Self {
        Error::Compile(msg.into())
    }

    /// Create a merge error
    pub fn merge(msg: impl Into<String>) -> Self {
        Error::Merge(msg.into())
    }

    /// Create a session store error
    pub fn session(msg: impl Into<String>) -> Self {
        Error::Session(msg.into())
    }

    /// Create a backend error tagged with its source.
    pub fn backend(
        table_id: impl Into<String>,
        connection: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Backend {
            table_id: table_id.into(),
            connection: connection.into(),
            message: message.into(),
        }
    }

    /// Only a busy session is worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockBusy { .. })
    }
}
