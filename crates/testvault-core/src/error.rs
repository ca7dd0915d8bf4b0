//! Core error types.

use thiserror::Error;

/// Store-level errors.
#[derive(Debug, Error)]
pub enum Error {
    /// SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed input, rejected before any I/O.
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Table not found in the live store.
    #[error("table not found: {0}")]
    TableNotFound(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Convenience result alias for store operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
