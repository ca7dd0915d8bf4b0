//! Backup and restore error types.

use thiserror::Error;

use crate::error::Error;

/// Errors raised by archiving, pruning and restoring.
///
/// Per-record restore conflicts are not errors; they are reported in
/// [`RestoreResult`](super::RestoreResult).
#[derive(Debug, Error)]
pub enum BackupError {
    /// Malformed request, rejected before any I/O.
    #[error("validation error: {0}")]
    Validation(String),

    /// Generation or staged upload not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The archive is unreadable or lacks required members.
    #[error("invalid archive: {0}")]
    Archive(String),

    /// Store failure.
    #[error("storage error: {0}")]
    Storage(#[from] Error),

    /// Manifest encoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for BackupError {
    fn from(err: rusqlite::Error) -> Self {
        BackupError::Storage(Error::Sqlite(err))
    }
}
