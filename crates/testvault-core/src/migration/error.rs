//! Migration-specific error types.

use serde::Serialize;
use thiserror::Error;

use crate::error::Error;
use crate::integrity::Violation;

/// Migration-specific errors.
///
/// Every variant is raised before the swap transaction opens, so the store is
/// untouched when one is returned. Failures inside the transaction are reported
/// as a rolled-back [`StepResult`](super::StepResult) instead.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The step definition is malformed.
    #[error("invalid migration step: {0}")]
    Validation(String),

    /// The auditor found violations the step cannot tolerate.
    #[error("step {step} blocked by {} integrity violation(s) on {table}", violations.len())]
    IntegrityViolation {
        /// Step that was blocked.
        step: String,
        /// Target table.
        table: String,
        /// Blocking violations.
        violations: Vec<Violation>,
    },

    /// The table matches neither the desired nor a recognised legacy shape.
    #[error("step {step}: table {table} has an unrecognised shape ({})", differences.join("; "))]
    UnknownShape {
        /// Step name.
        step: String,
        /// Target table.
        table: String,
        /// Differences from the desired shape.
        differences: Vec<String>,
    },

    /// The target table does not exist.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// Underlying store failure.
    #[error("storage error: {0}")]
    Storage(#[from] Error),
}

impl From<rusqlite::Error> for MigrationError {
    fn from(err: rusqlite::Error) -> Self {
        MigrationError::Storage(Error::Sqlite(err))
    }
}

impl MigrationError {
    /// Whether the error describes bad input rather than store state.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            MigrationError::Validation(_) | MigrationError::UnknownShape { .. }
        )
    }
}

/// Why a swap transaction was rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RollbackCause {
    /// The new table does not hold the same number of rows as the shadow.
    #[serde(rename_all = "camelCase")]
    RowCountMismatch {
        /// Rows in the shadow table.
        expected: u64,
        /// Rows in the new table.
        actual: u64,
    },
    /// `PRAGMA foreign_key_check` reported unresolved references.
    #[serde(rename_all = "camelCase")]
    ForeignKeyCheck {
        /// Number of offending rows.
        violations: u64,
    },
    /// Any other failure inside the transaction.
    #[serde(rename_all = "camelCase")]
    Aborted {
        /// Error text.
        message: String,
    },
}

impl std::fmt::Display for RollbackCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollbackCause::RowCountMismatch { expected, actual } => {
                write!(f, "row count mismatch: copied {actual} of {expected} rows")
            }
            RollbackCause::ForeignKeyCheck { violations } => {
                write!(f, "foreign key check failed for {violations} row(s)")
            }
            RollbackCause::Aborted { message } => write!(f, "aborted: {message}"),
        }
    }
}

impl From<rusqlite::Error> for RollbackCause {
    fn from(err: rusqlite::Error) -> Self {
        RollbackCause::Aborted {
            message: err.to_string(),
        }
    }
}

impl From<Error> for RollbackCause {
    fn from(err: Error) -> Self {
        RollbackCause::Aborted {
            message: err.to_string(),
        }
    }
}
