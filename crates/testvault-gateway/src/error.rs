//! Error handling for the gateway.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use testvault_core::{BackupError, MigrationError, SchedulerFault};
use thiserror::Error;
use tracing::error;

/// Application error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Internal server error.
    #[error("{0}")]
    Internal(String),
    /// Bad request.
    #[error("{0}")]
    BadRequest(String),
    /// Not found.
    #[error("{0}")]
    NotFound(String),
    /// The store is not in a state that allows the operation.
    #[error("{0}")]
    Conflict(String),
}

/// Error response body.
#[derive(Serialize)]
pub struct ErrorResponse {
    /// Error flag.
    pub error: bool,
    /// Error code.
    pub code: String,
    /// Error message.
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::Internal(msg) => {
                error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg)
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
        };

        let body = ErrorResponse {
            error: true,
            code: code.to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}

impl From<BackupError> for AppError {
    fn from(err: BackupError) -> Self {
        match err {
            BackupError::Validation(_) | BackupError::Archive(_) => {
                AppError::BadRequest(err.to_string())
            }
            BackupError::NotFound(_) => AppError::NotFound(err.to_string()),
            BackupError::Io(_) | BackupError::Storage(_) | BackupError::Serialization(_) => {
                AppError::Internal(err.to_string())
            }
        }
    }
}

impl From<MigrationError> for AppError {
    fn from(err: MigrationError) -> Self {
        match err {
            MigrationError::IntegrityViolation { .. } => AppError::Conflict(err.to_string()),
            MigrationError::TableNotFound(_) => AppError::NotFound(err.to_string()),
            MigrationError::Storage(_) => AppError::Internal(err.to_string()),
            MigrationError::Validation(_) | MigrationError::UnknownShape { .. } => {
                AppError::BadRequest(err.to_string())
            }
        }
    }
}

impl From<SchedulerFault> for AppError {
    fn from(fault: SchedulerFault) -> Self {
        match fault {
            SchedulerFault::Overlap => AppError::Conflict(fault.to_string()),
            SchedulerFault::CycleFailed(_) | SchedulerFault::Misfire(_) => {
                AppError::Internal(fault.to_string())
            }
        }
    }
}

impl From<testvault_core::Error> for AppError {
    fn from(err: testvault_core::Error) -> Self {
        match err {
            testvault_core::Error::Validation(_) => AppError::BadRequest(err.to_string()),
            testvault_core::Error::TableNotFound(_) => AppError::NotFound(err.to_string()),
            _ => AppError::Internal(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::Internal(format!("worker task failed: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON error: {}", err))
    }
}
