//! JSON request and response types for the HTTP gateway.

use serde::{Deserialize, Serialize};
use testvault_core::backup::CandidateRecord;
use testvault_core::{RecordRef, RestoreSource};

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Health status.
    pub status: String,
    /// Gateway version.
    pub version: String,
    /// Whether the store answered a trivial query.
    pub store_connected: bool,
    /// Whether a maintenance operation holds the store.
    pub maintenance: bool,
}

/// Query parameters of `POST /admin/backups/prune`.
#[derive(Debug, Default, Deserialize)]
pub struct PruneParams {
    /// Generations to keep; defaults to the configured retention.
    pub keep: Option<usize>,
}

/// Records offered by an archive.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatesResponse {
    /// Staged upload token, when the archive was uploaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    /// Candidate records with conflict flags.
    pub candidates: Vec<CandidateRecord>,
}

/// Body of `POST /admin/restore/commit`.
#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    /// Archive to restore from.
    pub source: RestoreSource,
    /// Records chosen by the operator.
    pub records: Vec<RecordRef>,
}
