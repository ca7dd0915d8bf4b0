//! Generation naming and listing.
//!
//! Artifacts are named `testvault-YYYYMMDDTHHMMSSmmmZ.tar.gz`. The token is
//! zero-padded UTC, so byte-wise name order equals creation order.

use std::fs;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::Serialize;

use super::error::BackupError;

/// Artifact name prefix.
pub const ARTIFACT_PREFIX: &str = "testvault-";

/// Artifact name suffix.
pub const ARTIFACT_SUFFIX: &str = ".tar.gz";

/// Suffix of in-progress artifacts.
pub const PARTIAL_SUFFIX: &str = ".partial";

const TOKEN_LEN: usize = 19;

/// A listed backup generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupGeneration {
    /// Artifact file name.
    pub name: String,
    /// Creation time, taken from the name token.
    pub created_at: DateTime<Utc>,
    /// Artifact size.
    pub size_bytes: u64,
    /// Artifact size in binary units.
    pub size_formatted: String,
    /// Source paths captured, when known.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
}

/// Artifact name for a generation created at `at`.
pub fn generation_name(at: DateTime<Utc>) -> String {
    format!(
        "{ARTIFACT_PREFIX}{}{ARTIFACT_SUFFIX}",
        at.format("%Y%m%dT%H%M%S%3fZ")
    )
}

/// Timestamp encoded in an artifact name.
pub fn parse_generation_name(name: &str) -> Option<DateTime<Utc>> {
    let token = name
        .strip_prefix(ARTIFACT_PREFIX)?
        .strip_suffix(ARTIFACT_SUFFIX)?;
    if token.len() != TOKEN_LEN
        || !token.is_ascii()
        || token.as_bytes()[8] != b'T'
        || !token.ends_with('Z')
    {
        return None;
    }

    let digits = |range: std::ops::Range<usize>| -> Option<u32> {
        let s = &token[range];
        if s.bytes().all(|b| b.is_ascii_digit()) {
            s.parse().ok()
        } else {
            None
        }
    };

    let date = NaiveDate::from_ymd_opt(digits(0..4)? as i32, digits(4..6)?, digits(6..8)?)?;
    let time = NaiveTime::from_hms_milli_opt(
        digits(9..11)?,
        digits(11..13)?,
        digits(13..15)?,
        digits(15..18)?,
    )?;
    Some(NaiveDateTime::new(date, time).and_utc())
}

/// Reject anything that is not a well-formed artifact name.
pub fn validate_name(name: &str) -> Result<DateTime<Utc>, BackupError> {
    if name.contains(['/', '\\']) || name.contains("..") {
        return Err(BackupError::Validation(format!(
            "generation name must not contain path components: {name}"
        )));
    }
    parse_generation_name(name)
        .ok_or_else(|| BackupError::Validation(format!("not a generation name: {name}")))
}

/// Size in binary units with one decimal (`B`, `KB`, `MB`, `GB`).
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// All generations in `dir`, newest first. A missing directory lists nothing.
pub fn list_generations(dir: &Path) -> Result<Vec<BackupGeneration>, BackupError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut generations = Vec::new();
    for entry in entries {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let Some(created_at) = parse_generation_name(&name) else {
            continue;
        };
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        generations.push(BackupGeneration {
            name,
            created_at,
            size_bytes: meta.len(),
            size_formatted: format_size(meta.len()),
            sources: Vec::new(),
        });
    }

    generations.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.name.cmp(&a.name)));
    Ok(generations)
}
