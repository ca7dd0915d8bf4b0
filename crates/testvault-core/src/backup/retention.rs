//! Retention-window pruning.

use std::fs;
use std::io;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, instrument, warn};

use super::error::BackupError;
use super::generation::list_generations;
use super::leases::GenerationLeases;

/// Result of a prune.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    /// Generations kept, newest first.
    pub kept: Vec<String>,
    /// Generations deleted.
    pub deleted: Vec<String>,
    /// Generations outside the window that are leased by a restore.
    pub deferred: Vec<String>,
}

/// Deletes generations beyond the retention window.
#[derive(Debug, Clone)]
pub struct RetentionPruner {
    backups_dir: PathBuf,
    leases: GenerationLeases,
}

impl RetentionPruner {
    /// Create a pruner over `backups_dir`.
    pub fn new(backups_dir: impl Into<PathBuf>, leases: GenerationLeases) -> Self {
        Self {
            backups_dir: backups_dir.into(),
            leases,
        }
    }

    /// Keep the `window` newest generations and delete the rest.
    ///
    /// Leased generations are skipped and reported as deferred; the next
    /// prune picks them up.
    #[instrument(skip(self))]
    pub fn prune(&self, window: usize) -> Result<PruneReport, BackupError> {
        if window == 0 {
            return Err(BackupError::Validation(
                "retention window must keep at least one generation".to_string(),
            ));
        }

        let generations = list_generations(&self.backups_dir)?;
        let mut report = PruneReport::default();

        for (position, generation) in generations.into_iter().enumerate() {
            if position < window {
                report.kept.push(generation.name);
                continue;
            }
            let path = self.backups_dir.join(&generation.name);
            match self.leases.try_retire(&generation.name, || fs::remove_file(&path)) {
                None => {
                    warn!(name = %generation.name, "generation in use by a restore; deferring deletion");
                    report.deferred.push(generation.name);
                }
                Some(Ok(())) => report.deleted.push(generation.name),
                Some(Err(e)) if e.kind() == io::ErrorKind::NotFound => {
                    report.deleted.push(generation.name)
                }
                Some(Err(e)) => return Err(e.into()),
            }
        }

        if !report.deleted.is_empty() || !report.deferred.is_empty() {
            info!(
                kept = report.kept.len(),
                deleted = report.deleted.len(),
                deferred = report.deferred.len(),
                "pruned backups"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::generation::generation_name;
    use chrono::{Duration, TimeZone, Utc};

    fn seed(dir: &std::path::Path, n: i64) -> Vec<String> {
        let base = Utc.with_ymd_and_hms(2026, 5, 1, 2, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let name = generation_name(base + Duration::days(i));
                fs::write(dir.join(&name), b"gen").unwrap();
                name
            })
            .collect()
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let names = seed(dir.path(), 5);
        let pruner = RetentionPruner::new(dir.path(), GenerationLeases::new());

        let report = pruner.prune(3).unwrap();
        assert_eq!(report.kept, vec![names[4].clone(), names[3].clone(), names[2].clone()]);
        assert_eq!(report.deleted, vec![names[1].clone(), names[0].clone()]);
        assert!(!dir.path().join(&names[0]).exists());

        let again = pruner.prune(3).unwrap();
        assert!(again.deleted.is_empty());
    }

    #[test]
    fn test_leased_generation_is_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let names = seed(dir.path(), 3);
        let leases = GenerationLeases::new();
        let pruner = RetentionPruner::new(dir.path(), leases.clone());

        let lease = leases.lease(&names[0]);
        let report = pruner.prune(1).unwrap();
        assert_eq!(report.deferred, vec![names[0].clone()]);
        assert_eq!(report.deleted, vec![names[1].clone()]);
        assert!(dir.path().join(&names[0]).exists());

        drop(lease);
        let report = pruner.prune(1).unwrap();
        assert_eq!(report.deleted, vec![names[0].clone()]);
    }

    #[test]
    fn test_zero_window_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pruner = RetentionPruner::new(dir.path(), GenerationLeases::new());
        assert!(matches!(pruner.prune(0), Err(BackupError::Validation(_))));
    }
}
