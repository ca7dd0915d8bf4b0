//! Engine configuration.

use std::path::{Path, PathBuf};

use chrono::NaiveTime;
use chrono_tz::Tz;

use crate::error::Error;

/// Default data directory.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Default store file name inside the data directory.
pub const DEFAULT_STORE_FILE: &str = "testvault.db";

/// Default blob directory name inside the data directory.
pub const DEFAULT_UPLOADS_DIR: &str = "uploads";

/// Default backup directory name inside the data directory.
pub const DEFAULT_BACKUPS_DIR: &str = "backups";

/// Default number of generations kept by the pruner.
pub const DEFAULT_RETENTION: usize = 7;

/// Default daily backup time.
pub const DEFAULT_BACKUP_TIME: &str = "02:00";

/// Default scheduler timezone.
pub const DEFAULT_TIMEZONE: &str = "Europe/Berlin";

/// Default number of rows copied per batch during a table swap.
pub const DEFAULT_COPY_BATCH_SIZE: usize = 500;

/// Daily backup schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    /// Whether the scheduler arms its timer on `init()`.
    pub enabled: bool,
    /// Wall-clock time of the daily cycle.
    pub time: NaiveTime,
    /// Timezone the wall-clock time is interpreted in.
    pub timezone: Tz,
}

impl ScheduleConfig {
    /// Parse an `HH:MM` time and an IANA timezone name.
    pub fn parse(time: &str, timezone: &str) -> Result<Self, Error> {
        let time = NaiveTime::parse_from_str(time.trim(), "%H:%M")
            .map_err(|e| Error::Validation(format!("invalid backup time '{time}': {e}")))?;
        let timezone: Tz = timezone
            .trim()
            .parse()
            .map_err(|e| Error::Validation(format!("invalid timezone '{timezone}': {e}")))?;

        Ok(Self {
            enabled: true,
            time,
            timezone,
        })
    }

    /// Disable the schedule.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            time: NaiveTime::from_hms_opt(2, 0, 0).unwrap_or_default(),
            timezone: chrono_tz::Europe::Berlin,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Root data directory.
    pub data_dir: PathBuf,
    /// Path of the managed store file.
    pub store_path: PathBuf,
    /// Root of the blob tree.
    pub uploads_dir: PathBuf,
    /// Directory holding backup generations.
    pub backups_dir: PathBuf,
    /// Number of most-recent generations kept.
    pub retention: usize,
    /// Daily backup schedule.
    pub schedule: ScheduleConfig,
    /// Rows copied per batch during a table swap.
    pub copy_batch_size: usize,
}

impl VaultConfig {
    /// Create a configuration rooted at `data_dir` with default layout.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            store_path: data_dir.join(DEFAULT_STORE_FILE),
            uploads_dir: data_dir.join(DEFAULT_UPLOADS_DIR),
            backups_dir: data_dir.join(DEFAULT_BACKUPS_DIR),
            data_dir,
            retention: DEFAULT_RETENTION,
            schedule: ScheduleConfig::default(),
            copy_batch_size: DEFAULT_COPY_BATCH_SIZE,
        }
    }

    /// Set the store file path.
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = path.into();
        self
    }

    /// Set the blob directory.
    pub fn with_uploads_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.uploads_dir = path.into();
        self
    }

    /// Set the backup directory.
    pub fn with_backups_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.backups_dir = path.into();
        self
    }

    /// Set the retention window.
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    /// Set the backup schedule.
    pub fn with_schedule(mut self, schedule: ScheduleConfig) -> Self {
        self.schedule = schedule;
        self
    }

    /// Set the copy batch size.
    pub fn with_copy_batch_size(mut self, size: usize) -> Self {
        self.copy_batch_size = size.max(1);
        self
    }

    /// Directory holding staged restore uploads.
    pub fn staging_dir(&self) -> PathBuf {
        self.backups_dir.join("restore-staging")
    }

    /// Check the configuration for values that can never work.
    pub fn validate(&self) -> Result<(), Error> {
        if self.retention == 0 {
            return Err(Error::Validation(
                "retention window must keep at least one generation".to_string(),
            ));
        }
        if is_nested(&self.backups_dir, &self.uploads_dir) {
            return Err(Error::Validation(
                "backup directory must not live inside the blob tree".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_DIR)
    }
}

fn is_nested(inner: &Path, outer: &Path) -> bool {
    inner.starts_with(outer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VaultConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.store_path, PathBuf::from("./data/testvault.db"));
        assert_eq!(config.backups_dir, PathBuf::from("./data/backups"));
        assert_eq!(config.retention, DEFAULT_RETENTION);
        assert!(config.schedule.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = VaultConfig::new("/srv/vault")
            .with_retention(3)
            .with_copy_batch_size(0)
            .with_uploads_dir("/srv/files");

        assert_eq!(config.retention, 3);
        assert_eq!(config.copy_batch_size, 1);
        assert_eq!(config.uploads_dir, PathBuf::from("/srv/files"));
        assert_eq!(
            config.staging_dir(),
            PathBuf::from("/srv/vault/backups/restore-staging")
        );
    }

    #[test]
    fn test_zero_retention_rejected() {
        let config = VaultConfig::default().with_retention(0);
        assert!(matches!(config.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_backups_inside_uploads_rejected() {
        let config = VaultConfig::new("/srv/vault").with_backups_dir("/srv/vault/uploads/bk");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_schedule_parse() {
        let schedule = ScheduleConfig::parse("03:30", "UTC").unwrap();
        assert_eq!(schedule.time, NaiveTime::from_hms_opt(3, 30, 0).unwrap());
        assert_eq!(schedule.timezone, chrono_tz::UTC);

        assert!(ScheduleConfig::parse("25:00", "UTC").is_err());
        assert!(ScheduleConfig::parse("03:30", "Mars/Olympus").is_err());
    }
}
