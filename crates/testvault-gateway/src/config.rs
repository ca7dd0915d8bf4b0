//! Gateway configuration.

use std::path::PathBuf;

use clap::Parser;
use testvault_core::config::{
    DEFAULT_BACKUP_TIME, DEFAULT_COPY_BATCH_SIZE, DEFAULT_DATA_DIR, DEFAULT_RETENTION,
    DEFAULT_TIMEZONE,
};
use testvault_core::{Error, ScheduleConfig, VaultConfig};

/// Default upload limit for restore archives, in MiB.
pub const DEFAULT_MAX_UPLOAD_MB: usize = 512;

/// testvault administrative gateway command line arguments.
#[derive(Debug, Parser)]
#[command(name = "testvault-gateway")]
#[command(about = "Administrative HTTP gateway for testvault")]
pub struct Args {
    /// Address to listen on for HTTP requests.
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    pub listen: String,

    /// Data directory holding the store, blobs and backups.
    #[arg(short, long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// Store file. Defaults to `<data-dir>/testvault.db`.
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Blob directory. Defaults to `<data-dir>/uploads`.
    #[arg(long)]
    pub uploads_dir: Option<PathBuf>,

    /// Backup directory. Defaults to `<data-dir>/backups`.
    #[arg(long)]
    pub backups_dir: Option<PathBuf>,

    /// Number of backup generations to keep.
    #[arg(long, default_value_t = DEFAULT_RETENTION)]
    pub retention: usize,

    /// Daily backup time (HH:MM, local to --timezone).
    #[arg(long, default_value = DEFAULT_BACKUP_TIME)]
    pub backup_time: String,

    /// IANA timezone of the backup schedule.
    #[arg(long, default_value = DEFAULT_TIMEZONE)]
    pub timezone: String,

    /// Do not arm the daily backup timer.
    #[arg(long)]
    pub no_schedule: bool,

    /// Rows copied per batch during a table swap.
    #[arg(long, default_value_t = DEFAULT_COPY_BATCH_SIZE)]
    pub copy_batch_size: usize,

    /// Largest accepted restore upload, in MiB.
    #[arg(long, default_value_t = DEFAULT_MAX_UPLOAD_MB)]
    pub max_upload_mb: usize,

    /// Run the built-in migrations before serving.
    #[arg(long)]
    pub migrate_on_start: bool,
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to listen on for HTTP requests.
    pub listen_addr: String,
    /// Data directory.
    pub data_dir: PathBuf,
    /// Store file override.
    pub store_path: Option<PathBuf>,
    /// Blob directory override.
    pub uploads_dir: Option<PathBuf>,
    /// Backup directory override.
    pub backups_dir: Option<PathBuf>,
    /// Retention window.
    pub retention: usize,
    /// Daily backup time, unparsed.
    pub backup_time: String,
    /// Schedule timezone, unparsed.
    pub timezone: String,
    /// Whether the daily timer is armed at startup.
    pub schedule_enabled: bool,
    /// Copy batch size for migrations.
    pub copy_batch_size: usize,
    /// Largest accepted request body for restore uploads.
    pub max_upload_bytes: usize,
    /// Run migrations before serving.
    pub migrate_on_start: bool,
}

impl GatewayConfig {
    /// Gateway configuration for a vault rooted at `data_dir`.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Resolve the engine configuration.
    pub fn vault(&self) -> Result<VaultConfig, Error> {
        let mut schedule = ScheduleConfig::parse(&self.backup_time, &self.timezone)?;
        if !self.schedule_enabled {
            schedule = schedule.disabled();
        }

        let mut vault = VaultConfig::new(&self.data_dir)
            .with_retention(self.retention)
            .with_schedule(schedule)
            .with_copy_batch_size(self.copy_batch_size);
        if let Some(path) = &self.store_path {
            vault = vault.with_store_path(path);
        }
        if let Some(path) = &self.uploads_dir {
            vault = vault.with_uploads_dir(path);
        }
        if let Some(path) = &self.backups_dir {
            vault = vault.with_backups_dir(path);
        }

        vault.validate()?;
        Ok(vault)
    }
}

impl From<&Args> for GatewayConfig {
    fn from(args: &Args) -> Self {
        Self {
            listen_addr: args.listen.clone(),
            data_dir: args.data_dir.clone(),
            store_path: args.store.clone(),
            uploads_dir: args.uploads_dir.clone(),
            backups_dir: args.backups_dir.clone(),
            retention: args.retention,
            backup_time: args.backup_time.clone(),
            timezone: args.timezone.clone(),
            schedule_enabled: !args.no_schedule,
            copy_batch_size: args.copy_batch_size,
            max_upload_bytes: args.max_upload_mb.saturating_mul(1024 * 1024),
            migrate_on_start: args.migrate_on_start,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            store_path: None,
            uploads_dir: None,
            backups_dir: None,
            retention: DEFAULT_RETENTION,
            backup_time: DEFAULT_BACKUP_TIME.to_string(),
            timezone: DEFAULT_TIMEZONE.to_string(),
            schedule_enabled: true,
            copy_batch_size: DEFAULT_COPY_BATCH_SIZE,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_MB * 1024 * 1024,
            migrate_on_start: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_map_to_vault_config() {
        let args = Args::parse_from([
            "testvault-gateway",
            "--data-dir",
            "/srv/vault",
            "--retention",
            "3",
            "--backup-time",
            "03:30",
            "--timezone",
            "UTC",
            "--no-schedule",
        ]);
        let config = GatewayConfig::from(&args);
        let vault = config.vault().unwrap();

        assert_eq!(vault.retention, 3);
        assert_eq!(vault.store_path, PathBuf::from("/srv/vault/testvault.db"));
        assert_eq!(vault.backups_dir, PathBuf::from("/srv/vault/backups"));
        assert!(!vault.schedule.enabled);
        assert_eq!(vault.schedule.timezone.name(), "UTC");
    }

    #[test]
    fn test_bad_schedule_is_rejected() {
        let config = GatewayConfig {
            timezone: "Mars/Olympus".to_string(),
            ..GatewayConfig::default()
        };
        assert!(matches!(config.vault(), Err(Error::Validation(_))));

        let config = GatewayConfig {
            retention: 0,
            ..GatewayConfig::default()
        };
        assert!(config.vault().is_err());
    }
}
