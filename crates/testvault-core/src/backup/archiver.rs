//! Compressed point-in-time snapshots of the store and the blob tree.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use rusqlite::{Connection, DatabaseName};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use super::error::BackupError;
use super::generation::{
    format_size, generation_name, list_generations, validate_name, BackupGeneration,
    PARTIAL_SUFFIX,
};
use crate::config::VaultConfig;
use crate::migration::ledger::{self, LedgerEntry};
use crate::store::SharedStore;

/// Archive member holding the manifest.
pub const MANIFEST_NAME: &str = "manifest.json";

/// Archive directory holding the store snapshot.
pub const STORE_DIR: &str = "store";

/// Archive directory holding the blob tree.
pub const UPLOADS_DIR: &str = "uploads";

/// Current manifest format.
pub const FORMAT_VERSION: u32 = 1;

const SNAPSHOT_PREFIX: &str = ".snapshot-";

/// Description of a generation's contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Manifest format version.
    pub format_version: u32,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// File name of the store snapshot under `store/`.
    pub store_file: String,
    /// Size of the store snapshot.
    pub store_bytes: u64,
    /// Hex SHA-256 of the store snapshot.
    pub store_sha256: String,
    /// Schema-version ledger at snapshot time.
    pub schema_versions: Vec<LedgerEntry>,
    /// Number of blob files.
    pub blob_files: u64,
    /// Total blob bytes.
    pub blob_bytes: u64,
    /// Source paths captured.
    pub sources: Vec<String>,
}

/// Produces backup generations.
///
/// One archiver is shared per process; its job gate keeps at most one archive
/// in flight, and the store-copy phase additionally holds the maintenance lock.
pub struct BackupArchiver {
    store: SharedStore,
    uploads_dir: PathBuf,
    backups_dir: PathBuf,
    store_file: String,
    job_gate: Mutex<()>,
}

impl BackupArchiver {
    /// Create an archiver for `store` using the layout in `config`.
    pub fn new(store: SharedStore, config: &VaultConfig) -> Self {
        let store_file = config
            .store_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(crate::config::DEFAULT_STORE_FILE)
            .to_string();

        Self {
            store,
            uploads_dir: config.uploads_dir.clone(),
            backups_dir: config.backups_dir.clone(),
            store_file,
            job_gate: Mutex::new(()),
        }
    }

    /// Directory holding generations.
    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    /// Whether an archive job is running.
    pub fn is_busy(&self) -> bool {
        self.job_gate.is_locked()
    }

    /// Generations, newest first.
    pub fn list(&self) -> Result<Vec<BackupGeneration>, BackupError> {
        list_generations(&self.backups_dir)
    }

    /// Path of an existing generation, for download.
    pub fn open_generation(&self, name: &str) -> Result<PathBuf, BackupError> {
        validate_name(name)?;
        let path = self.backups_dir.join(name);
        if !path.is_file() {
            return Err(BackupError::NotFound(name.to_string()));
        }
        Ok(path)
    }

    /// Manifest of an existing generation.
    pub fn read_manifest(&self, name: &str) -> Result<Manifest, BackupError> {
        read_manifest(&self.open_generation(name)?)
    }

    /// Remove artifacts and snapshot directories left behind by a crash.
    pub fn sweep_partials(&self) -> Result<usize, BackupError> {
        let _job = self.job_gate.lock();
        let entries = match fs::read_dir(&self.backups_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(PARTIAL_SUFFIX) {
                fs::remove_file(entry.path())?;
                removed += 1;
            } else if name.starts_with(SNAPSHOT_PREFIX) && entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            warn!(removed, "removed leftover partial backups");
        }
        Ok(removed)
    }

    /// Create a new generation.
    #[instrument(skip(self))]
    pub fn create_backup(&self) -> Result<BackupGeneration, BackupError> {
        let _job = self.job_gate.lock();
        let started = Instant::now();
        fs::create_dir_all(&self.backups_dir)?;

        let snapshot_dir = tempfile::Builder::new()
            .prefix(SNAPSHOT_PREFIX)
            .tempdir_in(&self.backups_dir)?;
        let snapshot_path = snapshot_dir.path().join(&self.store_file);
        let schema_versions = self.snapshot_store(&snapshot_path)?;

        let (store_bytes, store_sha256) = hash_file(&snapshot_path)?;
        let blobs = collect_files(&self.uploads_dir)?;
        let blob_bytes = blobs.iter().map(|(_, len)| len).sum();

        let (name, created_at) = self.allocate_name(Utc::now());
        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            created_at: created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            store_file: self.store_file.clone(),
            store_bytes,
            store_sha256,
            schema_versions,
            blob_files: blobs.len() as u64,
            blob_bytes,
            sources: self.sources(),
        };

        let final_path = self.publish(&name, |partial| {
            self.write_archive(partial, &manifest, &snapshot_path, &blobs, created_at)
        })?;

        let size_bytes = fs::metadata(&final_path)?.len();
        info!(
            name = %name,
            size_bytes,
            blob_files = manifest.blob_files,
            duration_ms = started.elapsed().as_millis() as u64,
            "backup created"
        );

        Ok(BackupGeneration {
            name,
            created_at,
            size_bytes,
            size_formatted: format_size(size_bytes),
            sources: manifest.sources,
        })
    }

    /// Run `write` against `{name}.partial`, then rename it to `name`.
    ///
    /// The partial file is removed when writing or renaming fails.
    fn publish(
        &self,
        name: &str,
        write: impl FnOnce(&Path) -> Result<(), BackupError>,
    ) -> Result<PathBuf, BackupError> {
        let final_path = self.backups_dir.join(name);
        let partial_path = self.backups_dir.join(format!("{name}{PARTIAL_SUFFIX}"));

        let written = write(&partial_path)
            .and_then(|()| fs::rename(&partial_path, &final_path).map_err(BackupError::from));
        if let Err(e) = written {
            warn!(error = %e, "backup failed; discarding partial artifact");
            if let Err(cleanup) = fs::remove_file(&partial_path) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!(error = %cleanup, "failed to remove partial artifact");
                }
            }
            return Err(e);
        }
        Ok(final_path)
    }

    /// Copy the live store into `dest` under the maintenance lock.
    fn snapshot_store(&self, dest: &Path) -> Result<Vec<LedgerEntry>, BackupError> {
        let entries = {
            let _guard = self.store.maintenance().acquire("backup");
            self.store.with_conn(|conn| {
                conn.backup(DatabaseName::Main, dest, None)?;
                ledger::entries(conn)
            })?
        };

        // The snapshot must be self-contained for read-only opening later.
        let snapshot = Connection::open(dest)?;
        let _mode: String =
            snapshot.pragma_update_and_check(None, "journal_mode", "DELETE", |row| row.get(0))?;
        drop(snapshot);

        debug!(path = %dest.display(), "store snapshot taken");
        Ok(entries)
    }

    fn allocate_name(&self, now: DateTime<Utc>) -> (String, DateTime<Utc>) {
        let mut at = now;
        loop {
            let name = generation_name(at);
            let taken = self.backups_dir.join(&name).exists()
                || self
                    .backups_dir
                    .join(format!("{name}{PARTIAL_SUFFIX}"))
                    .exists();
            if !taken {
                return (name, at);
            }
            at += Duration::milliseconds(1);
        }
    }

    fn write_archive(
        &self,
        path: &Path,
        manifest: &Manifest,
        snapshot: &Path,
        blobs: &[(PathBuf, u64)],
        created_at: DateTime<Utc>,
    ) -> Result<(), BackupError> {
        let file = File::create(path)?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let manifest_bytes = serde_json::to_vec_pretty(manifest)?;
        let mut header = tar::Header::new_gnu();
        header.set_size(manifest_bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(created_at.timestamp().max(0) as u64);
        header.set_cksum();
        builder.append_data(&mut header, MANIFEST_NAME, manifest_bytes.as_slice())?;

        builder.append_path_with_name(
            snapshot,
            Path::new(STORE_DIR).join(&manifest.store_file),
        )?;

        for (relative, _) in blobs {
            builder.append_path_with_name(
                self.uploads_dir.join(relative),
                Path::new(UPLOADS_DIR).join(relative),
            )?;
        }

        let encoder = builder.into_inner()?;
        let writer = encoder.finish()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }

    fn sources(&self) -> Vec<String> {
        vec![
            self.store
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ":memory:".to_string()),
            self.uploads_dir.display().to_string(),
        ]
    }
}

/// Regular files under `root` as `(relative path, size)`, sorted.
fn collect_files(root: &Path) -> Result<Vec<(PathBuf, u64)>, BackupError> {
    let mut out = Vec::new();
    if root.is_dir() {
        walk(root, Path::new(""), &mut out)?;
    }
    out.sort();
    Ok(out)
}

fn walk(root: &Path, relative: &Path, out: &mut Vec<(PathBuf, u64)>) -> Result<(), BackupError> {
    for entry in fs::read_dir(root.join(relative))? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let child = relative.join(entry.file_name());
        if file_type.is_dir() {
            walk(root, &child, out)?;
        } else if file_type.is_file() {
            out.push((child, entry.metadata()?.len()));
        }
    }
    Ok(())
}

fn hash_file(path: &Path) -> Result<(u64, String), BackupError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let bytes = io::copy(&mut reader, &mut hasher)?;
    Ok((bytes, hex::encode(hasher.finalize())))
}

/// Open a generation artifact for sequential reading.
pub(crate) fn open_archive(path: &Path) -> Result<tar::Archive<GzDecoder<BufReader<File>>>, BackupError> {
    let file = File::open(path)?;
    Ok(tar::Archive::new(GzDecoder::new(BufReader::new(file))))
}

/// Read the manifest of the artifact at `path`.
pub fn read_manifest(path: &Path) -> Result<Manifest, BackupError> {
    let mut archive = open_archive(path)?;
    for entry in archive
        .entries()
        .map_err(|e| BackupError::Archive(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| BackupError::Archive(e.to_string()))?;
        if entry.path()?.as_ref() == Path::new(MANIFEST_NAME) {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            let manifest: Manifest = serde_json::from_slice(&buf)
                .map_err(|e| BackupError::Archive(format!("bad manifest: {e}")))?;
            if manifest.format_version > FORMAT_VERSION {
                return Err(BackupError::Archive(format!(
                    "unsupported manifest version {}",
                    manifest.format_version
                )));
            }
            return Ok(manifest);
        }
    }
    Err(BackupError::Archive("archive has no manifest".to_string()))
}

/// Relative path with only normal components, or `None`.
pub(crate) fn safe_relative(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}
