//! Selective, insert-only restore from a generation or an uploaded archive.
//!
//! The archive is never modified: the store snapshot is extracted into a
//! scratch directory and opened read-only. Selected records are inserted into
//! the live store parents-first in one transaction; a record whose identity
//! already exists live is reported as a conflict and left alone.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OpenFlags, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::archiver::{open_archive, read_manifest, safe_relative, STORE_DIR, UPLOADS_DIR};
use super::error::BackupError;
use super::generation::validate_name;
use super::leases::{GenerationLease, GenerationLeases};
use crate::config::VaultConfig;
use crate::schema::{ManagedTable, SchemaRegistry, TableShape};
use crate::store::{quote_ident, table_exists, SharedStore};

const STAGED_SUFFIX: &str = ".tar.gz";
const BLOB_STAGING_PREFIX: &str = ".blobs-";

/// Where restored records come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RestoreSource {
    /// A listed generation, by name.
    Generation(String),
    /// A staged upload, by token.
    Upload(String),
}

/// Identity of one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordRef {
    /// Managed table.
    pub table: String,
    /// Identity value.
    pub id: i64,
}

impl RecordRef {
    /// Create a reference.
    pub fn new(table: impl Into<String>, id: i64) -> Self {
        Self {
            table: table.into(),
            id,
        }
    }
}

/// A record offered for restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRecord {
    /// Managed table.
    pub table: String,
    /// Identity value.
    pub id: i64,
    /// Operator-facing label.
    pub label: Option<String>,
    /// Whether the identity already exists live.
    pub conflict: bool,
}

/// A selected record that could not be imported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedRecord {
    /// Managed table.
    pub table: String,
    /// Identity value.
    pub id: i64,
    /// Why it was rejected.
    pub reason: String,
}

/// Result of [`RestoreCoordinator::restore`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    /// Records inserted.
    pub imported: Vec<RecordRef>,
    /// Records skipped because the identity exists live.
    pub conflicts: Vec<RecordRef>,
    /// Records that failed validation against the live store.
    pub rejected: Vec<RejectedRecord>,
    /// Blob files written into the live tree.
    pub blobs: Vec<String>,
    /// Blob files extracted but not placed after the records committed.
    pub blob_failures: Vec<BlobFailure>,
}

/// A restored blob that could not be moved into the live tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobFailure {
    /// Path relative to the uploads directory.
    pub path: String,
    /// Why placement failed.
    pub reason: String,
}

/// An uploaded archive awaiting preview and commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedUpload {
    /// Token for later calls.
    pub upload_id: String,
    /// Archive size.
    pub size_bytes: u64,
}

/// Reads archives and merges selected records into the live store.
pub struct RestoreCoordinator {
    store: SharedStore,
    registry: Arc<SchemaRegistry>,
    backups_dir: PathBuf,
    staging_dir: PathBuf,
    uploads_dir: PathBuf,
    leases: GenerationLeases,
}

/// Blob files extracted ahead of a commit, deleted on drop.
#[derive(Default)]
struct StagedBlobs {
    dir: Option<TempDir>,
    files: Vec<PathBuf>,
}

/// Extracted store snapshot, deleted on drop.
struct Snapshot {
    conn: Connection,
    _dir: TempDir,
}

enum Attempt {
    Imported(Option<PathBuf>),
    Conflict,
    Rejected(String),
    Waiting(String),
}

impl RestoreCoordinator {
    /// Create a coordinator.
    pub fn new(
        store: SharedStore,
        registry: Arc<SchemaRegistry>,
        config: &VaultConfig,
        leases: GenerationLeases,
    ) -> Self {
        Self {
            store,
            registry,
            backups_dir: config.backups_dir.clone(),
            staging_dir: config.staging_dir(),
            uploads_dir: config.uploads_dir.clone(),
            leases,
        }
    }

    /// Store an uploaded archive for later preview and commit.
    pub fn stage_upload(&self, mut body: impl Read) -> Result<StagedUpload, BackupError> {
        fs::create_dir_all(&self.staging_dir)?;
        let upload_id = Uuid::new_v4().to_string();
        let path = self.staged_path(&upload_id);
        let partial = path.with_extension("partial");

        let written = (|| -> Result<u64, BackupError> {
            let mut out = BufWriter::new(File::create(&partial)?);
            let size = io::copy(&mut body, &mut out)?;
            out.flush()?;
            fs::rename(&partial, &path)?;
            // Decoding failures surface as io errors from the gzip reader.
            read_manifest(&path).map_err(|e| match e {
                BackupError::Io(e) => BackupError::Archive(e.to_string()),
                other => other,
            })?;
            Ok(size)
        })();

        match written {
            Ok(size_bytes) => {
                info!(upload_id = %upload_id, size_bytes, "restore upload staged");
                Ok(StagedUpload {
                    upload_id,
                    size_bytes,
                })
            }
            Err(e) => {
                remove_leftover(&partial);
                remove_leftover(&path);
                Err(e)
            }
        }
    }

    /// Stage an uploaded archive and list what it offers. The upload is
    /// discarded when the preview fails.
    pub fn stage_and_preview(
        &self,
        body: impl Read,
    ) -> Result<(StagedUpload, Vec<CandidateRecord>), BackupError> {
        let staged = self.stage_upload(body)?;
        match self.preview(&RestoreSource::Upload(staged.upload_id.clone())) {
            Ok(candidates) => Ok((staged, candidates)),
            Err(e) => {
                if let Err(cleanup) = self.discard_upload(&staged.upload_id) {
                    warn!(upload_id = %staged.upload_id, error = %cleanup, "failed to remove staged upload");
                }
                Err(e)
            }
        }
    }

    /// Delete a staged upload.
    pub fn discard_upload(&self, upload_id: &str) -> Result<(), BackupError> {
        let path = self.resolve_upload(upload_id)?;
        fs::remove_file(path)?;
        debug!(upload_id, "restore upload discarded");
        Ok(())
    }

    /// List the records an archive offers, with conflict flags.
    #[instrument(skip(self))]
    pub fn preview(&self, source: &RestoreSource) -> Result<Vec<CandidateRecord>, BackupError> {
        let (path, _lease) = self.resolve(source)?;
        let snapshot = open_snapshot(&path)?;

        let mut candidates = Vec::new();
        self.store.with_conn(|live| {
            for table in self.registry.dependency_order() {
                let Some(shape) = TableShape::load(&snapshot.conn, &table.name)? else {
                    continue;
                };
                if !shape.has_column(&table.identity) || !table_exists(live, &table.name)? {
                    continue;
                }

                let id = quote_ident(&table.identity);
                let label = match &table.label_column {
                    Some(c) if shape.has_column(c) => format!("CAST({} AS TEXT)", quote_ident(c)),
                    _ => "NULL".to_string(),
                };
                let name = quote_ident(&table.name);

                let mut exists = live.prepare(&format!("SELECT 1 FROM {name} WHERE {id} = ?1"))?;
                let mut stmt = snapshot
                    .conn
                    .prepare(&format!("SELECT {id}, {label} FROM {name} ORDER BY {id}"))?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
                })?;
                for row in rows {
                    let (record_id, label) = row?;
                    candidates.push(CandidateRecord {
                        table: table.name.clone(),
                        id: record_id,
                        label,
                        conflict: exists.exists([record_id])?,
                    });
                }
            }
            Ok::<_, BackupError>(())
        })?;

        debug!(candidates = candidates.len(), "restore preview built");
        Ok(candidates)
    }

    /// Insert the selected records that do not collide with live identities.
    #[instrument(skip(self, selection), fields(selected = selection.len()))]
    pub fn restore(
        &self,
        source: &RestoreSource,
        selection: &[RecordRef],
    ) -> Result<RestoreResult, BackupError> {
        if selection.is_empty() {
            return Err(BackupError::Validation(
                "restore requires an explicit, non-empty selection".to_string(),
            ));
        }
        if let Some(unknown) = selection.iter().find(|r| !self.registry.is_managed(&r.table)) {
            return Err(BackupError::Validation(format!(
                "{} is not a managed table",
                unknown.table
            )));
        }

        let (path, lease) = self.resolve(source)?;
        let snapshot = open_snapshot(&path)?;

        let mut result = RestoreResult::default();
        let staged = {
            let _guard = self.store.maintenance().acquire("restore");
            self.store.with_conn_mut(|live| {
                let tx = live.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut blob_paths = Vec::new();
                self.import(&tx, &snapshot.conn, selection, &mut result, &mut blob_paths)?;
                // Extraction failures roll the records back with the transaction.
                let staged = self.stage_blobs(&path, &blob_paths)?;
                tx.commit()?;
                Ok::<_, BackupError>(staged)
            })?
        };
        drop(snapshot);
        drop(lease);

        self.place_blobs(staged, &mut result);

        if let RestoreSource::Upload(id) = source {
            if let Err(e) = self.discard_upload(id) {
                warn!(upload_id = %id, error = %e, "failed to remove staged upload");
            }
        }

        info!(
            imported = result.imported.len(),
            conflicts = result.conflicts.len(),
            rejected = result.rejected.len(),
            blobs = result.blobs.len(),
            blob_failures = result.blob_failures.len(),
            "restore committed"
        );
        Ok(result)
    }

    fn import(
        &self,
        live: &Connection,
        snapshot: &Connection,
        selection: &[RecordRef],
        result: &mut RestoreResult,
        blob_paths: &mut Vec<PathBuf>,
    ) -> Result<(), BackupError> {
        let rank: HashMap<&str, usize> = self
            .registry
            .dependency_order()
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.as_str(), i))
            .collect();

        let mut pending: Vec<RecordRef> = selection.to_vec();
        pending.sort_by(|a, b| {
            let ra = rank.get(a.table.as_str()).copied().unwrap_or(usize::MAX);
            let rb = rank.get(b.table.as_str()).copied().unwrap_or(usize::MAX);
            ra.cmp(&rb).then(a.id.cmp(&b.id))
        });
        pending.dedup();
        let mut unresolved: HashSet<RecordRef> = pending.iter().cloned().collect();

        while !pending.is_empty() {
            let mut waiting = Vec::new();
            let mut progressed = false;

            for record in pending.drain(..) {
                let Some(table) = self.registry.table(&record.table) else {
                    continue;
                };
                match try_import(live, snapshot, table, record.id, &unresolved)? {
                    Attempt::Waiting(reason) => {
                        waiting.push((record, reason));
                        continue;
                    }
                    Attempt::Imported(blob) => {
                        blob_paths.extend(blob);
                        result.imported.push(record.clone());
                    }
                    Attempt::Conflict => result.conflicts.push(record.clone()),
                    Attempt::Rejected(reason) => result.rejected.push(RejectedRecord {
                        table: record.table.clone(),
                        id: record.id,
                        reason,
                    }),
                }
                unresolved.remove(&record);
                progressed = true;
            }

            if !progressed {
                for (record, reason) in waiting {
                    result.rejected.push(RejectedRecord {
                        table: record.table,
                        id: record.id,
                        reason: format!("unresolvable dependency: {reason}"),
                    });
                }
                break;
            }
            pending = waiting.into_iter().map(|(record, _)| record).collect();
        }

        Ok(())
    }

    /// Extract the wanted blobs that are absent live into a scratch
    /// directory, creating their destination directories in the live tree.
    fn stage_blobs(&self, archive: &Path, wanted: &[PathBuf]) -> Result<StagedBlobs, BackupError> {
        let mut staged = StagedBlobs::default();
        if wanted.is_empty() {
            return Ok(staged);
        }
        let wanted: HashSet<&PathBuf> = wanted.iter().collect();

        fs::create_dir_all(&self.staging_dir)?;
        let dir = tempfile::Builder::new()
            .prefix(BLOB_STAGING_PREFIX)
            .tempdir_in(&self.staging_dir)?;

        let mut archive = open_archive(archive)?;
        for entry in archive
            .entries()
            .map_err(|e| BackupError::Archive(e.to_string()))?
        {
            let mut entry = entry.map_err(|e| BackupError::Archive(e.to_string()))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path()?.into_owned();
            let Ok(relative) = path.strip_prefix(UPLOADS_DIR) else {
                continue;
            };
            let Some(relative) = safe_relative(relative) else {
                warn!(path = %path.display(), "skipping unsafe archive path");
                continue;
            };
            if !wanted.contains(&relative) || staged.files.contains(&relative) {
                continue;
            }

            let dest = self.uploads_dir.join(&relative);
            if dest.exists() {
                debug!(path = %relative.display(), "blob already present; keeping live copy");
                continue;
            }
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }

            let scratch = dir.path().join(&relative);
            if let Some(parent) = scratch.parent() {
                fs::create_dir_all(parent)?;
            }
            entry.unpack(&scratch)?;
            staged.files.push(relative);
        }

        staged.dir = Some(dir);
        Ok(staged)
    }

    /// Move staged blobs into the live tree. Runs after the commit, so
    /// failures are reported per file rather than returned.
    fn place_blobs(&self, staged: StagedBlobs, result: &mut RestoreResult) {
        let Some(dir) = staged.dir else {
            return;
        };
        for relative in staged.files {
            let path = relative.display().to_string();
            let dest = self.uploads_dir.join(&relative);
            if dest.exists() {
                debug!(path = %path, "blob appeared during restore; keeping live copy");
                continue;
            }
            match move_into_place(&dir.path().join(&relative), &dest) {
                Ok(()) => result.blobs.push(path),
                Err(e) => {
                    warn!(path = %path, error = %e, "failed to place restored blob");
                    result.blob_failures.push(BlobFailure {
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    fn resolve(
        &self,
        source: &RestoreSource,
    ) -> Result<(PathBuf, Option<GenerationLease>), BackupError> {
        match source {
            RestoreSource::Generation(name) => {
                validate_name(name)?;
                let lease = self.leases.lease(name);
                let path = self.backups_dir.join(name);
                if !path.is_file() {
                    return Err(BackupError::NotFound(name.clone()));
                }
                Ok((path, Some(lease)))
            }
            RestoreSource::Upload(id) => Ok((self.resolve_upload(id)?, None)),
        }
    }

    fn resolve_upload(&self, upload_id: &str) -> Result<PathBuf, BackupError> {
        let id = Uuid::parse_str(upload_id)
            .map_err(|_| BackupError::Validation(format!("invalid upload id: {upload_id}")))?;
        let path = self.staged_path(&id.to_string());
        if !path.is_file() {
            return Err(BackupError::NotFound(format!("upload {upload_id}")));
        }
        Ok(path)
    }

    fn staged_path(&self, upload_id: &str) -> PathBuf {
        self.staging_dir.join(format!("{upload_id}{STAGED_SUFFIX}"))
    }
}

fn remove_leftover(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove staged file");
        }
    }
}

fn move_into_place(src: &Path, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    // Staging may sit on another filesystem.
    fs::rename(src, dest).or_else(|_| fs::copy(src, dest).map(|_| ()))
}

/// Extract the store snapshot from an archive and open it read-only.
fn open_snapshot(archive_path: &Path) -> Result<Snapshot, BackupError> {
    let manifest = read_manifest(archive_path)?;
    let member = Path::new(STORE_DIR).join(&manifest.store_file);
    let dir = tempfile::tempdir()?;
    let dest = dir.path().join("snapshot.db");

    let mut found = false;
    let mut archive = open_archive(archive_path)?;
    for entry in archive
        .entries()
        .map_err(|e| BackupError::Archive(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| BackupError::Archive(e.to_string()))?;
        if entry.path()?.as_ref() == member.as_path() {
            entry.unpack(&dest)?;
            found = true;
            break;
        }
    }
    if !found {
        return Err(BackupError::Archive(format!(
            "archive has no {}",
            member.display()
        )));
    }

    let conn = Connection::open_with_flags(&dest, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    Ok(Snapshot { conn, _dir: dir })
}

fn try_import(
    live: &Connection,
    snapshot: &Connection,
    table: &ManagedTable,
    id: i64,
    unresolved: &HashSet<RecordRef>,
) -> Result<Attempt, BackupError> {
    let Some(snap_shape) = TableShape::load(snapshot, &table.name)? else {
        return Ok(Attempt::Rejected("table not present in archive".to_string()));
    };
    let Some(live_shape) = TableShape::load(live, &table.name)? else {
        return Ok(Attempt::Rejected("table not present in live store".to_string()));
    };

    let name = quote_ident(&table.name);
    let identity = quote_ident(&table.identity);

    let exists = live
        .prepare_cached(&format!("SELECT 1 FROM {name} WHERE {identity} = ?1"))?
        .exists([id])?;
    if exists {
        return Ok(Attempt::Conflict);
    }

    let shared: Vec<&str> = live_shape
        .columns
        .iter()
        .map(|c| c.name.as_str())
        .filter(|c| snap_shape.has_column(c))
        .collect();
    let column_list: Vec<String> = shared.iter().map(|c| quote_ident(c)).collect();
    let column_list = column_list.join(", ");

    let mut stmt = snapshot.prepare(&format!(
        "SELECT {column_list} FROM {name} WHERE {identity} = ?1"
    ))?;
    let mut rows = stmt.query([id])?;
    let Some(row) = rows.next()? else {
        return Ok(Attempt::Rejected("record not present in archive".to_string()));
    };
    let mut values = Vec::with_capacity(shared.len());
    for i in 0..shared.len() {
        values.push(row.get::<_, Value>(i)?);
    }
    drop(rows);

    let value_of = |column: &str| shared.iter().position(|c| *c == column).map(|i| &values[i]);

    for edge in &table.edges {
        let value = match value_of(&edge.column) {
            None | Some(Value::Null) => {
                if edge.required {
                    return Ok(Attempt::Rejected(format!(
                        "required reference {} is null",
                        edge.column
                    )));
                }
                continue;
            }
            Some(value) => value,
        };

        let parent_live = table_exists(live, &edge.parent)?
            && live
                .prepare_cached(&format!(
                    "SELECT 1 FROM {} WHERE {} = ?1",
                    quote_ident(&edge.parent),
                    quote_ident(&edge.parent_column)
                ))?
                .exists(params![value])?;
        if parent_live {
            continue;
        }

        let description = format!("{}.{} = {}", edge.parent, edge.parent_column, display(value));
        if let Value::Integer(parent_id) = value {
            if unresolved.contains(&RecordRef::new(edge.parent.clone(), *parent_id)) {
                return Ok(Attempt::Waiting(description));
            }
        }
        return Ok(Attempt::Rejected(format!("missing parent {description}")));
    }

    let placeholders: Vec<String> = (1..=shared.len()).map(|i| format!("?{i}")).collect();
    let insert = format!(
        "INSERT INTO {name} ({column_list}) VALUES ({})",
        placeholders.join(", ")
    );
    match live.execute(&insert, params_from_iter(values.iter())) {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(err, message))
            if err.code == ErrorCode::ConstraintViolation =>
        {
            return Ok(Attempt::Rejected(
                message.unwrap_or_else(|| "constraint violation".to_string()),
            ));
        }
        Err(e) => return Err(e.into()),
    }

    let blob = table
        .blob_column
        .as_deref()
        .and_then(value_of)
        .and_then(|v| match v {
            Value::Text(p) => safe_relative(Path::new(p)),
            _ => None,
        });
    Ok(Attempt::Imported(blob))
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(t) => format!("'{t}'"),
        Value::Blob(b) => format!("x'{}'", hex::encode(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archiver::BackupArchiver;
    use crate::schema::ManagedTable;
    use crate::store::Store;

    struct Fixture {
        _dir: tempfile::TempDir,
        config: VaultConfig,
        store: SharedStore,
        archiver: BackupArchiver,
        coordinator: RestoreCoordinator,
        leases: GenerationLeases,
    }

    fn registry() -> Arc<SchemaRegistry> {
        Arc::new(
            SchemaRegistry::new()
                .with_table(ManagedTable::new("subjects").with_label("name"))
                .with_table(
                    ManagedTable::new("folders")
                        .with_label("name")
                        .optionally_references("parent_id", "folders"),
                )
                .with_table(
                    ManagedTable::new("tests")
                        .with_label("title")
                        .with_blob("file_path")
                        .references("subject_id", "subjects")
                        .optionally_references("folder_id", "folders"),
                ),
        )
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = VaultConfig::new(dir.path());
        let store = Arc::new(Store::open(&config.store_path).unwrap());
        store
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TABLE subjects (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
                     CREATE TABLE folders (id INTEGER PRIMARY KEY, name TEXT NOT NULL,
                                           parent_id INTEGER REFERENCES folders(id));
                     CREATE TABLE tests (id INTEGER PRIMARY KEY, title TEXT NOT NULL,
                                         subject_id INTEGER NOT NULL REFERENCES subjects(id),
                                         folder_id INTEGER REFERENCES folders(id),
                                         file_path TEXT);
                     INSERT INTO subjects (id, name) VALUES (1, 'Math'), (2, 'Physics');
                     INSERT INTO folders (id, name, parent_id) VALUES (1, 'Root', NULL), (2, 'Term 1', 1), (3, 'Week 2', 2);
                     INSERT INTO tests (id, title, subject_id, folder_id, file_path) VALUES
                         (5, 'Fractions', 1, 3, 'math/fractions.pdf'),
                         (6, 'Optics', 2, 2, 'physics/optics.pdf');",
                )
            })
            .unwrap();
        fs::create_dir_all(config.uploads_dir.join("math")).unwrap();
        fs::create_dir_all(config.uploads_dir.join("physics")).unwrap();
        fs::write(config.uploads_dir.join("math/fractions.pdf"), b"fractions").unwrap();
        fs::write(config.uploads_dir.join("physics/optics.pdf"), b"optics").unwrap();

        let leases = GenerationLeases::new();
        let archiver = BackupArchiver::new(store.clone(), &config);
        let coordinator = RestoreCoordinator::new(store.clone(), registry(), &config, leases.clone());
        Fixture {
            _dir: dir,
            config,
            store,
            archiver,
            coordinator,
            leases,
        }
    }

    fn exec(store: &Store, sql: &str) {
        store.with_conn(|conn| conn.execute_batch(sql)).unwrap();
    }

    #[test]
    fn test_preview_flags_conflicts() {
        let f = fixture();
        let generation = f.archiver.create_backup().unwrap();
        exec(&f.store, "DELETE FROM tests WHERE id = 6;");

        let name = generation.name.clone();
        let candidates = f
            .coordinator
            .preview(&RestoreSource::Generation(generation.name))
            .unwrap();

        let tests: Vec<&CandidateRecord> = candidates.iter().filter(|c| c.table == "tests").collect();
        assert_eq!(tests.len(), 2);
        assert!(tests.iter().any(|c| c.id == 5 && c.conflict));
        assert!(tests
            .iter()
            .any(|c| c.id == 6 && !c.conflict && c.label.as_deref() == Some("Optics")));
        assert_eq!(candidates.iter().filter(|c| c.table == "folders").count(), 3);
        assert!(!f.leases.is_leased(&name));
    }

    #[test]
    fn test_restore_imports_missing_and_reports_conflicts() {
        let f = fixture();
        let generation = f.archiver.create_backup().unwrap();
        exec(&f.store, "DELETE FROM tests WHERE id = 6;");
        fs::remove_file(f.config.uploads_dir.join("physics/optics.pdf")).unwrap();

        let source = RestoreSource::Generation(generation.name);
        let result = f
            .coordinator
            .restore(&source, &[RecordRef::new("tests", 5), RecordRef::new("tests", 6)])
            .unwrap();

        assert_eq!(result.imported, vec![RecordRef::new("tests", 6)]);
        assert_eq!(result.conflicts, vec![RecordRef::new("tests", 5)]);
        assert!(result.rejected.is_empty());
        assert_eq!(result.blobs, vec!["physics/optics.pdf".to_string()]);
        assert_eq!(
            fs::read(f.config.uploads_dir.join("physics/optics.pdf")).unwrap(),
            b"optics"
        );
    }

    #[test]
    fn test_blob_failure_leaves_records_unchanged() {
        let f = fixture();
        let generation = f.archiver.create_backup().unwrap();
        exec(&f.store, "DELETE FROM tests WHERE id = 6;");
        let physics = f.config.uploads_dir.join("physics");
        fs::remove_dir_all(&physics).unwrap();
        fs::write(&physics, b"not a directory").unwrap();

        let source = RestoreSource::Generation(generation.name);
        let selection = [RecordRef::new("tests", 6)];
        let err = f.coordinator.restore(&source, &selection).unwrap_err();
        assert!(matches!(err, BackupError::Io(_)));

        let live: i64 = f
            .store
            .with_conn(|c| c.query_row("SELECT COUNT(*) FROM tests WHERE id = 6", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(live, 0);
        assert_eq!(fs::read_dir(f.config.staging_dir()).unwrap().count(), 0);

        fs::remove_file(&physics).unwrap();
        let result = f.coordinator.restore(&source, &selection).unwrap();
        assert_eq!(result.imported, vec![RecordRef::new("tests", 6)]);
        assert_eq!(result.blobs, vec!["physics/optics.pdf".to_string()]);
        assert!(result.blob_failures.is_empty());
        assert_eq!(fs::read(physics.join("optics.pdf")).unwrap(), b"optics");
    }

    #[test]
    fn test_restore_imports_parents_first() {
        let f = fixture();
        let generation = f.archiver.create_backup().unwrap();
        exec(
            &f.store,
            "DELETE FROM tests WHERE id = 5; DELETE FROM folders WHERE id = 3;",
        );

        let result = f
            .coordinator
            .restore(
                &RestoreSource::Generation(generation.name),
                &[RecordRef::new("tests", 5), RecordRef::new("folders", 3)],
            )
            .unwrap();

        assert_eq!(
            result.imported,
            vec![RecordRef::new("folders", 3), RecordRef::new("tests", 5)]
        );
        assert_eq!(f.store.row_count("folders").unwrap(), 3);
    }

    #[test]
    fn test_restore_rejects_missing_parent() {
        let f = fixture();
        let generation = f.archiver.create_backup().unwrap();
        exec(
            &f.store,
            "DELETE FROM tests WHERE id = 5; DELETE FROM folders WHERE id = 3;",
        );

        let result = f
            .coordinator
            .restore(
                &RestoreSource::Generation(generation.name),
                &[RecordRef::new("tests", 5)],
            )
            .unwrap();

        assert!(result.imported.is_empty());
        assert_eq!(result.rejected.len(), 1);
        assert!(result.rejected[0].reason.contains("folders.id = 3"));
        assert_eq!(f.store.row_count("tests").unwrap(), 1);
    }

    #[test]
    fn test_self_referencing_chain() {
        let f = fixture();
        let generation = f.archiver.create_backup().unwrap();
        exec(
            &f.store,
            "UPDATE tests SET folder_id = 1; DELETE FROM folders WHERE id IN (2, 3);",
        );

        let result = f
            .coordinator
            .restore(
                &RestoreSource::Generation(generation.name),
                &[RecordRef::new("folders", 3), RecordRef::new("folders", 2)],
            )
            .unwrap();

        assert_eq!(
            result.imported,
            vec![RecordRef::new("folders", 2), RecordRef::new("folders", 3)]
        );
    }

    #[test]
    fn test_empty_selection_rejected() {
        let f = fixture();
        let generation = f.archiver.create_backup().unwrap();
        let source = RestoreSource::Generation(generation.name);
        assert!(matches!(
            f.coordinator.restore(&source, &[]),
            Err(BackupError::Validation(_))
        ));
        assert!(matches!(
            f.coordinator.restore(&source, &[RecordRef::new("users", 1)]),
            Err(BackupError::Validation(_))
        ));
    }

    #[test]
    fn test_staged_upload_round_trip() {
        let f = fixture();
        let generation = f.archiver.create_backup().unwrap();
        let bytes = fs::read(f.config.backups_dir.join(&generation.name)).unwrap();
        exec(&f.store, "DELETE FROM tests WHERE id = 6;");

        let staged = f.coordinator.stage_upload(bytes.as_slice()).unwrap();
        let source = RestoreSource::Upload(staged.upload_id.clone());
        assert!(!f.coordinator.preview(&source).unwrap().is_empty());

        let result = f
            .coordinator
            .restore(&source, &[RecordRef::new("tests", 6)])
            .unwrap();
        assert_eq!(result.imported.len(), 1);
        assert!(matches!(
            f.coordinator.preview(&source),
            Err(BackupError::NotFound(_))
        ));
    }

    #[test]
    fn test_upload_without_store_is_discarded_after_preview() {
        let f = fixture();
        let manifest = serde_json::to_vec(&crate::backup::Manifest {
            format_version: crate::backup::FORMAT_VERSION,
            created_at: "2026-05-01T02:00:00.000Z".into(),
            store_file: "testvault.db".into(),
            store_bytes: 0,
            store_sha256: String::new(),
            schema_versions: Vec::new(),
            blob_files: 0,
            blob_bytes: 0,
            sources: Vec::new(),
        })
        .unwrap();

        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(manifest.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "manifest.json", manifest.as_slice())
            .unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let err = f.coordinator.stage_and_preview(bytes.as_slice()).unwrap_err();
        assert!(matches!(err, BackupError::Archive(_)));
        assert_eq!(fs::read_dir(f.config.staging_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_garbage_upload_is_refused() {
        let f = fixture();
        let err = f.coordinator.stage_upload(&b"not an archive"[..]).unwrap_err();
        assert!(matches!(err, BackupError::Archive(_)));
        assert_eq!(fs::read_dir(f.config.staging_dir()).unwrap().count(), 0);
        assert!(matches!(
            f.coordinator
                .preview(&RestoreSource::Upload("not-a-uuid".into())),
            Err(BackupError::Validation(_))
        ));
    }
}
