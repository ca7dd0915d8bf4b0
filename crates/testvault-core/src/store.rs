//! Managed store handle and the maintenance lock.
//!
//! The store is a single embedded SQLite file shared by the external CRUD
//! layer and the maintenance engine. Ordinary row access goes through
//! [`Store::with_conn`]; structural work (table swaps, snapshots, restores)
//! additionally holds the [`MaintenanceLock`] for its critical section.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::error::Error;

/// Exclusive lock serializing migrations, snapshot reads and restores.
#[derive(Debug, Default)]
pub struct MaintenanceLock {
    inner: Mutex<()>,
}

impl MaintenanceLock {
    /// Create a new, unheld lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock is free and take it.
    pub fn acquire(&self, purpose: &'static str) -> MaintenanceGuard<'_> {
        let waited = Instant::now();
        let guard = self.inner.lock();
        debug!(
            purpose,
            waited_ms = waited.elapsed().as_millis() as u64,
            "maintenance lock acquired"
        );
        MaintenanceGuard {
            _guard: guard,
            purpose,
            held_since: Instant::now(),
        }
    }

    /// Take the lock only if nobody holds it.
    pub fn try_acquire(&self, purpose: &'static str) -> Option<MaintenanceGuard<'_>> {
        self.inner.try_lock().map(|guard| {
            debug!(purpose, "maintenance lock acquired");
            MaintenanceGuard {
                _guard: guard,
                purpose,
                held_since: Instant::now(),
            }
        })
    }

    /// Whether some maintenance operation currently holds the lock.
    pub fn is_held(&self) -> bool {
        self.inner.is_locked()
    }
}

/// RAII guard for the maintenance lock.
pub struct MaintenanceGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    purpose: &'static str,
    held_since: Instant,
}

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        debug!(
            purpose = self.purpose,
            held_ms = self.held_since.elapsed().as_millis() as u64,
            "maintenance lock released"
        );
    }
}

/// Handle to the managed store.
pub struct Store {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
    maintenance: MaintenanceLock,
}

impl Store {
    /// Open (or create) the store file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::configure(&conn)?;

        Ok(Self {
            path: Some(path.to_path_buf()),
            conn: Mutex::new(conn),
            maintenance: MaintenanceLock::new(),
        })
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;

        Ok(Self {
            path: None,
            conn: Mutex::new(conn),
            maintenance: MaintenanceLock::new(),
        })
    }

    fn configure(conn: &Connection) -> Result<(), Error> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(())
    }

    /// Path of the backing file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The process-wide maintenance lock.
    pub fn maintenance(&self) -> &MaintenanceLock {
        &self.maintenance
    }

    /// Run `f` with shared access to the connection.
    pub fn with_conn<T, E>(&self, f: impl FnOnce(&Connection) -> Result<T, E>) -> Result<T, E> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` with exclusive access to the connection (for transactions).
    pub fn with_conn_mut<T, E>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }

    /// Number of rows in `table`.
    pub fn row_count(&self, table: &str) -> Result<u64, Error> {
        self.with_conn(|conn| row_count(conn, table))
    }

    /// Whether `table` exists.
    pub fn table_exists(&self, table: &str) -> Result<bool, Error> {
        self.with_conn(|conn| table_exists(conn, table))
    }
}

/// Thread-safe store handle.
pub type SharedStore = Arc<Store>;

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Number of rows in `table`.
pub fn row_count(conn: &Connection, table: &str) -> Result<u64, Error> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
        [],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Whether a table named `table` exists.
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool, Error> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Names of all user tables, sorted.
pub fn table_names(conn: &Connection) -> Result<Vec<String>, Error> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}
