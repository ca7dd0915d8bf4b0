//! The `schema_version` ledger.
//!
//! One row per applied step. Rows are written inside the swap transaction of
//! the step they record, so a rolled-back step never leaves an entry.

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::store::table_exists;

/// Ledger table name.
pub const LEDGER_TABLE: &str = "schema_version";

/// One applied step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Step name.
    pub step: String,
    /// Target table.
    pub target: String,
    /// RFC 3339 timestamp.
    pub applied_at: String,
    /// Rows before the step.
    pub rows_before: u64,
    /// Rows after the step.
    pub rows_after: u64,
}

impl LedgerEntry {
    /// Entry stamped with the current time.
    pub fn now(step: &str, target: &str, rows_before: u64, rows_after: u64) -> Self {
        Self {
            step: step.to_string(),
            target: target.to_string(),
            applied_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            rows_before,
            rows_after,
        }
    }
}

/// Create the ledger table if missing.
pub fn ensure(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            step TEXT PRIMARY KEY,
            target TEXT NOT NULL,
            applied_at TEXT NOT NULL,
            rows_before INTEGER NOT NULL,
            rows_after INTEGER NOT NULL
        )",
    )?;
    Ok(())
}

/// Record (or overwrite) an entry.
pub fn record(conn: &Connection, entry: &LedgerEntry) -> Result<(), Error> {
    ensure(conn)?;
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (step, target, applied_at, rows_before, rows_after)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.step,
            entry.target,
            entry.applied_at,
            entry.rows_before as i64,
            entry.rows_after as i64
        ],
    )?;
    Ok(())
}

/// Look up the entry for `step`.
pub fn lookup(conn: &Connection, step: &str) -> Result<Option<LedgerEntry>, Error> {
    if !table_exists(conn, LEDGER_TABLE)? {
        return Ok(None);
    }
    let entry = conn
        .query_row(
            "SELECT step, target, applied_at, rows_before, rows_after
             FROM schema_version WHERE step = ?1",
            [step],
            row_to_entry,
        )
        .optional()?;
    Ok(entry)
}

/// Record `step` as applied if the ledger has no row for it yet.
///
/// Returns true when a row was inserted.
pub fn adopt(conn: &Connection, step: &str, target: &str, rows: u64) -> Result<bool, Error> {
    if lookup(conn, step)?.is_some() {
        return Ok(false);
    }
    record(conn, &LedgerEntry::now(step, target, rows, rows))?;
    Ok(true)
}

/// All entries, oldest first.
pub fn entries(conn: &Connection) -> Result<Vec<LedgerEntry>, Error> {
    if !table_exists(conn, LEDGER_TABLE)? {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT step, target, applied_at, rows_before, rows_after
         FROM schema_version ORDER BY applied_at, step",
    )?;
    let entries = stmt
        .query_map([], row_to_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    Ok(LedgerEntry {
        step: row.get(0)?,
        target: row.get(1)?,
        applied_at: row.get(2)?,
        rows_before: row.get::<_, i64>(3)? as u64,
        rows_after: row.get::<_, i64>(4)? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_ledger() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(entries(&conn).unwrap().is_empty());
        assert!(lookup(&conn, "x").unwrap().is_none());
    }

    #[test]
    fn test_record_and_adopt() {
        let conn = Connection::open_in_memory().unwrap();
        record(&conn, &LedgerEntry::now("tests_status", "tests", 10, 10)).unwrap();

        let entry = lookup(&conn, "tests_status").unwrap().unwrap();
        assert_eq!(entry.target, "tests");
        assert_eq!(entry.rows_after, 10);

        assert!(!adopt(&conn, "tests_status", "tests", 99).unwrap());
        assert!(adopt(&conn, "tags_unique", "tags", 3).unwrap());
        assert_eq!(entries(&conn).unwrap().len(), 2);
        assert_eq!(lookup(&conn, "tests_status").unwrap().unwrap().rows_before, 10);
    }
}
