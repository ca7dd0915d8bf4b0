//! Single-step table swap with verified copy and rollback.
//!
//! A step runs as:
//!
//! 1. Introspect; a matching shape returns `AlreadyApplied`.
//! 2. Suspend FK enforcement (outside the transaction) and open an exclusive
//!    transaction.
//! 3. Rename the live table to its shadow name.
//! 4. Create the desired table under the original name.
//! 5. Copy rows in rowid-ordered batches through the explicit column list.
//! 6. Compare row counts; a mismatch rolls back.
//! 7. Drop the shadow, create indexes, run `foreign_key_check`, record the
//!    ledger entry and commit.
//!
//! Any failure in 3-7 drops the transaction, which restores the original table.

use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::error::{MigrationError, RollbackCause};
use super::ledger::{self, LedgerEntry};
use super::step::MigrationStep;
use crate::config::DEFAULT_COPY_BATCH_SIZE;
use crate::error::Error;
use crate::integrity::SHADOW_PREFIX;
use crate::schema::TableShape;
use crate::store::{quote_ident, row_count, table_exists, Store};

/// Outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    /// The table already had the desired shape; nothing changed.
    AlreadyApplied,
    /// The swap committed.
    Applied,
    /// The swap transaction was rolled back; the table is unchanged.
    RolledBack,
}

/// Result of [`MigrationEngine::apply_step`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    /// Step name.
    pub step: String,
    /// Outcome.
    pub status: StepStatus,
    /// Rows before the step.
    pub rows_before: u64,
    /// Rows in the new table (equal to `rows_before` unless rolled back).
    pub rows_after: u64,
    /// Why the step was rolled back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<RollbackCause>,
}

impl StepResult {
    fn already_applied(step: &MigrationStep, rows: u64) -> Self {
        Self {
            step: step.name.clone(),
            status: StepStatus::AlreadyApplied,
            rows_before: rows,
            rows_after: rows,
            cause: None,
        }
    }

    /// Whether the step left the table in the desired shape.
    pub fn is_success(&self) -> bool {
        self.status != StepStatus::RolledBack
    }
}

/// Hook invoked after each copy batch, inside the swap transaction.
///
/// Returning an error aborts and rolls back the step.
pub trait CopyObserver: Send + Sync {
    /// Called with the running total of copied rows.
    fn after_batch(&self, conn: &Connection, copied: u64) -> Result<(), Error>;
}

impl<F> CopyObserver for F
where
    F: Fn(&Connection, u64) -> Result<(), Error> + Send + Sync,
{
    fn after_batch(&self, conn: &Connection, copied: u64) -> Result<(), Error> {
        self(conn, copied)
    }
}

/// Shadow name used while `table` is being swapped.
pub fn shadow_name(table: &str) -> String {
    format!("{SHADOW_PREFIX}{table}")
}

/// Applies one [`MigrationStep`] to the store.
pub struct MigrationEngine<'a> {
    store: &'a Store,
    batch_size: usize,
    observer: Option<&'a dyn CopyObserver>,
}

impl<'a> MigrationEngine<'a> {
    /// Create an engine with the default batch size.
    pub fn new(store: &'a Store) -> Self {
        Self {
            store,
            batch_size: DEFAULT_COPY_BATCH_SIZE,
            observer: None,
        }
    }

    /// Set the number of rows copied per batch.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Install a copy observer.
    pub fn with_observer(mut self, observer: &'a dyn CopyObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Whether the target table already has the desired shape.
    pub fn is_applied(&self, step: &MigrationStep) -> Result<bool, MigrationError> {
        let shape = self.store.with_conn(|conn| TableShape::load(conn, &step.table))?;
        Ok(shape.is_some_and(|s| s.matches(&step.desired)))
    }

    /// Apply `step`.
    ///
    /// `Err` means the step was refused before any DDL ran. Failures during
    /// the swap are reported as [`StepStatus::RolledBack`].
    #[instrument(skip(self, step), fields(step = %step.name, table = %step.table))]
    pub fn apply_step(&self, step: &MigrationStep) -> Result<StepResult, MigrationError> {
        step.validate()?;

        let _guard = self.store.maintenance().acquire("migration");
        self.store.with_conn_mut(|conn| self.apply_locked(conn, step))
    }

    fn apply_locked(
        &self,
        conn: &mut Connection,
        step: &MigrationStep,
    ) -> Result<StepResult, MigrationError> {
        let shape = TableShape::load(conn, &step.table)?
            .ok_or_else(|| MigrationError::TableNotFound(step.table.clone()))?;
        let rows_before = row_count(conn, &step.table)?;

        let differences = shape.diff(&step.desired);
        if differences.is_empty() {
            let adopted = ledger::adopt(conn, &step.name, &step.table, rows_before)?;
            info!(rows = rows_before, adopted, "step already applied");
            return Ok(StepResult::already_applied(step, rows_before));
        }

        if !step.legacy.matches(&shape) {
            return Err(MigrationError::UnknownShape {
                step: step.name.clone(),
                table: step.table.clone(),
                differences: differences.iter().map(ToString::to_string).collect(),
            });
        }
        step.validate_against(&shape)?;

        let shadow = shadow_name(&step.table);
        if table_exists(conn, &shadow)? {
            return Err(MigrationError::Validation(format!(
                "{}: leftover shadow table {shadow} must be removed first",
                step.name
            )));
        }

        debug!(differences = differences.len(), "swapping table");

        let fk_enabled: bool = conn.pragma_query_value(None, "foreign_keys", |row| row.get(0))?;
        conn.pragma_update(None, "foreign_keys", false)?;
        let swapped = conn
            .pragma_update(None, "legacy_alter_table", true)
            .map_err(MigrationError::from)
            .and_then(|()| self.swap(conn, step, &shadow, rows_before));
        let restored = restore_pragmas(conn, fk_enabled);

        let result = swapped?;
        restored?;
        Ok(result)
    }

    fn swap(
        &self,
        conn: &mut Connection,
        step: &MigrationStep,
        shadow: &str,
        rows_before: u64,
    ) -> Result<StepResult, MigrationError> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;

        let outcome = self.swap_in(&tx, step, shadow, rows_before);
        let outcome = match outcome {
            Ok(rows_after) => tx.commit().map(|()| rows_after).map_err(RollbackCause::from),
            Err(cause) => {
                tx.rollback()?;
                Err(cause)
            }
        };

        match outcome {
            Ok(rows_after) => {
                info!(rows_before, rows_after, "step applied");
                Ok(StepResult {
                    step: step.name.clone(),
                    status: StepStatus::Applied,
                    rows_before,
                    rows_after,
                    cause: None,
                })
            }
            Err(cause) => {
                warn!(%cause, "step rolled back");
                let rows_after = match &cause {
                    RollbackCause::RowCountMismatch { actual, .. } => *actual,
                    _ => rows_before,
                };
                Ok(StepResult {
                    step: step.name.clone(),
                    status: StepStatus::RolledBack,
                    rows_before,
                    rows_after,
                    cause: Some(cause),
                })
            }
        }
    }

    fn swap_in(
        &self,
        tx: &Transaction<'_>,
        step: &MigrationStep,
        shadow: &str,
        rows_before: u64,
    ) -> Result<u64, RollbackCause> {
        let table = quote_ident(&step.table);
        let shadow_q = quote_ident(shadow);

        tx.execute_batch(&format!("ALTER TABLE {table} RENAME TO {shadow_q}"))?;
        tx.execute_batch(&step.desired.create_sql(&step.table))?;

        let (targets, sources) = step.copy_lists();
        let copy_sql = format!(
            "INSERT INTO {table} ({targets}) SELECT {sources} FROM {shadow_q} \
             ORDER BY rowid LIMIT ?1 OFFSET ?2"
        );
        let mut stmt = tx.prepare(&copy_sql)?;
        let batch = self.batch_size as u64;
        let mut copied = 0u64;
        loop {
            let n = stmt.execute(params![batch as i64, copied as i64])? as u64;
            copied += n;
            if n > 0 {
                debug!(copied, "copied batch");
                if let Some(observer) = self.observer {
                    observer.after_batch(tx, copied)?;
                }
            }
            if n < batch {
                break;
            }
        }
        drop(stmt);

        let expected = row_count(tx, shadow)?;
        let actual = row_count(tx, &step.table)?;
        if expected != actual || expected != rows_before {
            return Err(RollbackCause::RowCountMismatch { expected, actual });
        }

        tx.execute_batch(&format!("DROP TABLE {shadow_q}"))?;
        for index in &step.desired.indexes {
            tx.execute_batch(&index.create_sql(&step.table))?;
        }

        let violations = foreign_key_violations(tx, &step.table)?;
        if violations > 0 {
            return Err(RollbackCause::ForeignKeyCheck { violations });
        }

        ledger::record(tx, &LedgerEntry::now(&step.name, &step.table, rows_before, actual))?;
        Ok(actual)
    }
}

fn foreign_key_violations(conn: &Connection, table: &str) -> Result<u64, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_check({})", quote_ident(table)))?;
    let mut rows = stmt.query([])?;
    let mut count = 0u64;
    while rows.next()?.is_some() {
        count += 1;
    }
    Ok(count)
}

fn restore_pragmas(conn: &Connection, fk_enabled: bool) -> Result<(), MigrationError> {
    conn.pragma_update(None, "legacy_alter_table", false)?;
    conn.pragma_update(None, "foreign_keys", fk_enabled)?;
    Ok(())
}
