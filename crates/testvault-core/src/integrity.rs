//! Read-only integrity audits of the managed store.
//!
//! Violations are data, not errors: an audit only fails with `Err` when the
//! store itself cannot be read.

use std::fmt;

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::error::Error;
use crate::schema::{IndexSpec, ManagedTable, ReferenceEdge, SchemaRegistry, TableShape, TableSpec};
use crate::store::{quote_ident, table_exists, Store};

/// Prefix reserved for transient shadow tables.
pub const SHADOW_PREFIX: &str = "__shadow_";

/// Maximum number of row-level violations reported per individual check.
pub const MAX_REPORTED_PER_CHECK: usize = 100;

/// Category of an integrity violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// A non-null reference that does not resolve.
    Orphan,
    /// A null value in a required reference.
    NullRequiredReference,
    /// Rows that would violate a uniqueness constraint not yet enforced.
    Duplicate,
    /// A definition that still names a table that should no longer exist.
    LegacyReference,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationKind::Orphan => write!(f, "orphan"),
            ViolationKind::NullRequiredReference => write!(f, "null_required_reference"),
            ViolationKind::Duplicate => write!(f, "duplicate"),
            ViolationKind::LegacyReference => write!(f, "legacy_reference"),
        }
    }
}

/// One integrity violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Category.
    pub kind: ViolationKind,
    /// Table the violation was found in.
    pub table: String,
    /// Offending column, when the check is column-scoped.
    pub column: Option<String>,
    /// Offending row identity, when the check is row-scoped.
    pub row_id: Option<i64>,
    /// Human-readable description.
    pub detail: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}", self.kind, self.table)?;
        if let Some(column) = &self.column {
            write!(f, ".{column}")?;
        }
        if let Some(id) = self.row_id {
            write!(f, " (row {id})")?;
        }
        write!(f, ": {}", self.detail)
    }
}

/// Result of an audit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    /// True when no violations were found.
    pub passed: bool,
    /// Violations found.
    pub violations: Vec<Violation>,
    /// True when at least one check hit [`MAX_REPORTED_PER_CHECK`].
    pub truncated: bool,
}

impl AuditReport {
    fn from_violations(violations: Vec<Violation>, truncated: bool) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
            truncated,
        }
    }

    /// Merge another report into this one.
    pub fn merge(&mut self, other: AuditReport) {
        self.violations.extend(other.violations);
        self.truncated |= other.truncated;
        self.passed = self.violations.is_empty();
    }

    /// Violations on `table` whose kind is not tolerated.
    pub fn blocking_for<'a>(
        &'a self,
        table: &'a str,
        tolerated: &'a [ViolationKind],
    ) -> impl Iterator<Item = &'a Violation> + 'a {
        self.violations
            .iter()
            .filter(move |v| v.table == table && !tolerated.contains(&v.kind))
    }

    /// Number of violations of `kind`.
    pub fn count(&self, kind: ViolationKind) -> usize {
        self.violations.iter().filter(|v| v.kind == kind).count()
    }
}

/// Inspects the managed store for integrity violations.
#[derive(Debug, Clone, Copy)]
pub struct IntegrityAuditor<'a> {
    registry: &'a SchemaRegistry,
}

impl<'a> IntegrityAuditor<'a> {
    /// Create an auditor over `registry`.
    pub fn new(registry: &'a SchemaRegistry) -> Self {
        Self { registry }
    }

    /// Audit the store.
    pub fn audit_store(&self, store: &Store) -> Result<AuditReport, Error> {
        store.with_conn(|conn| self.audit(conn))
    }

    /// Run every registry-wide check.
    #[instrument(skip_all)]
    pub fn audit(&self, conn: &Connection) -> Result<AuditReport, Error> {
        let mut violations = Vec::new();
        let mut truncated = false;

        for table in self.registry.tables() {
            let Some(shape) = TableShape::load(conn, &table.name)? else {
                continue;
            };
            for edge in &table.edges {
                if !shape.has_column(&edge.column) {
                    continue;
                }
                truncated |= self.check_orphans(conn, table, edge, &mut violations)?;
                if edge.required {
                    truncated |= self.check_null_required(conn, table, edge, &mut violations)?;
                }
            }
        }

        self.check_legacy_references(conn, &mut violations)?;

        debug!(violations = violations.len(), "integrity audit finished");
        Ok(AuditReport::from_violations(violations, truncated))
    }

    /// Find rows that would violate unique indexes declared in `spec` but not
    /// yet present on `table`.
    pub fn audit_pending_uniques(
        &self,
        conn: &Connection,
        table: &str,
        spec: &TableSpec,
    ) -> Result<AuditReport, Error> {
        let Some(shape) = TableShape::load(conn, table)? else {
            return Ok(AuditReport::from_violations(Vec::new(), false));
        };

        let mut violations = Vec::new();
        let mut truncated = false;
        for index in spec.indexes.iter().filter(|i| i.unique) {
            if shape.has_index(&index.name) {
                continue;
            }
            if !index.columns.iter().all(|c| shape.has_column(c)) {
                continue;
            }
            truncated |= check_duplicates(conn, table, index, &mut violations)?;
        }

        Ok(AuditReport::from_violations(violations, truncated))
    }

    fn check_orphans(
        &self,
        conn: &Connection,
        table: &ManagedTable,
        edge: &ReferenceEdge,
        out: &mut Vec<Violation>,
    ) -> Result<bool, Error> {
        if !table_exists(conn, &edge.parent)? {
            // The parent table itself is gone; surfaced by the legacy check.
            return Ok(false);
        }

        let sql = format!(
            "SELECT c.{id}, c.{col} FROM {child} c \
             WHERE c.{col} IS NOT NULL \
             AND NOT EXISTS (SELECT 1 FROM {parent} p WHERE p.{pcol} = c.{col}) \
             ORDER BY c.{id} LIMIT {limit}",
            id = quote_ident(&table.identity),
            col = quote_ident(&edge.column),
            child = quote_ident(&table.name),
            parent = quote_ident(&edge.parent),
            pcol = quote_ident(&edge.parent_column),
            limit = MAX_REPORTED_PER_CHECK + 1,
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, value_text(row.get_ref(1)?))))?
            .collect::<Result<Vec<_>, _>>()?;

        let truncated = rows.len() > MAX_REPORTED_PER_CHECK;
        for (id, value) in rows.into_iter().take(MAX_REPORTED_PER_CHECK) {
            out.push(Violation {
                kind: ViolationKind::Orphan,
                table: table.name.clone(),
                column: Some(edge.column.clone()),
                row_id: Some(id),
                detail: format!(
                    "references {}.{} = {} which does not exist",
                    edge.parent, edge.parent_column, value
                ),
            });
        }
        Ok(truncated)
    }

    fn check_null_required(
        &self,
        conn: &Connection,
        table: &ManagedTable,
        edge: &ReferenceEdge,
        out: &mut Vec<Violation>,
    ) -> Result<bool, Error> {
        let sql = format!(
            "SELECT {id} FROM {child} WHERE {col} IS NULL ORDER BY {id} LIMIT {limit}",
            id = quote_ident(&table.identity),
            child = quote_ident(&table.name),
            col = quote_ident(&edge.column),
            limit = MAX_REPORTED_PER_CHECK + 1,
        );
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let truncated = ids.len() > MAX_REPORTED_PER_CHECK;
        for id in ids.into_iter().take(MAX_REPORTED_PER_CHECK) {
            out.push(Violation {
                kind: ViolationKind::NullRequiredReference,
                table: table.name.clone(),
                column: Some(edge.column.clone()),
                row_id: Some(id),
                detail: format!("required reference to {} is null", edge.parent),
            });
        }
        Ok(truncated)
    }

    fn check_legacy_references(
        &self,
        conn: &Connection,
        out: &mut Vec<Violation>,
    ) -> Result<(), Error> {
        let mut stmt = conn.prepare(
            "SELECT type, name, tbl_name, COALESCE(sql, '') FROM sqlite_master \
             WHERE name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let objects = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let is_retired = |name: &str| {
            name.starts_with(SHADOW_PREFIX)
                || self
                    .registry
                    .retired()
                    .iter()
                    .any(|r| r.eq_ignore_ascii_case(name))
        };

        for (kind, name, owner, sql) in &objects {
            match kind.as_str() {
                "table" => {
                    if is_retired(name) {
                        out.push(Violation {
                            kind: ViolationKind::LegacyReference,
                            table: name.clone(),
                            column: None,
                            row_id: None,
                            detail: "table should no longer exist".to_string(),
                        });
                    }

                    let Some(shape) = TableShape::load(conn, name)? else {
                        continue;
                    };
                    for fk in &shape.foreign_keys {
                        let parent_missing = !table_exists(conn, &fk.parent_table)?;
                        if parent_missing || is_retired(&fk.parent_table) {
                            out.push(Violation {
                                kind: ViolationKind::LegacyReference,
                                table: name.clone(),
                                column: Some(fk.column.clone()),
                                row_id: None,
                                detail: format!(
                                    "foreign key references {}{}",
                                    fk.parent_table,
                                    if parent_missing { " which does not exist" } else { "" }
                                ),
                            });
                        }
                    }
                }
                "view" | "trigger" => {
                    let stale: Vec<String> = identifiers(sql)
                        .into_iter()
                        .filter(|ident| is_retired(ident))
                        .collect();
                    for ident in stale {
                        out.push(Violation {
                            kind: ViolationKind::LegacyReference,
                            table: owner.clone(),
                            column: None,
                            row_id: None,
                            detail: format!("{kind} {name} references {ident}"),
                        });
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }
}

fn check_duplicates(
    conn: &Connection,
    table: &str,
    index: &IndexSpec,
    out: &mut Vec<Violation>,
) -> Result<bool, Error> {
    let cols: Vec<String> = index.columns.iter().map(|c| quote_ident(c)).collect();
    let not_null: Vec<String> = cols.iter().map(|c| format!("{c} IS NOT NULL")).collect();
    let sql = format!(
        "SELECT {cols}, COUNT(*) FROM {table} WHERE {filter} GROUP BY {cols} \
         HAVING COUNT(*) > 1 LIMIT {limit}",
        cols = cols.join(", "),
        table = quote_ident(table),
        filter = not_null.join(" AND "),
        limit = MAX_REPORTED_PER_CHECK + 1,
    );

    let width = index.columns.len();
    let mut stmt = conn.prepare(&sql)?;
    let groups = stmt
        .query_map([], |row| {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(value_text(row.get_ref(i)?));
            }
            Ok((values, row.get::<_, i64>(width)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let truncated = groups.len() > MAX_REPORTED_PER_CHECK;
    for (values, count) in groups.into_iter().take(MAX_REPORTED_PER_CHECK) {
        out.push(Violation {
            kind: ViolationKind::Duplicate,
            table: table.to_string(),
            column: Some(index.columns.join(",")),
            row_id: None,
            detail: format!(
                "{count} rows share ({}) which {} requires to be unique",
                values.join(", "),
                index.name
            ),
        });
    }
    Ok(truncated)
}

fn value_text(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => format!("'{}'", String::from_utf8_lossy(t)),
        ValueRef::Blob(b) => format!("x'{}'", hex::encode(b)),
    }
}

/// Bare identifiers appearing in a SQL definition, unquoted.
fn identifiers(sql: &str) -> Vec<String> {
    sql.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}
