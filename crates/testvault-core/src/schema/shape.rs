//! Structured introspection of live tables.
//!
//! A [`TableShape`] is read once from SQLite's catalog pragmas and compared
//! field by field against a declared [`TableSpec`]. Nothing here inspects the
//! stored `CREATE TABLE` text.

use std::fmt;

use rusqlite::Connection;
use serde::Serialize;

use super::spec::{OnDelete, TableSpec};
use crate::error::Error;
use crate::store::{quote_ident, table_exists};

/// A column as reported by `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Declared type, as written.
    pub sql_type: String,
    /// NOT NULL constraint.
    pub not_null: bool,
    /// Default expression text.
    pub default: Option<String>,
    /// 1-based position within the primary key, 0 when not part of it.
    pub pk_position: u32,
}

/// A foreign-key edge as reported by `PRAGMA foreign_key_list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyInfo {
    /// Referencing column.
    pub column: String,
    /// Referenced table.
    pub parent_table: String,
    /// Referenced column; `None` when the edge targets the parent's primary key implicitly.
    pub parent_column: Option<String>,
    /// Delete action.
    pub on_delete: OnDelete,
}

/// An explicitly created index as reported by `PRAGMA index_list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexInfo {
    /// Index name.
    pub name: String,
    /// Indexed columns.
    pub columns: Vec<String>,
    /// UNIQUE index.
    pub unique: bool,
}

/// Actual shape of a live table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableShape {
    /// Table name.
    pub name: String,
    /// Columns in physical order.
    pub columns: Vec<ColumnInfo>,
    /// Foreign-key edges.
    pub foreign_keys: Vec<ForeignKeyInfo>,
    /// Indexes created with `CREATE INDEX` (automatic indexes excluded).
    pub indexes: Vec<IndexInfo>,
}

impl TableShape {
    /// Introspect `table`; `None` when it does not exist.
    pub fn load(conn: &Connection, table: &str) -> Result<Option<Self>, Error> {
        if !table_exists(conn, table)? {
            return Ok(None);
        }

        let quoted = quote_ident(table);

        let mut stmt = conn.prepare(&format!("PRAGMA table_info({quoted})"))?;
        let columns = stmt
            .query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get(1)?,
                    sql_type: row.get(2)?,
                    not_null: row.get::<_, i64>(3)? != 0,
                    default: row.get(4)?,
                    pk_position: row.get::<_, i64>(5)? as u32,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_list({quoted})"))?;
        let foreign_keys = stmt
            .query_map([], |row| {
                let on_delete: String = row.get(6)?;
                Ok(ForeignKeyInfo {
                    parent_table: row.get(2)?,
                    column: row.get(3)?,
                    parent_column: row.get(4)?,
                    on_delete: OnDelete::from_pragma(&on_delete),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(&format!("PRAGMA index_list({quoted})"))?;
        let listed = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)? != 0,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut indexes = Vec::new();
        for (name, unique, origin) in listed {
            if origin != "c" {
                continue;
            }
            let mut info = conn.prepare(&format!("PRAGMA index_info({})", quote_ident(&name)))?;
            let mut cols = info
                .query_map([], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            cols.sort_by_key(|(seq, _)| *seq);
            indexes.push(IndexInfo {
                name,
                columns: cols.into_iter().filter_map(|(_, c)| c).collect(),
                unique,
            });
        }
        indexes.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Some(Self {
            name: table.to_string(),
            columns,
            foreign_keys,
            indexes,
        }))
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Whether a column exists.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Foreign-key edge on `column`, if any.
    pub fn foreign_key(&self, column: &str) -> Option<&ForeignKeyInfo> {
        self.foreign_keys.iter().find(|fk| fk.column == column)
    }

    /// Whether an explicitly created index named `name` exists.
    pub fn has_index(&self, name: &str) -> bool {
        self.indexes.iter().any(|i| i.name == name)
    }

    /// Primary-key columns ordered by key position.
    pub fn primary_key(&self) -> Vec<&str> {
        let mut pk: Vec<&ColumnInfo> = self.columns.iter().filter(|c| c.pk_position > 0).collect();
        pk.sort_by_key(|c| c.pk_position);
        pk.into_iter().map(|c| c.name.as_str()).collect()
    }

    /// Every way this shape deviates from `spec`. Empty means the table matches.
    pub fn diff(&self, spec: &TableSpec) -> Vec<ShapeDifference> {
        let mut out = Vec::new();

        for want in &spec.columns {
            let Some(have) = self.column(&want.name) else {
                out.push(ShapeDifference::MissingColumn(want.name.clone()));
                continue;
            };
            if !have.sql_type.eq_ignore_ascii_case(&want.sql_type) {
                out.push(ShapeDifference::ColumnType {
                    column: want.name.clone(),
                    expected: want.sql_type.clone(),
                    actual: have.sql_type.clone(),
                });
            }
            // SQLite reports INTEGER PRIMARY KEY columns as nullable.
            if !want.primary_key && have.not_null != want.not_null {
                out.push(ShapeDifference::NotNull {
                    column: want.name.clone(),
                    expected: want.not_null,
                });
            }
            if normalize_default(have.default.as_deref()) != normalize_default(want.default.as_deref())
            {
                out.push(ShapeDifference::Default {
                    column: want.name.clone(),
                    expected: want.default.clone(),
                    actual: have.default.clone(),
                });
            }
        }

        for have in &self.columns {
            if spec.column(&have.name).is_none() {
                out.push(ShapeDifference::ExtraColumn(have.name.clone()));
            }
        }

        let want_pk = spec.primary_key();
        let have_pk = self.primary_key();
        if want_pk != have_pk {
            out.push(ShapeDifference::PrimaryKey {
                expected: want_pk.iter().map(|s| s.to_string()).collect(),
                actual: have_pk.iter().map(|s| s.to_string()).collect(),
            });
        }

        for want in &spec.foreign_keys {
            match self.foreign_key(&want.column) {
                None => out.push(ShapeDifference::MissingForeignKey(want.column.clone())),
                Some(have) => {
                    let column_matches = have
                        .parent_column
                        .as_deref()
                        .map_or(true, |c| c == want.parent_column);
                    if have.parent_table != want.parent_table
                        || !column_matches
                        || have.on_delete != want.on_delete
                    {
                        out.push(ShapeDifference::ForeignKey {
                            column: want.column.clone(),
                            expected: format!(
                                "{}({}) ON DELETE {}",
                                want.parent_table, want.parent_column, want.on_delete
                            ),
                            actual: format!(
                                "{}({}) ON DELETE {}",
                                have.parent_table,
                                have.parent_column.as_deref().unwrap_or("<pk>"),
                                have.on_delete
                            ),
                        });
                    }
                }
            }
        }

        for have in &self.foreign_keys {
            if !spec.foreign_keys.iter().any(|fk| fk.column == have.column) {
                out.push(ShapeDifference::ExtraForeignKey(have.column.clone()));
            }
        }

        for want in &spec.indexes {
            match self.indexes.iter().find(|i| i.name == want.name) {
                None => out.push(ShapeDifference::MissingIndex(want.name.clone())),
                Some(have) if have.columns != want.columns || have.unique != want.unique => {
                    out.push(ShapeDifference::IndexDefinition(want.name.clone()))
                }
                Some(_) => {}
            }
        }

        for have in &self.indexes {
            if !spec.indexes.iter().any(|i| i.name == have.name) {
                out.push(ShapeDifference::ExtraIndex(have.name.clone()));
            }
        }

        out
    }

    /// Whether the shape matches `spec` exactly.
    pub fn matches(&self, spec: &TableSpec) -> bool {
        self.diff(spec).is_empty()
    }
}

fn normalize_default(value: Option<&str>) -> Option<String> {
    value.map(|v| {
        let mut v = v.trim();
        while v.len() >= 2 && v.starts_with('(') && v.ends_with(')') {
            v = v[1..v.len() - 1].trim();
        }
        v.to_ascii_lowercase()
    })
}

/// One deviation between a live table and its declared shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeDifference {
    /// Declared column absent from the table.
    MissingColumn(String),
    /// Table column not declared.
    ExtraColumn(String),
    /// Declared type differs.
    ColumnType {
        column: String,
        expected: String,
        actual: String,
    },
    /// NOT NULL differs.
    NotNull { column: String, expected: bool },
    /// Default expression differs.
    Default {
        column: String,
        expected: Option<String>,
        actual: Option<String>,
    },
    /// Primary key columns differ.
    PrimaryKey {
        expected: Vec<String>,
        actual: Vec<String>,
    },
    /// Declared foreign key absent.
    MissingForeignKey(String),
    /// Foreign key target or action differs.
    ForeignKey {
        column: String,
        expected: String,
        actual: String,
    },
    /// Undeclared foreign key present.
    ExtraForeignKey(String),
    /// Declared index absent.
    MissingIndex(String),
    /// Index columns or uniqueness differ.
    IndexDefinition(String),
    /// Undeclared index present.
    ExtraIndex(String),
}

impl fmt::Display for ShapeDifference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeDifference::MissingColumn(c) => write!(f, "missing column {c}"),
            ShapeDifference::ExtraColumn(c) => write!(f, "unexpected column {c}"),
            ShapeDifference::ColumnType {
                column,
                expected,
                actual,
            } => write!(f, "column {column} has type {actual}, expected {expected}"),
            ShapeDifference::NotNull { column, expected } => {
                write!(f, "column {column} not-null is {}, expected {expected}", !expected)
            }
            ShapeDifference::Default {
                column,
                expected,
                actual,
            } => write!(
                f,
                "column {column} default is {}, expected {}",
                actual.as_deref().unwrap_or("none"),
                expected.as_deref().unwrap_or("none")
            ),
            ShapeDifference::PrimaryKey { expected, actual } => write!(
                f,
                "primary key is ({}), expected ({})",
                actual.join(", "),
                expected.join(", ")
            ),
            ShapeDifference::MissingForeignKey(c) => write!(f, "missing foreign key on {c}"),
            ShapeDifference::ForeignKey {
                column,
                expected,
                actual,
            } => write!(f, "foreign key on {column} is {actual}, expected {expected}"),
            ShapeDifference::ExtraForeignKey(c) => write!(f, "unexpected foreign key on {c}"),
            ShapeDifference::MissingIndex(i) => write!(f, "missing index {i}"),
            ShapeDifference::IndexDefinition(i) => write!(f, "index {i} has a different definition"),
            ShapeDifference::ExtraIndex(i) => write!(f, "unexpected index {i}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::spec::{ColumnSpec, ForeignKeySpec, IndexSpec};

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE folders (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             CREATE TABLE tests (
                 id INTEGER PRIMARY KEY,
                 title TEXT NOT NULL,
                 folder_id INTEGER REFERENCES folders(id)
             );
             CREATE INDEX idx_tests_folder ON tests(folder_id);",
        )
        .unwrap();
        conn
    }

    fn legacy_spec() -> TableSpec {
        TableSpec::new()
            .with_column(ColumnSpec::id("id"))
            .with_column(ColumnSpec::new("title", "TEXT").not_null())
            .with_column(ColumnSpec::new("folder_id", "INTEGER"))
            .with_foreign_key(ForeignKeySpec::new("folder_id", "folders", "id"))
            .with_index(IndexSpec::new("idx_tests_folder", ["folder_id"]))
    }

    #[test]
    fn test_load_missing_table() {
        let conn = setup();
        assert!(TableShape::load(&conn, "nope").unwrap().is_none());
    }

    #[test]
    fn test_load_reads_structure() {
        let conn = setup();
        let shape = TableShape::load(&conn, "tests").unwrap().unwrap();

        assert_eq!(shape.columns.len(), 3);
        assert_eq!(shape.primary_key(), vec!["id"]);
        assert!(shape.column("title").unwrap().not_null);

        let fk = shape.foreign_key("folder_id").unwrap();
        assert_eq!(fk.parent_table, "folders");
        assert_eq!(fk.parent_column.as_deref(), Some("id"));
        assert_eq!(fk.on_delete, OnDelete::NoAction);

        assert!(shape.has_index("idx_tests_folder"));
    }

    #[test]
    fn test_matching_spec_has_no_diff() {
        let conn = setup();
        let shape = TableShape::load(&conn, "tests").unwrap().unwrap();
        assert!(shape.matches(&legacy_spec()), "{:?}", shape.diff(&legacy_spec()));
    }

    #[test]
    fn test_diff_detects_new_column_and_fk_action() {
        let conn = setup();
        let shape = TableShape::load(&conn, "tests").unwrap().unwrap();

        let mut desired = legacy_spec().with_column(
            ColumnSpec::new("status", "TEXT")
                .not_null()
                .default_expr("'active'"),
        );
        desired.foreign_keys[0].on_delete = OnDelete::SetNull;

        let diff = shape.diff(&desired);
        assert!(diff.contains(&ShapeDifference::MissingColumn("status".into())));
        assert!(diff
            .iter()
            .any(|d| matches!(d, ShapeDifference::ForeignKey { column, .. } if column == "folder_id")));
        assert_eq!(diff.len(), 2);
    }

    #[test]
    fn test_diff_detects_extra_index_and_column() {
        let conn = setup();
        let shape = TableShape::load(&conn, "tests").unwrap().unwrap();

        let mut desired = legacy_spec();
        desired.indexes.clear();
        desired.columns.retain(|c| c.name != "title");

        let diff = shape.diff(&desired);
        assert!(diff.contains(&ShapeDifference::ExtraIndex("idx_tests_folder".into())));
        assert!(diff.contains(&ShapeDifference::ExtraColumn("title".into())));
    }

    #[test]
    fn test_default_comparison_ignores_parens_and_case() {
        assert_eq!(
            normalize_default(Some("(CURRENT_TIMESTAMP)")),
            normalize_default(Some("current_timestamp"))
        );
        assert_ne!(normalize_default(Some("'a'")), normalize_default(None));
    }
}
