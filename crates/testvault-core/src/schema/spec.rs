//! Declared table shapes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::store::quote_ident;

/// Action taken on child rows when a referenced parent row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    /// No action (SQLite default).
    NoAction,
    /// Prevent deletion of a referenced parent.
    Restrict,
    /// Delete the child rows.
    Cascade,
    /// Null out the reference.
    SetNull,
    /// Reset the reference to its column default.
    SetDefault,
}

impl OnDelete {
    /// SQL keyword form.
    pub fn as_sql(&self) -> &'static str {
        match self {
            OnDelete::NoAction => "NO ACTION",
            OnDelete::Restrict => "RESTRICT",
            OnDelete::Cascade => "CASCADE",
            OnDelete::SetNull => "SET NULL",
            OnDelete::SetDefault => "SET DEFAULT",
        }
    }

    /// Parse the form reported by `PRAGMA foreign_key_list`.
    pub fn from_pragma(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "RESTRICT" => OnDelete::Restrict,
            "CASCADE" => OnDelete::Cascade,
            "SET NULL" => OnDelete::SetNull,
            "SET DEFAULT" => OnDelete::SetDefault,
            _ => OnDelete::NoAction,
        }
    }
}

impl fmt::Display for OnDelete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// A declared column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name.
    pub name: String,
    /// Declared SQL type.
    pub sql_type: String,
    /// NOT NULL constraint.
    pub not_null: bool,
    /// Default expression, verbatim SQL (e.g. `'active'`, `0`, `CURRENT_TIMESTAMP`).
    pub default: Option<String>,
    /// Part of the primary key.
    pub primary_key: bool,
}

impl ColumnSpec {
    /// Create a nullable column.
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            not_null: false,
            default: None,
            primary_key: false,
        }
    }

    /// `INTEGER PRIMARY KEY` identity column.
    pub fn id(name: impl Into<String>) -> Self {
        Self::new(name, "INTEGER").primary_key()
    }

    /// Mark the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// Set the default expression.
    pub fn default_expr(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    /// Mark the column as (part of) the primary key.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Whether inserts must supply a value for this column.
    pub fn requires_value(&self) -> bool {
        self.not_null && self.default.is_none() && !self.primary_key
    }

    fn render(&self, inline_pk: bool) -> String {
        let mut sql = format!("{} {}", quote_ident(&self.name), self.sql_type);
        if inline_pk && self.primary_key {
            sql.push_str(" PRIMARY KEY");
        }
        if self.not_null {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        sql
    }
}

/// A declared foreign-key edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeySpec {
    /// Referencing column.
    pub column: String,
    /// Referenced table.
    pub parent_table: String,
    /// Referenced column.
    pub parent_column: String,
    /// Delete action.
    pub on_delete: OnDelete,
}

impl ForeignKeySpec {
    /// Create an edge with `NO ACTION` on delete.
    pub fn new(
        column: impl Into<String>,
        parent_table: impl Into<String>,
        parent_column: impl Into<String>,
    ) -> Self {
        Self {
            column: column.into(),
            parent_table: parent_table.into(),
            parent_column: parent_column.into(),
            on_delete: OnDelete::NoAction,
        }
    }

    /// Set the delete action.
    pub fn on_delete(mut self, action: OnDelete) -> Self {
        self.on_delete = action;
        self
    }
}

/// A declared secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Index name (unique within the store).
    pub name: String,
    /// Indexed columns in order.
    pub columns: Vec<String>,
    /// UNIQUE index.
    pub unique: bool,
}

impl IndexSpec {
    /// Create a non-unique index.
    pub fn new<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    /// Create a unique index.
    pub fn unique<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            unique: true,
            ..Self::new(name, columns)
        }
    }

    /// `CREATE [UNIQUE] INDEX IF NOT EXISTS` statement for `table`.
    pub fn create_sql(&self, table: &str) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if self.unique { "UNIQUE " } else { "" },
            quote_ident(&self.name),
            quote_ident(table),
            columns.join(", ")
        )
    }
}

/// Desired shape of one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    /// Columns in declaration order.
    pub columns: Vec<ColumnSpec>,
    /// Foreign-key edges.
    pub foreign_keys: Vec<ForeignKeySpec>,
    /// Secondary indexes.
    pub indexes: Vec<IndexSpec>,
}

impl TableSpec {
    /// Create an empty spec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column.
    pub fn with_column(mut self, column: ColumnSpec) -> Self {
        self.columns.push(column);
        self
    }

    /// Add a foreign-key edge.
    pub fn with_foreign_key(mut self, fk: ForeignKeySpec) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    /// Add an index.
    pub fn with_index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Primary-key columns in declaration order.
    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// `CREATE TABLE` statement for `table`.
    pub fn create_sql(&self, table: &str) -> String {
        let pk = self.primary_key();
        let inline_pk = pk.len() == 1;

        let mut parts: Vec<String> = self.columns.iter().map(|c| c.render(inline_pk)).collect();

        if pk.len() > 1 {
            let cols: Vec<String> = pk.iter().map(|c| quote_ident(c)).collect();
            parts.push(format!("PRIMARY KEY ({})", cols.join(", ")));
        }

        for fk in &self.foreign_keys {
            let mut clause = format!(
                "FOREIGN KEY ({}) REFERENCES {} ({})",
                quote_ident(&fk.column),
                quote_ident(&fk.parent_table),
                quote_ident(&fk.parent_column)
            );
            if fk.on_delete != OnDelete::NoAction {
                clause.push_str(" ON DELETE ");
                clause.push_str(fk.on_delete.as_sql());
            }
            parts.push(clause);
        }

        format!(
            "CREATE TABLE {} (\n    {}\n)",
            quote_ident(table),
            parts.join(",\n    ")
        )
    }
}
