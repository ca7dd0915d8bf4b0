//! Parameterised migration step descriptions.

use std::collections::HashSet;

use super::error::MigrationError;
use crate::integrity::ViolationKind;
use crate::schema::{OnDelete, TableShape, TableSpec};
use crate::store::quote_ident;

/// Where a copied column's value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopySource {
    /// A column of the old table.
    Column(String),
    /// A SQL expression evaluated against the old table's row.
    Expr(String),
}

/// One entry of the explicit copy list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyColumn {
    /// Column in the new table.
    pub target: String,
    /// Value source.
    pub source: CopySource,
}

impl CopyColumn {
    /// Copy a column under the same name.
    pub fn same(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            source: CopySource::Column(name.clone()),
            target: name,
        }
    }

    /// Copy `source` into `target`.
    pub fn renamed(target: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            source: CopySource::Column(source.into()),
        }
    }

    /// Fill `target` from an expression.
    pub fn expr(target: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            source: CopySource::Expr(sql.into()),
        }
    }

    fn source_sql(&self) -> String {
        match &self.source {
            CopySource::Column(c) => quote_ident(c),
            CopySource::Expr(e) => format!("({e})"),
        }
    }
}

/// Recognises the pre-migration shape of a table.
#[derive(Debug, Clone)]
pub enum LegacyDetector {
    /// The table lacks a column.
    MissingColumn(String),
    /// The table still has a column.
    ExtraColumn(String),
    /// The foreign key on `column` still uses `on_delete`.
    ForeignKeyAction {
        /// Referencing column.
        column: String,
        /// Legacy delete action.
        on_delete: OnDelete,
    },
    /// The table lacks an index.
    MissingIndex(String),
    /// Any of the nested detectors matches.
    AnyOf(Vec<LegacyDetector>),
    /// Arbitrary predicate over the live shape.
    Custom(fn(&TableShape) -> bool),
}

impl LegacyDetector {
    /// A detector that recognises nothing.
    pub fn none() -> Self {
        LegacyDetector::AnyOf(Vec::new())
    }

    /// Whether `shape` is a recognised legacy shape.
    pub fn matches(&self, shape: &TableShape) -> bool {
        match self {
            LegacyDetector::MissingColumn(c) => !shape.has_column(c),
            LegacyDetector::ExtraColumn(c) => shape.has_column(c),
            LegacyDetector::ForeignKeyAction { column, on_delete } => shape
                .foreign_key(column)
                .is_some_and(|fk| fk.on_delete == *on_delete),
            LegacyDetector::MissingIndex(name) => !shape.has_index(name),
            LegacyDetector::AnyOf(all) => all.iter().any(|d| d.matches(shape)),
            LegacyDetector::Custom(f) => f(shape),
        }
    }
}

/// One schema change to one managed table.
#[derive(Debug, Clone)]
pub struct MigrationStep {
    /// Unique step name, recorded in the schema-version ledger.
    pub name: String,
    /// Target table.
    pub table: String,
    /// Desired shape.
    pub desired: TableSpec,
    /// Explicit, ordered copy list.
    pub copy: Vec<CopyColumn>,
    /// Recognises the shape this step migrates from.
    pub legacy: LegacyDetector,
    /// Violation kinds on the target table that do not block the step.
    pub tolerated: Vec<ViolationKind>,
}

impl MigrationStep {
    /// Create a step with an empty copy list and no legacy detector.
    pub fn new(name: impl Into<String>, table: impl Into<String>, desired: TableSpec) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            desired,
            copy: Vec::new(),
            legacy: LegacyDetector::none(),
            tolerated: Vec::new(),
        }
    }

    /// Append a copy-list entry.
    pub fn copy(mut self, column: CopyColumn) -> Self {
        self.copy.push(column);
        self
    }

    /// Append same-name copies for each column.
    pub fn copy_same<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.copy.extend(columns.into_iter().map(CopyColumn::same));
        self
    }

    /// Set the legacy-shape detector.
    pub fn detect_legacy(mut self, detector: LegacyDetector) -> Self {
        self.legacy = detector;
        self
    }

    /// Allow violations of `kind` on the target table.
    pub fn tolerate(mut self, kind: ViolationKind) -> Self {
        self.tolerated.push(kind);
        self
    }

    /// Checks that need no store access.
    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.name.trim().is_empty() {
            return Err(MigrationError::Validation("step name is empty".to_string()));
        }
        if self.table.trim().is_empty() {
            return Err(self.invalid("target table is empty"));
        }
        if self.desired.columns.is_empty() {
            return Err(self.invalid("desired shape has no columns"));
        }
        if self.copy.is_empty() {
            return Err(self.invalid("copy list is empty"));
        }

        let mut seen = HashSet::new();
        for entry in &self.copy {
            if self.desired.column(&entry.target).is_none() {
                return Err(self.invalid(&format!(
                    "copy target {} is not a column of the desired shape",
                    entry.target
                )));
            }
            if !seen.insert(entry.target.as_str()) {
                return Err(self.invalid(&format!("copy target {} listed twice", entry.target)));
            }
            if let CopySource::Expr(sql) = &entry.source {
                if sql.trim().is_empty() {
                    return Err(self.invalid(&format!("empty expression for {}", entry.target)));
                }
            }
        }

        for column in &self.desired.columns {
            if column.requires_value() && !seen.contains(column.name.as_str()) {
                return Err(self.invalid(&format!(
                    "column {} is NOT NULL without default and missing from the copy list",
                    column.name
                )));
            }
        }

        Ok(())
    }

    /// Checks against the live shape being migrated from.
    pub fn validate_against(&self, shape: &TableShape) -> Result<(), MigrationError> {
        for entry in &self.copy {
            if let CopySource::Column(source) = &entry.source {
                if !shape.has_column(source) {
                    return Err(self.invalid(&format!(
                        "copy source {source} does not exist in {}",
                        self.table
                    )));
                }
            }
        }
        Ok(())
    }

    /// Quoted target list and source projection for the copy statement.
    pub(crate) fn copy_lists(&self) -> (String, String) {
        let targets: Vec<String> = self.copy.iter().map(|c| quote_ident(&c.target)).collect();
        let sources: Vec<String> = self.copy.iter().map(CopyColumn::source_sql).collect();
        (targets.join(", "), sources.join(", "))
    }

    fn invalid(&self, message: &str) -> MigrationError {
        MigrationError::Validation(format!("{}: {message}", self.name))
    }
}
