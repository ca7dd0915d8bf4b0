//! Managed table declarations.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

/// A declared reference from one managed table to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceEdge {
    /// Referencing column.
    pub column: String,
    /// Referenced table.
    pub parent: String,
    /// Referenced column.
    pub parent_column: String,
    /// When true, a null reference is a violation.
    pub required: bool,
}

/// A table whose schema lifecycle is governed by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedTable {
    /// Table name.
    pub name: String,
    /// Identity (primary key) column; always an integer rowid alias.
    pub identity: String,
    /// Outgoing reference edges.
    pub edges: Vec<ReferenceEdge>,
    /// Column shown to operators when previewing a restore.
    pub label_column: Option<String>,
    /// Column holding a path relative to the blob tree.
    pub blob_column: Option<String>,
}

impl ManagedTable {
    /// Declare a table with an `id` identity column.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identity: "id".to_string(),
            edges: Vec::new(),
            label_column: None,
            blob_column: None,
        }
    }

    /// Override the identity column.
    pub fn with_identity(mut self, column: impl Into<String>) -> Self {
        self.identity = column.into();
        self
    }

    /// Add a required reference to `parent.id`.
    pub fn references(mut self, column: impl Into<String>, parent: impl Into<String>) -> Self {
        self.edges.push(ReferenceEdge {
            column: column.into(),
            parent: parent.into(),
            parent_column: "id".to_string(),
            required: true,
        });
        self
    }

    /// Add an optional (nullable) reference to `parent.id`.
    pub fn optionally_references(
        mut self,
        column: impl Into<String>,
        parent: impl Into<String>,
    ) -> Self {
        self.edges.push(ReferenceEdge {
            column: column.into(),
            parent: parent.into(),
            parent_column: "id".to_string(),
            required: false,
        });
        self
    }

    /// Set the preview label column.
    pub fn with_label(mut self, column: impl Into<String>) -> Self {
        self.label_column = Some(column.into());
        self
    }

    /// Set the blob path column.
    pub fn with_blob(mut self, column: impl Into<String>) -> Self {
        self.blob_column = Some(column.into());
        self
    }

    /// Whether the table references itself (e.g. folder trees).
    pub fn is_self_referencing(&self) -> bool {
        self.edges.iter().any(|e| e.parent == self.name)
    }
}

/// The fixed, named set of managed tables.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaRegistry {
    tables: Vec<ManagedTable>,
    retired: Vec<String>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a managed table.
    pub fn with_table(mut self, table: ManagedTable) -> Self {
        self.tables.push(table);
        self
    }

    /// Record a table name that must no longer exist or be referenced.
    pub fn with_retired(mut self, name: impl Into<String>) -> Self {
        self.retired.push(name.into());
        self
    }

    /// All managed tables in declaration order.
    pub fn tables(&self) -> &[ManagedTable] {
        &self.tables
    }

    /// Retired table names.
    pub fn retired(&self) -> &[String] {
        &self.retired
    }

    /// Look up a managed table.
    pub fn table(&self, name: &str) -> Option<&ManagedTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Whether `name` is managed.
    pub fn is_managed(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    /// Tables ordered parents-before-children.
    ///
    /// Self references are ignored; ties keep declaration order. Tables caught
    /// in a reference cycle are appended in declaration order.
    pub fn dependency_order(&self) -> Vec<&ManagedTable> {
        let names: HashSet<&str> = self.tables.iter().map(|t| t.name.as_str()).collect();
        let mut pending: HashMap<&str, usize> = HashMap::new();
        for table in &self.tables {
            let parents: HashSet<&str> = table
                .edges
                .iter()
                .map(|e| e.parent.as_str())
                .filter(|p| *p != table.name && names.contains(p))
                .collect();
            pending.insert(table.name.as_str(), parents.len());
        }

        let mut ordered: Vec<&ManagedTable> = Vec::with_capacity(self.tables.len());
        let mut placed: HashSet<&str> = HashSet::new();

        loop {
            let next = self.tables.iter().find(|t| {
                !placed.contains(t.name.as_str()) && pending.get(t.name.as_str()) == Some(&0)
            });
            let Some(next) = next else { break };

            placed.insert(next.name.as_str());
            ordered.push(next);

            for child in &self.tables {
                if placed.contains(child.name.as_str()) {
                    continue;
                }
                let refs_next = child
                    .edges
                    .iter()
                    .filter(|e| e.parent != child.name)
                    .any(|e| e.parent == next.name);
                if refs_next {
                    if let Some(count) = pending.get_mut(child.name.as_str()) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
        }

        for table in &self.tables {
            if !placed.contains(table.name.as_str()) {
                ordered.push(table);
            }
        }

        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new()
            .with_table(
                ManagedTable::new("tests")
                    .references("subject_id", "subjects")
                    .optionally_references("folder_id", "folders"),
            )
            .with_table(ManagedTable::new("folders").optionally_references("parent_id", "folders"))
            .with_table(ManagedTable::new("subjects"))
            .with_retired("tests_old")
    }

    #[test]
    fn test_dependency_order_puts_parents_first() {
        let registry = registry();
        let order: Vec<&str> = registry
            .dependency_order()
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(order, vec!["folders", "subjects", "tests"]);
    }

    #[test]
    fn test_lookup_and_flags() {
        let registry = registry();
        assert!(registry.is_managed("tests"));
        assert!(!registry.is_managed("tests_old"));
        assert_eq!(registry.retired(), &["tests_old".to_string()]);
        assert!(registry.table("folders").unwrap().is_self_referencing());
        assert!(!registry.table("tests").unwrap().is_self_referencing());
    }

    #[test]
    fn test_cycle_members_are_still_returned() {
        let registry = SchemaRegistry::new()
            .with_table(ManagedTable::new("a").references("b_id", "b"))
            .with_table(ManagedTable::new("b").references("a_id", "a"));
        assert_eq!(registry.dependency_order().len(), 2);
    }
}
