//! The testvault catalogue: managed tables, baseline schema and built-in steps.
//!
//! `install_baseline` creates the original (pre-migration) shape on an empty
//! store. [`builtin_steps`] then brings each table to its current shape; one
//! step per table, so a step never has to recognise a shape produced by a
//! later step.

use rusqlite::Connection;
use tracing::info;

use crate::error::Error;
use crate::migration::{CopyColumn, LegacyDetector, MigrationStep};
use crate::schema::{
    ColumnSpec, ForeignKeySpec, IndexSpec, ManagedTable, OnDelete, SchemaRegistry, TableSpec,
};
use crate::store::table_exists;

/// Step adding `tests.status` and `ON DELETE SET NULL` on `tests.folder_id`.
pub const STEP_TESTS_STATUS: &str = "0001_tests_status_and_folder_set_null";

/// Step adding the unique `(test_id, tag_id)` index and cascading deletes.
pub const STEP_TEST_TAGS_UNIQUE: &str = "0002_test_tags_unique_pair";

/// Managed tables of the catalogue.
pub fn registry() -> SchemaRegistry {
    SchemaRegistry::new()
        .with_table(ManagedTable::new("subjects").with_label("name"))
        .with_table(ManagedTable::new("grades").with_label("name"))
        .with_table(
            ManagedTable::new("folders")
                .optionally_references("parent_id", "folders")
                .with_label("name"),
        )
        .with_table(ManagedTable::new("tags").with_label("name"))
        .with_table(
            ManagedTable::new("tests")
                .references("subject_id", "subjects")
                .optionally_references("grade_id", "grades")
                .optionally_references("folder_id", "folders")
                .with_label("title")
                .with_blob("file_path"),
        )
        .with_table(
            ManagedTable::new("test_tags")
                .references("test_id", "tests")
                .references("tag_id", "tags"),
        )
        .with_retired("tests_backup")
        .with_retired("test_subjects")
}

fn named_table() -> TableSpec {
    TableSpec::new()
        .with_column(ColumnSpec::id("id"))
        .with_column(ColumnSpec::new("name", "TEXT").not_null())
}

fn folders() -> TableSpec {
    named_table()
        .with_column(ColumnSpec::new("parent_id", "INTEGER"))
        .with_foreign_key(
            ForeignKeySpec::new("parent_id", "folders", "id").on_delete(OnDelete::Cascade),
        )
}

fn tests_columns(with_status: bool) -> TableSpec {
    let mut spec = TableSpec::new()
        .with_column(ColumnSpec::id("id"))
        .with_column(ColumnSpec::new("title", "TEXT").not_null())
        .with_column(ColumnSpec::new("subject_id", "INTEGER").not_null())
        .with_column(ColumnSpec::new("grade_id", "INTEGER"))
        .with_column(ColumnSpec::new("folder_id", "INTEGER"))
        .with_column(ColumnSpec::new("file_path", "TEXT"));
    if with_status {
        spec = spec.with_column(
            ColumnSpec::new("status", "TEXT")
                .not_null()
                .default_expr("'active'"),
        );
    }
    spec.with_column(
        ColumnSpec::new("created_at", "TEXT")
            .not_null()
            .default_expr("CURRENT_TIMESTAMP"),
    )
}

fn baseline_tests() -> TableSpec {
    tests_columns(false)
        .with_foreign_key(ForeignKeySpec::new("subject_id", "subjects", "id"))
        .with_foreign_key(ForeignKeySpec::new("grade_id", "grades", "id"))
        .with_foreign_key(ForeignKeySpec::new("folder_id", "folders", "id"))
        .with_index(IndexSpec::new("idx_tests_subject", ["subject_id"]))
}

/// Current shape of `tests`.
pub fn tests_spec() -> TableSpec {
    tests_columns(true)
        .with_foreign_key(ForeignKeySpec::new("subject_id", "subjects", "id"))
        .with_foreign_key(ForeignKeySpec::new("grade_id", "grades", "id"))
        .with_foreign_key(
            ForeignKeySpec::new("folder_id", "folders", "id").on_delete(OnDelete::SetNull),
        )
        .with_index(IndexSpec::new("idx_tests_subject", ["subject_id"]))
        .with_index(IndexSpec::new("idx_tests_folder", ["folder_id"]))
}

fn test_tags_columns() -> TableSpec {
    TableSpec::new()
        .with_column(ColumnSpec::id("id"))
        .with_column(ColumnSpec::new("test_id", "INTEGER").not_null())
        .with_column(ColumnSpec::new("tag_id", "INTEGER").not_null())
}

fn baseline_test_tags() -> TableSpec {
    test_tags_columns()
        .with_foreign_key(ForeignKeySpec::new("test_id", "tests", "id"))
        .with_foreign_key(ForeignKeySpec::new("tag_id", "tags", "id"))
}

/// Current shape of `test_tags`.
pub fn test_tags_spec() -> TableSpec {
    test_tags_columns()
        .with_foreign_key(
            ForeignKeySpec::new("test_id", "tests", "id").on_delete(OnDelete::Cascade),
        )
        .with_foreign_key(ForeignKeySpec::new("tag_id", "tags", "id").on_delete(OnDelete::Cascade))
        .with_index(IndexSpec::unique("ux_test_tags_pair", ["test_id", "tag_id"]))
}

fn baseline() -> Vec<(&'static str, TableSpec)> {
    vec![
        ("subjects", named_table()),
        ("grades", named_table()),
        ("folders", folders()),
        ("tags", named_table()),
        ("tests", baseline_tests()),
        ("test_tags", baseline_test_tags()),
    ]
}

/// Create every missing catalogue table in its original shape.
///
/// Existing tables are left alone. Returns the number of tables created.
pub fn install_baseline(conn: &Connection) -> Result<usize, Error> {
    let mut created = 0;
    for (table, spec) in baseline() {
        if table_exists(conn, table)? {
            continue;
        }
        conn.execute_batch(&spec.create_sql(table))?;
        for index in &spec.indexes {
            conn.execute_batch(&index.create_sql(table))?;
        }
        created += 1;
    }
    if created > 0 {
        info!(created, "installed baseline schema");
    }
    Ok(created)
}

/// Built-in migration steps in application order.
pub fn builtin_steps() -> Vec<MigrationStep> {
    vec![
        MigrationStep::new(STEP_TESTS_STATUS, "tests", tests_spec())
            .copy_same([
                "id",
                "title",
                "subject_id",
                "grade_id",
                "folder_id",
                "file_path",
                "created_at",
            ])
            .detect_legacy(LegacyDetector::AnyOf(vec![
                LegacyDetector::MissingColumn("status".to_string()),
                LegacyDetector::ForeignKeyAction {
                    column: "folder_id".to_string(),
                    on_delete: OnDelete::NoAction,
                },
            ])),
        MigrationStep::new(STEP_TEST_TAGS_UNIQUE, "test_tags", test_tags_spec())
            .copy(CopyColumn::same("id"))
            .copy(CopyColumn::same("test_id"))
            .copy(CopyColumn::same("tag_id"))
            .detect_legacy(LegacyDetector::AnyOf(vec![
                LegacyDetector::MissingIndex("ux_test_tags_pair".to_string()),
                LegacyDetector::ForeignKeyAction {
                    column: "test_id".to_string(),
                    on_delete: OnDelete::NoAction,
                },
            ])),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::IntegrityAuditor;
    use crate::migration::{MigrationRunner, RunOutcome};
    use crate::schema::TableShape;
    use crate::store::Store;

    fn seeded() -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                install_baseline(conn)?;
                conn.execute_batch(
                    "INSERT INTO subjects (id, name) VALUES (1, 'Maths');
                     INSERT INTO folders (id, name, parent_id) VALUES (1, 'Year 7', NULL);
                     INSERT INTO tags (id, name) VALUES (1, 'algebra'), (2, 'geometry');
                     INSERT INTO tests (id, title, subject_id, folder_id) VALUES
                        (1, 'Fractions', 1, 1), (2, 'Angles', 1, NULL);
                     INSERT INTO test_tags (id, test_id, tag_id) VALUES (1, 1, 1), (2, 2, 2);",
                )?;
                Ok::<_, Error>(())
            })
            .unwrap();
        store
    }

    #[test]
    fn test_install_baseline_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.with_conn(install_baseline).unwrap(), 6);
        assert_eq!(store.with_conn(install_baseline).unwrap(), 0);
    }

    #[test]
    fn test_baseline_is_recognised_as_legacy() {
        let store = seeded();
        store
            .with_conn(|conn| {
                for step in builtin_steps() {
                    let shape = TableShape::load(conn, &step.table)?.unwrap();
                    assert!(!shape.matches(&step.desired), "{}", step.name);
                    assert!(step.legacy.matches(&shape), "{}", step.name);
                    step.validate_against(&shape).unwrap();
                }
                Ok::<_, Error>(())
            })
            .unwrap();
    }

    #[test]
    fn test_baseline_passes_audit() {
        let store = seeded();
        let registry = registry();
        let report = IntegrityAuditor::new(&registry).audit_store(&store).unwrap();
        assert!(report.passed, "{:?}", report.violations);
    }

    #[test]
    fn test_builtin_steps_upgrade_baseline() {
        let store = seeded();
        let registry = registry();
        let steps = builtin_steps();

        let report = MigrationRunner::new(&store, &registry).run(&steps);
        assert_eq!(report.outcome(), RunOutcome::Applied);
        assert!(report.is_certified());

        let status: String = store
            .with_conn(|conn| {
                conn.query_row("SELECT status FROM tests WHERE id = 1", [], |row| row.get(0))
            })
            .unwrap();
        assert_eq!(status, "active");

        // Folder delete now nulls the reference.
        store
            .with_conn(|conn| conn.execute("DELETE FROM folders WHERE id = 1", []))
            .unwrap();
        let folder: Option<i64> = store
            .with_conn(|conn| {
                conn.query_row("SELECT folder_id FROM tests WHERE id = 1", [], |row| row.get(0))
            })
            .unwrap();
        assert_eq!(folder, None);

        let again = MigrationRunner::new(&store, &registry).run(&steps);
        assert_eq!(again.outcome(), RunOutcome::NothingToDo);
    }

    #[test]
    fn test_duplicate_pairs_block_unique_index() {
        let store = seeded();
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO test_tags (id, test_id, tag_id) VALUES (3, 1, 1)",
                    [],
                )
            })
            .unwrap();
        let registry = registry();

        let report = MigrationRunner::new(&store, &registry).run(&builtin_steps());
        assert_eq!(report.outcome(), RunOutcome::Failed);
        assert_eq!(report.failed_at.as_deref(), Some(STEP_TEST_TAGS_UNIQUE));
        assert_eq!(report.completed, vec![STEP_TESTS_STATUS.to_string()]);
        assert_eq!(store.row_count("test_tags").unwrap(), 3);
    }
}
