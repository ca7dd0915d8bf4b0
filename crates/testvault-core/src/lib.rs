//! testvault core - Schema evolution, backup, retention and restore engine.
//!
//! This crate owns the managed SQLite store of the testvault catalogue and
//! everything that changes or copies it as a whole: in-place table migrations,
//! integrity audits, backup generations, retention pruning, selective restore
//! and the daily backup scheduler.

pub mod backup;
pub mod catalog;
pub mod config;
pub mod error;
pub mod integrity;
pub mod migration;
pub mod scheduler;
pub mod schema;
pub mod store;

pub use backup::{
    BackupArchiver, BackupError, BackupGeneration, GenerationLeases, PruneReport, RecordRef,
    RestoreCoordinator, RestoreResult, RestoreSource, RetentionPruner,
};
pub use config::{ScheduleConfig, VaultConfig};
pub use error::{Error, Result};
pub use integrity::{AuditReport, IntegrityAuditor, Violation, ViolationKind};
pub use migration::{
    CopyColumn, LegacyDetector, MigrationEngine, MigrationError, MigrationRunner, MigrationStep,
    RunOutcome, RunReport, StepResult, StepStatus,
};
pub use scheduler::{BackupScheduler, SchedulerFault, SchedulerStatus};
pub use schema::{SchemaRegistry, TableShape, TableSpec};
pub use store::{MaintenanceLock, SharedStore, Store};
