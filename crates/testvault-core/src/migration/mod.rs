//! Schema evolution for managed tables.
//!
//! Each change is a declarative [`MigrationStep`]: target table, desired
//! shape, explicit copy list and a detector for the shape it migrates from.
//! One generic [`MigrationEngine`] applies any step through a shadow-table
//! swap inside a single exclusive transaction; [`MigrationRunner`] sequences
//! steps behind an integrity gate and certifies the result.
//!
//! Idempotency comes from structured introspection: a step whose table
//! already matches the desired shape is a no-op. The `schema_version` ledger
//! records every applied step for operators and backups.
//!
//! # Example
//!
//! ```ignore
//! use testvault_core::migration::MigrationRunner;
//!
//! let registry = testvault_core::catalog::registry();
//! let report = MigrationRunner::new(&store, &registry).run(&testvault_core::catalog::builtin_steps());
//! println!("{:?}", report.outcome());
//! ```

pub mod engine;
pub mod error;
pub mod ledger;
pub mod runner;
pub mod step;

pub use engine::{shadow_name, CopyObserver, MigrationEngine, StepResult, StepStatus};
pub use error::{MigrationError, RollbackCause};
pub use ledger::{LedgerEntry, LEDGER_TABLE};
pub use runner::{FailureCause, FailureKind, MigrationRunner, RunOutcome, RunReport};
pub use step::{CopyColumn, CopySource, LegacyDetector, MigrationStep};
