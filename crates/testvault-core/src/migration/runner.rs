//! Ordered execution of migration steps.

use serde::Serialize;
use tracing::{info, instrument, warn};

use super::engine::{CopyObserver, MigrationEngine, StepResult, StepStatus};
use super::error::{MigrationError, RollbackCause};
use super::step::MigrationStep;
use crate::integrity::{AuditReport, IntegrityAuditor, Violation};
use crate::schema::SchemaRegistry;
use crate::store::Store;

/// Classification of a run failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// Malformed step or unrecognised table shape.
    Validation,
    /// Blocked by the pre-step audit.
    IntegrityViolation,
    /// Copy verification failed and the step rolled back.
    RowCountMismatch,
    /// Any other rollback inside the swap transaction.
    RolledBack,
    /// Store or IO failure.
    Storage,
}

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureCause {
    /// Classification.
    pub kind: FailureKind,
    /// Human-readable message.
    pub message: String,
    /// Blocking violations, for integrity failures.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
}

impl From<MigrationError> for FailureCause {
    fn from(err: MigrationError) -> Self {
        let message = err.to_string();
        match err {
            MigrationError::IntegrityViolation { violations, .. } => Self {
                kind: FailureKind::IntegrityViolation,
                message,
                violations,
            },
            MigrationError::Validation(_) | MigrationError::UnknownShape { .. } => Self {
                kind: FailureKind::Validation,
                message,
                violations: Vec::new(),
            },
            MigrationError::TableNotFound(_) | MigrationError::Storage(_) => Self {
                kind: FailureKind::Storage,
                message,
                violations: Vec::new(),
            },
        }
    }
}

impl From<&RollbackCause> for FailureCause {
    fn from(cause: &RollbackCause) -> Self {
        let kind = match cause {
            RollbackCause::RowCountMismatch { .. } => FailureKind::RowCountMismatch,
            _ => FailureKind::RolledBack,
        };
        Self {
            kind,
            message: cause.to_string(),
            violations: Vec::new(),
        }
    }
}

/// Result of [`MigrationRunner::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// Steps that ended applied or already applied, in order.
    pub completed: Vec<String>,
    /// Subset of `completed` that was already applied.
    pub already_applied: Vec<String>,
    /// Per-step results, including the failed step when it reached the engine.
    pub steps: Vec<StepResult>,
    /// Step that stopped the run.
    pub failed_at: Option<String>,
    /// Why it stopped.
    pub cause: Option<FailureCause>,
    /// Post-run audit, present when every step succeeded.
    pub certification: Option<AuditReport>,
}

/// The three operator-visible outcomes of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunOutcome {
    /// Every step was already applied.
    NothingToDo,
    /// At least one step was applied and none failed.
    Applied,
    /// A step failed; its table is unchanged.
    Failed,
}

impl RunReport {
    /// Classify the run.
    pub fn outcome(&self) -> RunOutcome {
        if self.failed_at.is_some() {
            RunOutcome::Failed
        } else if self.completed.len() == self.already_applied.len() {
            RunOutcome::NothingToDo
        } else {
            RunOutcome::Applied
        }
    }

    /// Whether the run succeeded and the certification audit passed.
    pub fn is_certified(&self) -> bool {
        self.failed_at.is_none() && self.certification.as_ref().is_some_and(|c| c.passed)
    }

    fn fail(&mut self, step: &MigrationStep, cause: FailureCause) {
        warn!(step = %step.name, kind = ?cause.kind, message = %cause.message, "migration run stopped");
        self.failed_at = Some(step.name.clone());
        self.cause = Some(cause);
    }
}

/// Runs an ordered list of steps, stopping at the first failure.
pub struct MigrationRunner<'a> {
    store: &'a Store,
    auditor: IntegrityAuditor<'a>,
    engine: MigrationEngine<'a>,
}

impl<'a> MigrationRunner<'a> {
    /// Create a runner over `store`, auditing against `registry`.
    pub fn new(store: &'a Store, registry: &'a SchemaRegistry) -> Self {
        Self {
            store,
            auditor: IntegrityAuditor::new(registry),
            engine: MigrationEngine::new(store),
        }
    }

    /// Set the copy batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.engine = self.engine.with_batch_size(size);
        self
    }

    /// Install a copy observer on the engine.
    pub fn with_observer(mut self, observer: &'a dyn CopyObserver) -> Self {
        self.engine = self.engine.with_observer(observer);
        self
    }

    /// Execute `steps` in order.
    #[instrument(skip_all, fields(steps = steps.len()))]
    pub fn run(&self, steps: &[MigrationStep]) -> RunReport {
        let mut report = RunReport::default();

        for step in steps {
            match self.gate(step) {
                Ok(()) => {}
                Err(err) => {
                    report.fail(step, err.into());
                    return report;
                }
            }

            match self.engine.apply_step(step) {
                Ok(result) => {
                    let status = result.status;
                    let cause = result.cause.as_ref().map(FailureCause::from);
                    report.steps.push(result);
                    match status {
                        StepStatus::AlreadyApplied => {
                            report.completed.push(step.name.clone());
                            report.already_applied.push(step.name.clone());
                        }
                        StepStatus::Applied => report.completed.push(step.name.clone()),
                        StepStatus::RolledBack => {
                            report.fail(step, cause.unwrap_or_else(|| rolled_back(step)));
                            return report;
                        }
                    }
                }
                Err(err) => {
                    report.fail(step, err.into());
                    return report;
                }
            }
        }

        match self.auditor.audit_store(self.store) {
            Ok(audit) => {
                if !audit.passed {
                    warn!(violations = audit.violations.len(), "certification audit found violations");
                }
                report.certification = Some(audit);
            }
            Err(err) => warn!(error = %err, "certification audit failed to run"),
        }

        info!(
            completed = report.completed.len(),
            already_applied = report.already_applied.len(),
            "migration run finished"
        );
        report
    }

    /// Pre-step audit. Steps whose table already matches are never blocked.
    fn gate(&self, step: &MigrationStep) -> Result<(), MigrationError> {
        step.validate()?;
        if self.engine.is_applied(step)? {
            return Ok(());
        }

        let mut audit = self.auditor.audit_store(self.store)?;
        let pending = self
            .store
            .with_conn(|conn| self.auditor.audit_pending_uniques(conn, &step.table, &step.desired))?;
        audit.merge(pending);

        let blocking: Vec<Violation> = audit
            .blocking_for(&step.table, &step.tolerated)
            .cloned()
            .collect();
        if blocking.is_empty() {
            Ok(())
        } else {
            Err(MigrationError::IntegrityViolation {
                step: step.name.clone(),
                table: step.table.clone(),
                violations: blocking,
            })
        }
    }
}

fn rolled_back(step: &MigrationStep) -> FailureCause {
    FailureCause {
        kind: FailureKind::RolledBack,
        message: format!("{} rolled back", step.name),
        violations: Vec::new(),
    }
}
