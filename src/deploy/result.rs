//! Deployment run results

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::migration::{MigrationResult, ValidationReport, Version};

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStage {
    Validate,
    PreChecks,
    Backup,
    Apply,
    PostChecks,
    Maintenance,
    Finalize,
}

impl DeploymentStage {
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentStage::Validate => "validate",
            DeploymentStage::PreChecks => "pre_checks",
            DeploymentStage::Backup => "backup",
            DeploymentStage::Apply => "apply",
            DeploymentStage::PostChecks => "post_checks",
            DeploymentStage::Maintenance => "maintenance",
            DeploymentStage::Finalize => "finalize",
        }
    }

    /// Whether a failure in this stage can leave migrations applied
    pub fn can_leave_changes(self) -> bool {
        self >= DeploymentStage::Apply
    }
}

impl fmt::Display for DeploymentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of a finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentOutcome {
    /// The schema was not changed (up to date, or stopped before applying)
    NothingApplied,
    /// Migrations were applied and every stage passed
    Deployed,
    /// Migrations were applied, a later failure occurred, and they were reverted
    Recovered,
    /// Migrations were applied, a later failure occurred, and they are still applied
    Unrecoverable,
}

/// Everything one deployment run did
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentResult {
    pub deployment_id: Uuid,
    pub success: bool,
    pub message: String,
    pub validation: Option<ValidationReport>,
    /// Migrations applied by this run, before any automatic rollback
    pub applied_migrations: Vec<String>,
    pub failed_migrations: Vec<String>,
    /// Outcome of the automatic rollback, when one ran
    pub rollback_result: Option<MigrationResult>,
    /// Stage at which the run stopped, if it failed
    pub failed_stage: Option<DeploymentStage>,
    pub backup_location: Option<String>,
    pub final_schema_version: Option<Version>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl DeploymentResult {
    pub(crate) fn start() -> Self {
        let now = Utc::now();
        Self {
            deployment_id: Uuid::new_v4(),
            success: false,
            message: String::new(),
            validation: None,
            applied_migrations: Vec::new(),
            failed_migrations: Vec::new(),
            rollback_result: None,
            failed_stage: None,
            backup_location: None,
            final_schema_version: None,
            started_at: now,
            finished_at: now,
            duration: Duration::ZERO,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn outcome(&self) -> DeploymentOutcome {
        if self.applied_migrations.is_empty() {
            return DeploymentOutcome::NothingApplied;
        }
        if self.success {
            return DeploymentOutcome::Deployed;
        }
        match &self.rollback_result {
            Some(rollback) if rollback.success => DeploymentOutcome::Recovered,
            _ => DeploymentOutcome::Unrecoverable,
        }
    }
}
