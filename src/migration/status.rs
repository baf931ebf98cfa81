//! Validation reports and migration run results

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use super::definition::Version;

/// One validation finding, scoped to a migration and a field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    /// Migration the finding is about
    pub migration_id: String,
    /// Field of the definition at fault (`dependencies`, `version`, `up_script`, ...)
    pub field: &'static str,
    /// Human-readable description
    pub message: String,
}

impl ValidationIssue {
    pub(crate) fn new(migration_id: &str, field: &'static str, message: impl Into<String>) -> Self {
        Self {
            migration_id: migration_id.to_string(),
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.migration_id, self.field, self.message)
    }
}

/// Result of validating the pending migration set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// `true` when there are no errors (warnings do not block)
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    /// Pending migration ids in apply order
    pub pending: Vec<String>,
    /// Highest applied version, or [`Version::ZERO`]
    pub current_version: Version,
    /// Highest pending version, or `current_version` when nothing is pending
    pub target_version: Version,
}

impl ValidationReport {
    /// Whether there is nothing to apply
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Outcome of an apply or rollback run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct MigrationResult {
    /// `true` when no migration failed
    pub success: bool,
    /// Migrations applied by this run, in order
    pub applied: Vec<String>,
    /// Migrations reverted by this run, in order
    pub rolled_back: Vec<String>,
    /// Migrations whose scripts failed
    pub failed: Vec<String>,
    /// Error text for each failure
    pub errors: Vec<String>,
    /// Wall-clock duration of the run
    pub duration: Duration,
}

impl MigrationResult {
    /// An empty, successful result
    #[must_use]
    pub fn empty() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub(crate) fn record_failure(&mut self, id: &str, error: impl fmt::Display) {
        self.success = false;
        self.failed.push(id.to_string());
        self.errors.push(error.to_string());
    }
}
