//! `MigrationHistoryEntry` - rows of the append-only history table

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which direction a history entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryOperation {
    Apply,
    Rollback,
}

impl HistoryOperation {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryOperation::Apply => "apply",
            HistoryOperation::Rollback => "rollback",
        }
    }
}

impl fmt::Display for HistoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HistoryOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "apply" => Ok(HistoryOperation::Apply),
            "rollback" => Ok(HistoryOperation::Rollback),
            other => Err(format!("unknown history operation '{other}'")),
        }
    }
}

/// Immutable audit record of one apply or rollback attempt
///
/// Created once per attempt (successful or not) and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationHistoryEntry {
    /// Auto-incremented id assigned by the ledger (`None` before insertion)
    pub id: Option<i64>,
    /// Migration id
    pub migration_id: String,
    /// Migration name at the time of the attempt
    pub migration_name: String,
    /// Apply or rollback
    pub operation: HistoryOperation,
    /// When the attempt finished
    pub applied_at: DateTime<Utc>,
    /// Actor that ran the attempt
    pub applied_by: String,
    /// Execution time in milliseconds
    pub duration_ms: i64,
    /// Whether the attempt completed successfully
    pub success: bool,
    /// Error text for failed attempts
    pub error: Option<String>,
}

impl MigrationHistoryEntry {
    /// Record of a successful attempt
    #[must_use]
    pub fn succeeded(
        migration_id: &str,
        migration_name: &str,
        operation: HistoryOperation,
        applied_by: &str,
        duration_ms: i64,
    ) -> Self {
        Self {
            id: None,
            migration_id: migration_id.to_string(),
            migration_name: migration_name.to_string(),
            operation,
            applied_at: Utc::now(),
            applied_by: applied_by.to_string(),
            duration_ms,
            success: true,
            error: None,
        }
    }

    /// Record of a failed attempt
    #[must_use]
    pub fn failed(
        migration_id: &str,
        migration_name: &str,
        operation: HistoryOperation,
        applied_by: &str,
        duration_ms: i64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::succeeded(migration_id, migration_name, operation, applied_by, duration_ms)
        }
    }
}
