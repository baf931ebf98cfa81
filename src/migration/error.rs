//! Migration-specific error types

use crate::executor::StoreError;
use crate::transaction::TransactionError;

use super::status::ValidationReport;

/// Migration-specific errors
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Storage collaborator failure
    #[error("Database error: {0}")]
    Storage(#[from] StoreError),
    /// Coordinator misuse or transaction failure
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    /// The dependency graph or version set is invalid
    #[error("Migration validation failed: {}", .0.errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Validation(Box<ValidationReport>),
    /// No migration with this id is known
    #[error("Migration '{0}' not found")]
    NotFound(String),
    /// A dependency of the migration has not been applied
    #[error("Migration '{id}' depends on '{dependency}', which has not been applied")]
    UnsatisfiedDependency { id: String, dependency: String },
    /// The migration is already applied
    #[error("Migration '{0}' has already been applied")]
    AlreadyApplied(String),
    /// The migration is not currently applied
    #[error("Migration '{0}' is not applied")]
    NotApplied(String),
    /// Two definitions share an id
    #[error("Migration '{0}' is already registered")]
    DuplicateMigration(String),
    /// The migration has no reverse script
    #[error("Migration '{0}' has no rollback script and cannot be reverted")]
    IrreversibleMigration(String),
    /// A script failed while applying or reverting
    #[error("Migration '{id}' failed during {operation}: {error}")]
    ExecutionFailed {
        id: String,
        operation: &'static str,
        error: String,
    },
    /// Caller passed an invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// Registry state lock was poisoned
    #[error("Registry state unavailable: {0}")]
    StatePoisoned(String),
}

impl MigrationError {
    /// Whether this error only signals an idempotent no-op
    ///
    /// `AlreadyApplied` / `NotApplied` are returned so callers can tell, but
    /// re-invoking an operation that produced them is harmless.
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            MigrationError::AlreadyApplied(_) | MigrationError::NotApplied(_)
        )
    }
}
