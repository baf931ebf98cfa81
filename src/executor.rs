//! Storage capability consumed by the migration engine.
//!
//! The engine never talks to a driver directly. Everything it needs from the
//! database (running statements, running queries, opening transactions, probing
//! health) goes through the [`Store`] trait, so the same registry, coordinator
//! and deployer run against PostgreSQL ([`crate::postgres::PostgresStore`]) or
//! the in-memory backend ([`crate::memory::MemoryStore`]).

use crate::value::{DecodeError, Row, Value};
use std::time::Duration;

/// Error raised by a storage backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached or the connection is broken
    #[error("Connection error: {0}")]
    Connection(String),
    /// A statement failed; the SQL is kept for diagnostics
    #[error("Statement failed: {message} (sql: {sql})")]
    Statement { sql: String, message: String },
    /// A result row could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),
    /// The backend does not support the requested operation
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    /// Begin/commit/rollback issued in the wrong state
    #[error("Transaction state error: {0}")]
    TransactionState(String),
}

impl StoreError {
    /// Build a [`StoreError::Statement`] with a compacted copy of the SQL
    pub fn statement(sql: &str, message: impl Into<String>) -> Self {
        StoreError::Statement {
            sql: compact_sql(sql),
            message: message.into(),
        }
    }
}

impl From<DecodeError> for StoreError {
    fn from(err: DecodeError) -> Self {
        StoreError::Decode(err.to_string())
    }
}

/// Collapse whitespace so multi-line statements log on a single line
pub(crate) fn compact_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Read uncommitted (PostgreSQL treats this as ReadCommitted)
    ReadUncommitted,
    /// Read committed (default)
    #[default]
    ReadCommitted,
    /// Repeatable read
    RepeatableRead,
    /// Serializable
    Serializable,
}

impl IsolationLevel {
    /// SQL syntax for `SET TRANSACTION ISOLATION LEVEL`
    #[must_use]
    pub fn to_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Which family of backend a [`Store`] talks to
///
/// Used to pick backend-specific handlers (see [`crate::maintenance`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Postgres,
    Memory,
}

/// Result of a connectivity probe
#[derive(Debug, Clone, PartialEq)]
pub struct HealthStatus {
    /// Whether the backend answered the probe
    pub healthy: bool,
    /// Round-trip time of the probe
    pub response_time: Duration,
    /// Failure description when unhealthy
    pub error_message: Option<String>,
}

impl HealthStatus {
    /// A healthy probe result
    #[must_use]
    pub fn healthy(response_time: Duration) -> Self {
        Self {
            healthy: true,
            response_time,
            error_message: None,
        }
    }

    /// An unhealthy probe result
    #[must_use]
    pub fn unhealthy(response_time: Duration, message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            response_time,
            error_message: Some(message.into()),
        }
    }
}

/// An open unit of work on a backend
///
/// Consumed by `commit` or `rollback`, so a handle can be closed exactly once.
pub trait TransactionHandle: Send {
    /// Make all statements issued since `begin` durable
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend rejects the commit.
    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discard all statements issued since `begin`
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend rejects the rollback.
    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Trait for executing database operations
///
/// Statements issued while a [`TransactionHandle`] returned by [`Store::begin`]
/// is open belong to that transaction.
pub trait Store: Send + Sync {
    /// Execute a statement and return the number of rows affected
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the statement fails.
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, StoreError>;

    /// Run a query and return every row
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the query fails or a row cannot be decoded.
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError>;

    /// Open a transaction with the given isolation level
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the transaction cannot be started.
    fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn TransactionHandle>, StoreError>;

    /// Probe connectivity
    fn health_check(&self) -> HealthStatus;

    /// Backend family
    fn backend(&self) -> Backend;
}

/// Point-in-time backup capability
///
/// Implemented by whatever owns backups for a deployment target (a dump tool,
/// a snapshot API, the in-memory backend).
pub trait BackupProvider: Send + Sync {
    /// Create a backup and return where it was written
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backup could not be taken.
    fn create_backup(&self, label: &str) -> Result<String, StoreError>;
}
