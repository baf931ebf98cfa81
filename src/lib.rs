//! # Driftguard
//!
//! Versioned schema migrations and a transactional deployment pipeline for
//! PostgreSQL on the `may` runtime.
//!
//! - [`migration`]: migration definitions, dependency validation, the ledger
//!   and the [`migration::MigrationRegistry`] that applies and reverts them.
//! - [`transaction`]: the [`transaction::TransactionCoordinator`] every
//!   mutation runs through.
//! - [`deploy`]: the [`deploy::Deployer`] pipeline (validate, checks,
//!   backup, apply, rollback on failure).
//! - [`query`]: typed predicates compiled to parameterized SQL.
//!
//! Storage is abstracted behind [`executor::Store`]; [`memory::MemoryStore`]
//! is always available and `postgres::PostgresStore` is enabled by the
//! `postgres` feature.

pub mod config;
pub mod connection;
pub mod deploy;
pub mod executor;
pub mod maintenance;
pub mod memory;
pub mod metrics;
pub mod migration;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod query;
pub mod raw_sql;
pub mod transaction;
pub mod value;

pub use config::EngineConfig;
pub use deploy::{Deployer, DeploymentOptions, DeploymentResult};
pub use executor::{BackupProvider, HealthStatus, IsolationLevel, Store, StoreError};
pub use memory::MemoryStore;
pub use migration::{MigrationDefinition, MigrationError, MigrationRegistry};
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
pub use transaction::{TransactionCoordinator, TransactionError};
pub use value::{FromRow, Row, Value};
