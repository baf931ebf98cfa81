//! Migration system
//!
//! This module tracks versioned, ordered schema changes and applies or reverts
//! them safely:
//! - [`MigrationDefinition`] - one migration with forward/reverse scripts
//! - [`MigrationRegistry`] - enumeration, validation, apply and rollback
//! - [`MigrationLedger`] / [`SqlLedger`] - persisted definitions and history
//! - [`graph`] - cycle detection and dependency ordering
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use driftguard::memory::MemoryStore;
//! use driftguard::migration::{MigrationDefinition, MigrationRegistry};
//!
//! # fn main() -> Result<(), driftguard::migration::MigrationError> {
//! let store = Arc::new(MemoryStore::new());
//! let mut registry = MigrationRegistry::new(store.clone(), store);
//!
//! registry.register(
//!     MigrationDefinition::new(20240120120000_i64, "create users")
//!         .with_up("CREATE TABLE users (id BIGSERIAL PRIMARY KEY)")
//!         .with_down("DROP TABLE users"),
//! )?;
//!
//! let result = registry.apply_all()?;
//! assert_eq!(result.applied, vec!["20240120120000_create_users"]);
//! # Ok(())
//! # }
//! ```

pub mod checksum;
pub mod definition;
pub mod error;
pub mod graph;
pub mod ledger;
pub mod record;
pub mod registry;
pub mod state_table;
pub mod status;

pub use checksum::calculate_checksum;
pub use definition::{MigrationDefinition, Version, CHECKSUM_KEY};
pub use error::MigrationError;
pub use ledger::{MigrationLedger, SqlLedger};
pub use record::{HistoryOperation, MigrationHistoryEntry};
pub use registry::{FailurePolicy, MigrationRegistry, DEFAULT_ACTOR};
pub use state_table::LedgerTables;
pub use status::{MigrationResult, ValidationIssue, ValidationReport};
