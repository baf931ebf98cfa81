//! Transactional deployment pipeline
//!
//! A [`Deployer`] wraps a [`crate::migration::MigrationRegistry`] and runs
//! pending migrations through validation, optional checks and backup, then
//! applies them, with automatic rollback of whatever the run applied if a
//! later stage fails.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use driftguard::deploy::{Deployer, DeploymentOptions};
//! use driftguard::memory::MemoryStore;
//! use driftguard::migration::{MigrationDefinition, MigrationRegistry};
//!
//! let store = MemoryStore::new();
//! let mut registry = MigrationRegistry::new(Arc::new(store.clone()), Arc::new(store.clone()));
//! registry.register(
//!     MigrationDefinition::new(20240120120000_i64, "create users")
//!         .with_up("CREATE TABLE users (id BIGINT PRIMARY KEY)")
//!         .with_down("DROP TABLE users"),
//! )?;
//!
//! let mut deployer = Deployer::new(registry).with_backup_provider(Arc::new(store));
//! let result = deployer.deploy(&DeploymentOptions::default().with_backup(true));
//! assert!(result.success);
//! assert!(result.backup_location.is_some());
//! # Ok::<(), driftguard::migration::MigrationError>(())
//! ```

mod cancel;
mod checks;
mod deployer;
mod error;
mod events;
mod options;
mod result;

pub use cancel::CancellationToken;
pub use checks::{CheckFailure, CheckStage, DeploymentCheck, FnCheck};
pub use deployer::Deployer;
pub use error::DeployError;
pub use events::DeploymentEvent;
pub use options::DeploymentOptions;
pub use result::{DeploymentOutcome, DeploymentResult, DeploymentStage};
