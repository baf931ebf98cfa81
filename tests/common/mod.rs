//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::sync::Arc;

use driftguard::memory::MemoryStore;
use driftguard::migration::{MigrationDefinition, MigrationRegistry};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Reversible migration creating table `id`
pub fn table_migration(version: i64, id: &str) -> MigrationDefinition {
    MigrationDefinition::new(version, id)
        .with_id(id)
        .with_up(format!("CREATE TABLE {id} (id BIGINT PRIMARY KEY)"))
        .with_down(format!("DROP TABLE {id}"))
}

/// Registry over `store`, which also serves as the ledger
pub fn registry(store: &MemoryStore) -> MigrationRegistry {
    MigrationRegistry::new(Arc::new(store.clone()), Arc::new(store.clone()))
}

/// `a` <- `b` <- `c`
pub fn chain() -> Vec<MigrationDefinition> {
    vec![
        table_migration(20_240_101_000_000, "a"),
        table_migration(20_240_102_000_000, "b").depends_on("a"),
        table_migration(20_240_103_000_000, "c").depends_on("b"),
    ]
}
