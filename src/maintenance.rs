//! Database maintenance dispatch
//!
//! Each [`MaintenanceOperation`] maps to a handler in a [`MaintenanceTable`].
//! Backends contribute handler sets instead of statement templates; an
//! operation with no handler fails with [`StoreError::Unsupported`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::executor::{Backend, Store, StoreError};

/// Post-deployment maintenance operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenanceOperation {
    /// Refresh planner statistics
    Analyze,
    /// Reclaim storage
    Vacuum,
    /// Rebuild indexes
    Reindex,
}

impl fmt::Display for MaintenanceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MaintenanceOperation::Analyze => "analyze",
            MaintenanceOperation::Vacuum => "vacuum",
            MaintenanceOperation::Reindex => "reindex",
        };
        f.write_str(name)
    }
}

/// Handler for one operation: `(store, optional target table) -> rows affected`
pub type MaintenanceHandler =
    Box<dyn Fn(&dyn Store, Option<&str>) -> Result<u64, StoreError> + Send + Sync>;

/// Operation-to-handler dispatch table
#[derive(Default)]
pub struct MaintenanceTable {
    handlers: HashMap<MaintenanceOperation, MaintenanceHandler>,
}

impl MaintenanceTable {
    /// An empty table; every operation is unsupported
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler set for a backend family
    pub fn for_backend(backend: Backend) -> Self {
        match backend {
            Backend::Postgres => Self::postgres(),
            Backend::Memory => Self::memory(),
        }
    }

    fn postgres() -> Self {
        Self::new()
            .with_handler(MaintenanceOperation::Analyze, |store, table| {
                store.execute(&with_target("ANALYZE", table), &[])
            })
            .with_handler(MaintenanceOperation::Vacuum, |store, table| {
                store.execute(&with_target("VACUUM (ANALYZE)", table), &[])
            })
            .with_handler(MaintenanceOperation::Reindex, |store, table| match table {
                Some(table) => store.execute(&format!("REINDEX TABLE {table}"), &[]),
                None => store.execute("REINDEX SCHEMA public", &[]),
            })
    }

    fn memory() -> Self {
        // Nothing to reclaim in memory; statements are logged for inspection
        Self::new()
            .with_handler(MaintenanceOperation::Analyze, |store, table| {
                store.execute(&with_target("ANALYZE", table), &[])
            })
            .with_handler(MaintenanceOperation::Vacuum, |store, table| {
                store.execute(&with_target("VACUUM", table), &[])
            })
    }

    /// Register or replace the handler for `operation`
    #[must_use]
    pub fn with_handler<F>(mut self, operation: MaintenanceOperation, handler: F) -> Self
    where
        F: Fn(&dyn Store, Option<&str>) -> Result<u64, StoreError> + Send + Sync + 'static,
    {
        self.handlers.insert(operation, Box::new(handler));
        self
    }

    pub fn supports(&self, operation: MaintenanceOperation) -> bool {
        self.handlers.contains_key(&operation)
    }

    /// Run one operation, optionally scoped to a table
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unsupported` if no handler is registered, or the
    /// handler's own error.
    pub fn run(
        &self,
        store: &dyn Store,
        operation: MaintenanceOperation,
        table: Option<&str>,
    ) -> Result<u64, StoreError> {
        let handler = self.handlers.get(&operation).ok_or_else(|| {
            StoreError::Unsupported(format!("{operation} is not supported on this backend"))
        })?;
        log::info!("Running maintenance: {operation}");
        handler(store, table)
    }
}

fn with_target(statement: &str, table: Option<&str>) -> String {
    match table {
        Some(table) => format!("{statement} {table}"),
        None => statement.to_string(),
    }
}
