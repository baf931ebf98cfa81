//! Pre- and post-deployment checks
//!
//! The built-in checks probe connectivity and the schema version. Callers
//! add their own through [`DeploymentCheck`]; those run after the built-ins
//! of the same stage.

use serde::Serialize;
use std::fmt;

use crate::executor::Store;
use crate::migration::MigrationRegistry;
use crate::raw_sql;

/// When a check runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStage {
    Pre,
    Post,
}

/// A failed check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{check}: {message}")]
pub struct CheckFailure {
    pub check: String,
    pub message: String,
}

impl CheckFailure {
    pub fn new(check: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            check: check.into(),
            message: message.into(),
        }
    }
}

/// A caller-supplied deployment check
pub trait DeploymentCheck: Send + Sync {
    /// Name used in failure reports
    fn name(&self) -> &str;

    fn stage(&self) -> CheckStage;

    /// # Errors
    ///
    /// Returns a description of what is wrong.
    fn run(&self, store: &dyn Store) -> Result<(), String>;
}

/// [`DeploymentCheck`] from a closure
pub struct FnCheck<F> {
    name: String,
    stage: CheckStage,
    check: F,
}

impl<F> FnCheck<F>
where
    F: Fn(&dyn Store) -> Result<(), String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, stage: CheckStage, check: F) -> Self {
        Self {
            name: name.into(),
            stage,
            check,
        }
    }
}

impl<F> fmt::Debug for FnCheck<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCheck")
            .field("name", &self.name)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

impl<F> DeploymentCheck for FnCheck<F>
where
    F: Fn(&dyn Store) -> Result<(), String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn stage(&self) -> CheckStage {
        self.stage
    }

    fn run(&self, store: &dyn Store) -> Result<(), String> {
        (self.check)(store)
    }
}

fn connectivity(store: &dyn Store) -> Option<CheckFailure> {
    let status = store.health_check();
    if status.healthy {
        log::debug!("Connectivity probe answered in {:?}", status.response_time);
        None
    } else {
        Some(CheckFailure::new(
            "connectivity",
            status
                .error_message
                .unwrap_or_else(|| "store did not answer the health probe".to_string()),
        ))
    }
}

fn schema_version(registry: &mut MigrationRegistry) -> Option<CheckFailure> {
    match registry.schema_version() {
        Ok(version) => {
            log::debug!("Current schema version {version}");
            None
        }
        Err(e) => Some(CheckFailure::new("schema_version", e.to_string())),
    }
}

/// Connectivity, schema version and a non-empty migration list
pub(crate) fn pre_deployment(registry: &mut MigrationRegistry) -> Vec<CheckFailure> {
    let mut failures = Vec::new();
    failures.extend(connectivity(registry.store()));
    failures.extend(schema_version(registry));
    match registry.list() {
        Ok(list) if list.is_empty() => {
            failures.push(CheckFailure::new("migrations", "no migrations are registered"));
        }
        Ok(_) => {}
        Err(e) => failures.push(CheckFailure::new("migrations", e.to_string())),
    }
    failures
}

/// Connectivity, schema version and a read-only round trip
pub(crate) fn post_deployment(registry: &mut MigrationRegistry) -> Vec<CheckFailure> {
    let mut failures = Vec::new();
    failures.extend(connectivity(registry.store()));
    failures.extend(schema_version(registry));
    if let Err(e) = raw_sql::query_value::<i64>(registry.store(), "SELECT 1", &[]) {
        failures.push(CheckFailure::new("read_only_query", e.to_string()));
    }
    failures
}

/// Run the caller's checks registered for `stage`
pub(crate) fn run_custom(
    checks: &[Box<dyn DeploymentCheck>],
    stage: CheckStage,
    store: &dyn Store,
) -> Vec<CheckFailure> {
    checks
        .iter()
        .filter(|check| check.stage() == stage)
        .filter_map(|check| {
            check
                .run(store)
                .err()
                .map(|message| CheckFailure::new(check.name(), message))
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::migration::MigrationDefinition;
    use std::sync::Arc;

    fn registry(store: &MemoryStore) -> MigrationRegistry {
        MigrationRegistry::new(Arc::new(store.clone()), Arc::new(store.clone()))
    }

    #[test]
    fn test_pre_checks_flag_empty_migration_list() {
        let store = MemoryStore::new();
        let failures = pre_deployment(&mut registry(&store));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].check, "migrations");
    }

    #[test]
    fn test_pre_checks_pass_with_registered_migration() {
        let store = MemoryStore::new();
        let mut registry = registry(&store);
        registry
            .register(MigrationDefinition::new(1, "a").with_up("CREATE TABLE a (id INT)"))
            .unwrap();
        assert!(pre_deployment(&mut registry).is_empty());
    }

    #[test]
    fn test_post_checks_report_unhealthy_store() {
        let store = MemoryStore::new();
        let mut registry = registry(&store);
        store.set_healthy(false);
        let failures = post_deployment(&mut registry);
        assert!(failures.iter().any(|f| f.check == "connectivity"));
        assert!(failures.iter().any(|f| f.check == "read_only_query"));
    }

    #[test]
    fn test_custom_checks_filtered_by_stage() {
        let store = MemoryStore::new();
        let checks: Vec<Box<dyn DeploymentCheck>> = vec![
            Box::new(FnCheck::new("always_fails", CheckStage::Post, |_: &dyn Store| {
                Err("nope".to_string())
            })),
            Box::new(FnCheck::new("pre_ok", CheckStage::Pre, |_: &dyn Store| Ok(()))),
        ];
        assert!(run_custom(&checks, CheckStage::Pre, &store).is_empty());
        let post = run_custom(&checks, CheckStage::Post, &store);
        assert_eq!(post, vec![CheckFailure::new("always_fails", "nope")]);
    }
}
