//! Migration registry - enumerates, validates, applies and reverts migrations
//!
//! The in-memory migration map is a cache over the [`MigrationLedger`]. Every
//! public operation starts with [`MigrationRegistry::refresh`], which reloads
//! persisted state and merges code-registered definitions, so the cache never
//! drifts from the ledger between calls.
//!
//! Each apply or rollback runs in its own transaction obtained from the
//! [`TransactionCoordinator`]: the script, the applied-flag update and the
//! history entry commit together or not at all.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::executor::Store;
use crate::transaction::TransactionCoordinator;

use super::definition::{MigrationDefinition, Version};
use super::error::MigrationError;
use super::graph;
use super::ledger::MigrationLedger;
use super::record::{HistoryOperation, MigrationHistoryEntry};
use super::status::{MigrationResult, ValidationReport};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;
#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// What `apply_all` does after a migration fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop at the first failure (default)
    #[default]
    Halt,
    /// Attempt every remaining migration and collect failures
    Continue,
}

/// Actor recorded when none is configured
pub const DEFAULT_ACTOR: &str = "driftguard";

/// Holds migration definitions and drives their application
pub struct MigrationRegistry {
    coordinator: Arc<TransactionCoordinator>,
    ledger: Arc<dyn MigrationLedger>,
    registered: BTreeMap<String, MigrationDefinition>,
    migrations: BTreeMap<String, MigrationDefinition>,
    actor: String,
    failure_policy: FailurePolicy,
    last_applied_at: Option<DateTime<Utc>>,
}

impl MigrationRegistry {
    /// Create a registry with its own coordinator over `store`
    pub fn new(store: Arc<dyn Store>, ledger: Arc<dyn MigrationLedger>) -> Self {
        Self::with_coordinator(Arc::new(TransactionCoordinator::new(store)), ledger)
    }

    /// Create a registry that shares an existing coordinator
    pub fn with_coordinator(
        coordinator: Arc<TransactionCoordinator>,
        ledger: Arc<dyn MigrationLedger>,
    ) -> Self {
        Self {
            coordinator,
            ledger,
            registered: BTreeMap::new(),
            migrations: BTreeMap::new(),
            actor: DEFAULT_ACTOR.to_string(),
            failure_policy: FailurePolicy::default(),
            last_applied_at: None,
        }
    }

    /// Set the actor recorded as `applied_by`
    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    /// The store migrations run against
    pub fn store(&self) -> &dyn Store {
        self.coordinator.store()
    }

    /// Register a migration defined in code
    ///
    /// New definitions are persisted as pending on the next refresh.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateMigration` if the id is already registered, or
    /// `InvalidArgument` if the id is empty.
    pub fn register(&mut self, definition: MigrationDefinition) -> Result<(), MigrationError> {
        if definition.id.trim().is_empty() {
            return Err(MigrationError::InvalidArgument("migration id must not be empty".to_string()));
        }
        if self.registered.contains_key(&definition.id) {
            return Err(MigrationError::DuplicateMigration(definition.id));
        }
        self.registered.insert(definition.id.clone(), definition);
        Ok(())
    }

    /// Reload persisted state and merge code-registered definitions
    ///
    /// Persisted applied state always wins. Pending definitions whose code
    /// changed are re-saved; applied ones take the registered scripts in
    /// memory only, so checksum drift stays detectable.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the ledger cannot be read or written.
    pub fn refresh(&mut self) -> Result<(), MigrationError> {
        let store = self.coordinator.store();
        self.ledger.ensure_schema(store)?;

        let mut migrations: BTreeMap<String, MigrationDefinition> = self
            .ledger
            .load_definitions(store)?
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();

        for (id, registered) in &self.registered {
            match migrations.get_mut(id) {
                None => {
                    let mut pending = registered.clone();
                    pending.mark_reverted();
                    self.ledger.save_definition(store, &pending)?;
                    log::debug!("Registered new migration {id}");
                    migrations.insert(id.clone(), pending);
                }
                Some(existing) if existing.applied => {
                    existing.up_script.clone_from(&registered.up_script);
                    existing.down_script.clone_from(&registered.down_script);
                }
                Some(existing) => {
                    if definition_changed(existing, registered) {
                        let mut updated = registered.clone();
                        updated.mark_reverted();
                        updated.created_at = existing.created_at;
                        self.ledger.save_definition(store, &updated)?;
                        *existing = updated;
                    }
                }
            }
        }

        let newest = migrations.values().filter_map(|d| d.applied_at).max();
        self.last_applied_at = self.last_applied_at.max(newest);
        self.migrations = migrations;
        Ok(())
    }

    /// All known migrations ordered by version
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the refresh fails.
    pub fn list(&mut self) -> Result<Vec<MigrationDefinition>, MigrationError> {
        self.refresh()?;
        Ok(self.sorted(|_| true))
    }

    /// Applied migrations ordered by version
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the refresh fails.
    pub fn applied(&mut self) -> Result<Vec<MigrationDefinition>, MigrationError> {
        self.refresh()?;
        Ok(self.sorted(|d| d.applied))
    }

    /// Pending migrations ordered by version
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the refresh fails.
    pub fn pending(&mut self) -> Result<Vec<MigrationDefinition>, MigrationError> {
        self.refresh()?;
        Ok(self.sorted(|d| !d.applied))
    }

    /// Look up one migration
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids, or `Storage` if the refresh fails.
    pub fn get(&mut self, id: &str) -> Result<MigrationDefinition, MigrationError> {
        self.refresh()?;
        self.cached(id).cloned()
    }

    /// Validate the pending set
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the refresh fails. An invalid graph is reported in
    /// the returned report, not as an error.
    pub fn validate(&mut self) -> Result<ValidationReport, MigrationError> {
        self.refresh()?;
        Ok(self.validate_loaded())
    }

    /// Highest applied version, or [`Version::ZERO`]
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the refresh fails.
    pub fn schema_version(&mut self) -> Result<Version, MigrationError> {
        self.refresh()?;
        Ok(self
            .migrations
            .values()
            .filter(|d| d.applied)
            .map(|d| d.version)
            .max()
            .unwrap_or(Version::ZERO))
    }

    /// Full apply/rollback history, oldest first
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the ledger cannot be read.
    pub fn history(&mut self) -> Result<Vec<MigrationHistoryEntry>, MigrationError> {
        self.refresh()?;
        Ok(self.ledger.history(self.coordinator.store())?)
    }

    /// Author a new pending migration
    ///
    /// The version is the current UTC time as `YYYYMMDDHHMMSS`, bumped until
    /// unique; the id is `<version>_<snake_case_name>`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `name` is blank, or `Storage` if the
    /// definition cannot be persisted.
    pub fn create(&mut self, name: &str, description: &str) -> Result<MigrationDefinition, MigrationError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MigrationError::InvalidArgument("migration name must not be empty".to_string()));
        }
        self.refresh()?;

        let mut version = Version::from_datetime(Utc::now());
        while self.migrations.values().any(|d| d.version == version) {
            version = version.next();
        }
        let definition = MigrationDefinition::new(version, name).with_description(description);
        if self.migrations.contains_key(&definition.id) {
            return Err(MigrationError::DuplicateMigration(definition.id));
        }

        self.ledger.save_definition(self.coordinator.store(), &definition)?;
        log::info!("Created migration {}", definition.id);
        self.migrations.insert(definition.id.clone(), definition.clone());
        Ok(definition)
    }

    /// Apply every pending migration in dependency order
    ///
    /// # Errors
    ///
    /// Returns `Validation` (with nothing applied) if the pending set is
    /// invalid, or `Storage` if the refresh fails. Script failures are
    /// reported in the result.
    pub fn apply_all(&mut self) -> Result<MigrationResult, MigrationError> {
        self.refresh()?;
        let report = self.validate_loaded();
        if !report.is_valid {
            return Err(MigrationError::Validation(Box::new(report)));
        }
        self.apply_ordered(&report.pending)
    }

    /// Apply the given pending migrations, in the given order
    ///
    /// Caller is responsible for having validated the set. Used by
    /// [`apply_all`](Self::apply_all) and the deployer.
    pub(crate) fn apply_ordered(&mut self, ids: &[String]) -> Result<MigrationResult, MigrationError> {
        let started = Instant::now();
        let mut result = MigrationResult::empty();

        for id in ids {
            let definition = self.cached(id)?.clone();
            if definition.applied {
                continue;
            }
            if let Err(e) = self.check_dependencies(&definition) {
                log::error!("Skipping {id}: {e}");
                result.record_failure(id, e);
            } else {
                match self.attempt_apply(&definition) {
                    Ok(()) => result.applied.push(id.clone()),
                    Err(e) => result.record_failure(id, e),
                }
            }
            if !result.success && self.failure_policy == FailurePolicy::Halt {
                log::warn!("Halting after failure of {id}");
                break;
            }
        }

        result.duration = started.elapsed();
        log::info!(
            "Applied {} migration(s), {} failed in {:?}",
            result.applied.len(),
            result.failed.len(),
            result.duration
        );
        Ok(result)
    }

    /// Apply a single migration
    ///
    /// Already-applied migrations are a successful no-op.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids, `UnsatisfiedDependency` if a
    /// dependency is not applied, or `Storage` if the refresh fails. Script
    /// failures are reported in the result.
    pub fn apply_one(&mut self, id: &str) -> Result<MigrationResult, MigrationError> {
        self.refresh()?;
        let started = Instant::now();
        let definition = self.cached(id)?.clone();
        let mut result = MigrationResult::empty();

        if definition.applied {
            log::info!("Migration {id} is already applied");
            return Ok(result);
        }
        self.check_dependencies(&definition)?;

        match self.attempt_apply(&definition) {
            Ok(()) => result.applied.push(definition.id.clone()),
            Err(e) => result.record_failure(id, e),
        }
        result.duration = started.elapsed();
        Ok(result)
    }

    /// Revert the most recently applied migration
    ///
    /// Nothing applied is a successful no-op.
    ///
    /// # Errors
    ///
    /// Returns `IrreversibleMigration` if it has no reverse script, or
    /// `Storage` if the refresh fails.
    pub fn rollback_last(&mut self) -> Result<MigrationResult, MigrationError> {
        self.refresh()?;
        let last = self
            .migrations
            .values()
            .filter(|d| d.applied)
            .max_by(|a, b| a.applied_at.cmp(&b.applied_at).then_with(|| a.version.cmp(&b.version)))
            .cloned();
        match last {
            Some(definition) => self.rollback_sequence(vec![definition]),
            None => {
                log::info!("Nothing to roll back");
                Ok(MigrationResult::empty())
            }
        }
    }

    /// Revert every migration applied after `target_id`, newest first
    ///
    /// The target itself stays applied. Stops at the first failing reverse
    /// script and reports the partial result.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` / `NotApplied` for the target, or
    /// `IrreversibleMigration` (before any mutation) if a migration in the
    /// sequence has no reverse script.
    pub fn rollback_to(&mut self, target_id: &str) -> Result<MigrationResult, MigrationError> {
        self.refresh()?;
        let target = self.cached(target_id)?;
        if !target.applied {
            return Err(MigrationError::NotApplied(target_id.to_string()));
        }
        let cutoff = target.applied_at;
        let sequence: Vec<MigrationDefinition> = self
            .migrations
            .values()
            .filter(|d| d.applied && d.id != target_id && d.applied_at > cutoff)
            .cloned()
            .collect();
        self.rollback_sequence(sequence)
    }

    /// Revert exactly the given applied migrations, newest first
    ///
    /// Used to undo the migrations applied by one deployment run.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` / `NotApplied` for any id, or
    /// `IrreversibleMigration` (before any mutation).
    pub fn rollback_migrations(&mut self, ids: &[String]) -> Result<MigrationResult, MigrationError> {
        self.refresh()?;
        let mut sequence = Vec::with_capacity(ids.len());
        for id in ids {
            let definition = self.cached(id)?;
            if !definition.applied {
                return Err(MigrationError::NotApplied(id.clone()));
            }
            sequence.push(definition.clone());
        }
        self.rollback_sequence(sequence)
    }

    fn rollback_sequence(
        &mut self,
        mut sequence: Vec<MigrationDefinition>,
    ) -> Result<MigrationResult, MigrationError> {
        let started = Instant::now();
        sequence.sort_by(|a, b| {
            b.applied_at
                .cmp(&a.applied_at)
                .then_with(|| b.version.cmp(&a.version))
        });
        if let Some(irreversible) = sequence.iter().find(|d| !d.is_reversible()) {
            return Err(MigrationError::IrreversibleMigration(irreversible.id.clone()));
        }

        let mut result = MigrationResult::empty();
        for definition in &sequence {
            match self.attempt_rollback(definition) {
                Ok(()) => result.rolled_back.push(definition.id.clone()),
                Err(e) => {
                    result.record_failure(&definition.id, e);
                    log::error!(
                        "Rollback aborted at {}; {} migration(s) left applied",
                        definition.id,
                        sequence.len() - result.rolled_back.len()
                    );
                    break;
                }
            }
        }
        result.duration = started.elapsed();
        Ok(result)
    }

    fn attempt_apply(&mut self, definition: &MigrationDefinition) -> Result<(), MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::migration_span(&definition.id, "apply").entered();

        let started = Instant::now();
        let at = self.next_applied_at();
        let ledger = &self.ledger;
        let actor = self.actor.as_str();

        let outcome = self.coordinator.execute_in_transaction(|store| {
            if definition.up_script.trim().is_empty() {
                log::warn!("Migration {} has an empty forward script", definition.id);
            } else {
                store.execute(&definition.up_script, &[]).map_err(|e| {
                    log::error!("Migration {} failed: {e}", definition.id);
                    e
                })?;
            }
            ledger.mark_applied(store, &definition.id, at, actor)?;
            let mut entry = MigrationHistoryEntry::succeeded(
                &definition.id,
                &definition.name,
                HistoryOperation::Apply,
                actor,
                elapsed_ms(started),
            );
            entry.applied_at = at;
            ledger.append_history(store, &entry)?;
            Ok::<(), MigrationError>(())
        });

        match outcome {
            Ok(()) => {
                if let Some(cached) = self.migrations.get_mut(&definition.id) {
                    cached.mark_applied(at, &self.actor);
                }
                #[cfg(feature = "metrics")]
                METRICS.record_migration_applied();
                log::info!("Applied migration {} ({}ms)", definition.id, elapsed_ms(started));
                Ok(())
            }
            Err(e) => {
                #[cfg(feature = "metrics")]
                METRICS.record_migration_failed();
                Err(self.record_failed_attempt(definition, HistoryOperation::Apply, started, e))
            }
        }
    }

    fn attempt_rollback(&mut self, definition: &MigrationDefinition) -> Result<(), MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::migration_span(&definition.id, "rollback").entered();

        let started = Instant::now();
        let ledger = &self.ledger;
        let actor = self.actor.as_str();

        let outcome = self.coordinator.execute_in_transaction(|store| {
            store.execute(&definition.down_script, &[]).map_err(|e| {
                log::error!("Rollback of {} failed: {e}", definition.id);
                e
            })?;
            ledger.mark_reverted(store, &definition.id)?;
            ledger.append_history(
                store,
                &MigrationHistoryEntry::succeeded(
                    &definition.id,
                    &definition.name,
                    HistoryOperation::Rollback,
                    actor,
                    elapsed_ms(started),
                ),
            )?;
            Ok::<(), MigrationError>(())
        });

        match outcome {
            Ok(()) => {
                if let Some(cached) = self.migrations.get_mut(&definition.id) {
                    cached.mark_reverted();
                }
                #[cfg(feature = "metrics")]
                METRICS.record_migration_rolled_back();
                log::info!("Rolled back migration {} ({}ms)", definition.id, elapsed_ms(started));
                Ok(())
            }
            Err(e) => Err(self.record_failed_attempt(definition, HistoryOperation::Rollback, started, e)),
        }
    }

    /// Append a failed history entry outside the (already rolled back)
    /// transaction and wrap the cause as `ExecutionFailed`
    fn record_failed_attempt(
        &self,
        definition: &MigrationDefinition,
        operation: HistoryOperation,
        started: Instant,
        cause: MigrationError,
    ) -> MigrationError {
        let entry = MigrationHistoryEntry::failed(
            &definition.id,
            &definition.name,
            operation,
            &self.actor,
            elapsed_ms(started),
            cause.to_string(),
        );
        if let Err(e) = self.ledger.append_history(self.coordinator.store(), &entry) {
            log::error!("Failed to record history for {}: {e}", definition.id);
        }
        MigrationError::ExecutionFailed {
            id: definition.id.clone(),
            operation: operation.as_str(),
            error: cause.to_string(),
        }
    }

    fn check_dependencies(&self, definition: &MigrationDefinition) -> Result<(), MigrationError> {
        for dependency in &definition.dependencies {
            let satisfied = self.migrations.get(dependency).is_some_and(|d| d.applied);
            if !satisfied {
                return Err(MigrationError::UnsatisfiedDependency {
                    id: definition.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn validate_loaded(&self) -> ValidationReport {
        let report = graph::validate(&self.migrations);
        for warning in &report.warnings {
            log::warn!("Migration validation warning: {warning}");
        }
        for error in &report.errors {
            log::error!("Migration validation error: {error}");
        }
        report
    }

    pub(crate) fn current_version(&self) -> Version {
        self.migrations
            .values()
            .filter(|d| d.applied)
            .map(|d| d.version)
            .max()
            .unwrap_or(Version::ZERO)
    }

    fn cached(&self, id: &str) -> Result<&MigrationDefinition, MigrationError> {
        self.migrations
            .get(id)
            .ok_or_else(|| MigrationError::NotFound(id.to_string()))
    }

    fn sorted(&self, keep: impl Fn(&MigrationDefinition) -> bool) -> Vec<MigrationDefinition> {
        let mut defs: Vec<MigrationDefinition> =
            self.migrations.values().filter(|d| keep(d)).cloned().collect();
        defs.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.id.cmp(&b.id)));
        defs
    }

    /// Strictly increasing apply timestamps, so "last applied" is total
    fn next_applied_at(&mut self) -> DateTime<Utc> {
        let mut at = Utc::now();
        if let Some(last) = self.last_applied_at {
            if at <= last {
                at = last + ChronoDuration::microseconds(1);
            }
        }
        self.last_applied_at = Some(at);
        at
    }
}

fn definition_changed(stored: &MigrationDefinition, registered: &MigrationDefinition) -> bool {
    stored.name != registered.name
        || stored.description != registered.description
        || stored.up_script != registered.up_script
        || stored.down_script != registered.down_script
        || stored.dependencies != registered.dependencies
        || stored.metadata != registered.metadata
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn registry() -> (Arc<MemoryStore>, MigrationRegistry) {
        let store = Arc::new(MemoryStore::new());
        let registry = MigrationRegistry::new(store.clone(), store.clone()).with_actor("test");
        (store, registry)
    }

    fn migration(id: &str, version: i64) -> MigrationDefinition {
        MigrationDefinition::new(version, id)
            .with_id(id)
            .with_up(format!("CREATE TABLE {id} (id INT)"))
            .with_down(format!("DROP TABLE {id}"))
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let (_, mut registry) = registry();
        registry.register(migration("a", 1)).unwrap();
        assert!(matches!(
            registry.register(migration("a", 2)),
            Err(MigrationError::DuplicateMigration(id)) if id == "a"
        ));
    }

    #[test]
    fn test_refresh_persists_registered_definitions_as_pending() {
        let (store, mut registry) = registry();
        registry.register(migration("a", 1)).unwrap();
        registry.refresh().unwrap();
        let persisted = store.load_definitions(store.as_ref()).unwrap();
        assert_eq!(persisted.len(), 1);
        assert!(!persisted[0].applied);
    }

    #[test]
    fn test_apply_one_records_history_and_state() {
        let (store, mut registry) = registry();
        registry.register(migration("a", 1)).unwrap();
        let result = registry.apply_one("a").unwrap();
        assert!(result.success);
        assert_eq!(result.applied, vec!["a"]);

        let persisted = store.load_definitions(store.as_ref()).unwrap();
        assert!(persisted[0].applied);
        assert_eq!(persisted[0].applied_by.as_deref(), Some("test"));

        let history = registry.history().unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
        assert_eq!(history[0].operation, HistoryOperation::Apply);
    }

    #[test]
    fn test_apply_one_is_idempotent() {
        let (store, mut registry) = registry();
        registry.register(migration("a", 1)).unwrap();
        registry.apply_one("a").unwrap();
        let statements = store.executed_statements().len();

        let again = registry.apply_one("a").unwrap();
        assert!(again.success);
        assert!(again.applied.is_empty());
        assert_eq!(store.executed_statements().len(), statements);
        assert_eq!(registry.history().unwrap().len(), 1);
    }

    #[test]
    fn test_apply_one_preconditions_have_no_side_effects() {
        let (store, mut registry) = registry();
        registry.register(migration("a", 1)).unwrap();
        registry.register(migration("b", 2).depends_on("a")).unwrap();

        assert!(matches!(registry.apply_one("zzz"), Err(MigrationError::NotFound(_))));
        assert!(matches!(
            registry.apply_one("b"),
            Err(MigrationError::UnsatisfiedDependency { dependency, .. }) if dependency == "a"
        ));
        assert!(store.executed_statements().is_empty());
        assert!(registry.history().unwrap().is_empty());
    }

    #[test]
    fn test_failed_apply_rolls_back_and_records_failure() {
        let (store, mut registry) = registry();
        registry.register(migration("a", 1)).unwrap();
        store.fail_on("CREATE TABLE a");

        let result = registry.apply_one("a").unwrap();
        assert!(!result.success);
        assert_eq!(result.failed, vec!["a"]);
        assert!(result.errors[0].contains("apply"));
        assert_eq!(registry.schema_version().unwrap(), Version::ZERO);

        let history = registry.history().unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
        assert!(history[0].error.as_deref().unwrap().contains("injected failure"));
    }

    #[test]
    fn test_halt_policy_stops_at_first_failure() {
        let (store, mut registry) = registry();
        for (id, v) in [("a", 1), ("b", 2), ("c", 3)] {
            registry.register(migration(id, v)).unwrap();
        }
        store.fail_on("CREATE TABLE b");

        let result = registry.apply_all().unwrap();
        assert_eq!(result.applied, vec!["a"]);
        assert_eq!(result.failed, vec!["b"]);
        assert_eq!(registry.pending().unwrap().len(), 2);
    }

    #[test]
    fn test_continue_policy_attempts_every_migration() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = MigrationRegistry::new(store.clone(), store.clone())
            .with_failure_policy(FailurePolicy::Continue);
        registry.register(migration("a", 1)).unwrap();
        registry.register(migration("b", 2)).unwrap();
        registry.register(migration("c", 3).depends_on("b")).unwrap();
        registry.register(migration("d", 4)).unwrap();
        store.fail_on("CREATE TABLE b");

        let result = registry.apply_all().unwrap();
        assert!(!result.success);
        assert_eq!(result.applied, vec!["a", "d"]);
        assert_eq!(result.failed, vec!["b", "c"]);
    }

    #[test]
    fn test_apply_all_rejects_invalid_graph_without_mutation() {
        let (store, mut registry) = registry();
        registry.register(migration("a", 1).depends_on("b")).unwrap();
        registry.register(migration("b", 2).depends_on("a")).unwrap();

        match registry.apply_all() {
            Err(MigrationError::Validation(report)) => assert!(!report.is_valid),
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(store.executed_statements().is_empty());
    }

    #[test]
    fn test_rollback_to_reverts_later_migrations_newest_first() {
        let (store, mut registry) = registry();
        for (id, v) in [("a", 1), ("b", 2), ("c", 3)] {
            registry.register(migration(id, v)).unwrap();
        }
        registry.apply_all().unwrap();

        let result = registry.rollback_to("a").unwrap();
        assert!(result.success);
        assert_eq!(result.rolled_back, vec!["c", "b"]);
        assert_eq!(registry.schema_version().unwrap(), Version(1));

        let statements = store.executed_statements();
        let tail: Vec<&str> = statements.iter().rev().take(2).map(String::as_str).collect();
        assert_eq!(tail, vec!["DROP TABLE b", "DROP TABLE c"]);

        let history = registry.history().unwrap();
        assert_eq!(history.iter().filter(|h| h.operation == HistoryOperation::Rollback).count(), 2);
    }

    #[test]
    fn test_rollback_to_requires_applied_target() {
        let (_, mut registry) = registry();
        registry.register(migration("a", 1)).unwrap();
        assert!(matches!(registry.rollback_to("a"), Err(MigrationError::NotApplied(_))));
        assert!(matches!(registry.rollback_to("nope"), Err(MigrationError::NotFound(_))));
    }

    #[test]
    fn test_rollback_aborts_on_first_failure() {
        let (store, mut registry) = registry();
        for (id, v) in [("a", 1), ("b", 2), ("c", 3)] {
            registry.register(migration(id, v)).unwrap();
        }
        registry.apply_all().unwrap();
        store.fail_on("DROP TABLE c");

        let result = registry.rollback_to("a").unwrap();
        assert!(!result.success);
        assert!(result.rolled_back.is_empty());
        assert_eq!(result.failed, vec!["c"]);
        assert_eq!(registry.applied().unwrap().len(), 3);
    }

    #[test]
    fn test_irreversible_migration_blocks_rollback_up_front() {
        let (store, mut registry) = registry();
        registry.register(migration("a", 1)).unwrap();
        registry
            .register(MigrationDefinition::new(2, "b").with_id("b").with_up("CREATE TABLE b (id INT)"))
            .unwrap();
        registry.apply_all().unwrap();
        let before = store.executed_statements().len();

        assert!(matches!(
            registry.rollback_last(),
            Err(MigrationError::IrreversibleMigration(id)) if id == "b"
        ));
        assert_eq!(store.executed_statements().len(), before);
    }

    #[test]
    fn test_rollback_last_with_nothing_applied_is_noop() {
        let (_, mut registry) = registry();
        let result = registry.rollback_last().unwrap();
        assert!(result.success && result.rolled_back.is_empty());
    }

    #[test]
    fn test_create_assigns_unique_timestamp_versions() {
        let (_, mut registry) = registry();
        let first = registry.create("Add users", "users table").unwrap();
        let second = registry.create("Add users", "again").unwrap();
        assert_ne!(first.version, second.version);
        assert!(first.id.ends_with("_add_users"));
        assert!(!first.applied);
        assert_eq!(registry.pending().unwrap().len(), 2);
    }

    #[test]
    fn test_create_rejects_blank_name() {
        let (_, mut registry) = registry();
        assert!(matches!(registry.create("  ", ""), Err(MigrationError::InvalidArgument(_))));
    }

    #[test]
    fn test_applied_timestamps_strictly_increase() {
        let (_, mut registry) = registry();
        for (id, v) in [("a", 1), ("b", 2), ("c", 3)] {
            registry.register(migration(id, v)).unwrap();
        }
        registry.apply_all().unwrap();
        let applied = registry.applied().unwrap();
        assert!(applied[0].applied_at < applied[1].applied_at);
        assert!(applied[1].applied_at < applied[2].applied_at);
    }

    #[test]
    fn test_checksum_drift_surfaces_as_warning() {
        let store = Arc::new(MemoryStore::new());
        let mut first = MigrationRegistry::new(store.clone(), store.clone());
        first.register(migration("a", 1)).unwrap();
        first.apply_all().unwrap();

        let mut second = MigrationRegistry::new(store.clone(), store.clone());
        second
            .register(migration("a", 1).with_up("CREATE TABLE a (id BIGINT)"))
            .unwrap();
        let report = second.validate().unwrap();
        assert!(report.is_valid);
        assert!(report.warnings.iter().any(|w| w.field == "checksum"));
    }
}
