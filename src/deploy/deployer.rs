//! Deployment orchestrator
//!
//! Runs validate, pre-checks, backup, apply, post-checks, maintenance and
//! finalize in order, stopping at the first failing stage. Once anything has
//! been applied, a later failure triggers the automatic rollback (when
//! enabled) and its outcome is recorded next to the original failure.

use chrono::Utc;
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::time::Instant;

use crate::executor::BackupProvider;
use crate::maintenance::MaintenanceTable;
use crate::migration::{MigrationError, MigrationRegistry, MigrationResult};

use super::cancel::{CancellationToken, Checkpoint};
use super::checks::{self, CheckStage, DeploymentCheck};
use super::error::DeployError;
use super::events::DeploymentEvent;
use super::options::DeploymentOptions;
use super::result::{DeploymentResult, DeploymentStage};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;
#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

type StageFailure = (DeploymentStage, DeployError);

/// Drives deployments against one [`MigrationRegistry`]
pub struct Deployer {
    registry: MigrationRegistry,
    backup_provider: Option<Arc<dyn BackupProvider>>,
    checks: Vec<Box<dyn DeploymentCheck>>,
    events: Option<Sender<DeploymentEvent>>,
    maintenance: MaintenanceTable,
    cancellation: CancellationToken,
}

impl Deployer {
    /// Create a deployer; maintenance handlers follow the registry's backend
    pub fn new(registry: MigrationRegistry) -> Self {
        let maintenance = MaintenanceTable::for_backend(registry.store().backend());
        Self {
            registry,
            backup_provider: None,
            checks: Vec::new(),
            events: None,
            maintenance,
            cancellation: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_backup_provider(mut self, provider: Arc<dyn BackupProvider>) -> Self {
        self.backup_provider = Some(provider);
        self
    }

    #[must_use]
    pub fn with_check(mut self, check: impl DeploymentCheck + 'static) -> Self {
        self.checks.push(Box::new(check));
        self
    }

    /// Publish stage progress on `sender`
    #[must_use]
    pub fn with_events(mut self, sender: Sender<DeploymentEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    #[must_use]
    pub fn with_maintenance_table(mut self, table: MaintenanceTable) -> Self {
        self.maintenance = table;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Token that cancels this deployer's runs at the next stage boundary
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut MigrationRegistry {
        &mut self.registry
    }

    pub fn into_registry(self) -> MigrationRegistry {
        self.registry
    }

    /// Deploy every pending migration
    pub fn deploy(&mut self, options: &DeploymentOptions) -> DeploymentResult {
        self.run(options, None)
    }

    /// Deploy a single migration
    ///
    /// Pre-deployment checks are skipped; backup, post-checks and automatic
    /// rollback behave as in [`deploy`](Self::deploy).
    pub fn deploy_one(&mut self, id: &str, options: &DeploymentOptions) -> DeploymentResult {
        self.run(options, Some(id))
    }

    fn run(&mut self, options: &DeploymentOptions, target: Option<&str>) -> DeploymentResult {
        let mut result = DeploymentResult::start();
        let deployment_id = result.deployment_id;

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::deployment_span(&deployment_id.to_string()).entered();

        match target {
            Some(id) => log::info!("Deployment {deployment_id} started for {id}"),
            None => log::info!("Deployment {deployment_id} started"),
        }
        let started = Instant::now();
        let checkpoint = Checkpoint::new(self.cancellation.clone(), options.timeout());

        if let Err((stage, error)) = self.pipeline(options, target, &checkpoint, &mut result) {
            self.fail(options, &mut result, stage, &error);
        }

        result.finished_at = Utc::now();
        result.duration = started.elapsed();

        #[cfg(feature = "metrics")]
        METRICS.record_deployment(result.duration);

        if result.success {
            log::info!(
                "Deployment {deployment_id} finished in {:?}: {}",
                result.duration,
                result.message
            );
        } else {
            log::error!(
                "Deployment {deployment_id} failed after {:?}: {}",
                result.duration,
                result.message
            );
        }
        self.emit(DeploymentEvent::Finished {
            deployment_id,
            success: result.success,
            outcome: result.outcome(),
        });
        result
    }

    fn pipeline(
        &mut self,
        options: &DeploymentOptions,
        target: Option<&str>,
        checkpoint: &Checkpoint,
        result: &mut DeploymentResult,
    ) -> Result<(), StageFailure> {
        let plan = self.stage(DeploymentStage::Validate, checkpoint, result, |this, result| {
            this.validate(target, result)
        })?;
        if plan.is_empty() {
            result.success = true;
            if result.message.is_empty() {
                result.message = "Schema is up to date".to_string();
            }
            result.final_schema_version = self.registry.schema_version().ok();
            return Ok(());
        }

        if target.is_none() && options.run_pre_checks {
            self.stage(DeploymentStage::PreChecks, checkpoint, result, |this, _| {
                this.run_checks(CheckStage::Pre)
            })?;
        }

        if options.create_backup {
            self.stage(DeploymentStage::Backup, checkpoint, result, |this, result| {
                this.backup(result)
            })?;
        }

        self.stage(DeploymentStage::Apply, checkpoint, result, |this, result| {
            let run = this.registry.apply_ordered(&plan)?;
            result.applied_migrations.clone_from(&run.applied);
            result.failed_migrations.clone_from(&run.failed);
            result.errors.extend(run.errors.iter().cloned());
            if run.success {
                Ok(())
            } else {
                Err(DeployError::ApplyFailed {
                    count: run.failed.len(),
                })
            }
        })?;

        if options.run_post_checks {
            self.stage(DeploymentStage::PostChecks, checkpoint, result, |this, _| {
                this.run_checks(CheckStage::Post)
            })?;
        }

        if !options.maintenance.is_empty() {
            self.stage(DeploymentStage::Maintenance, checkpoint, result, |this, result| {
                this.maintain(options, result);
                Ok(())
            })?;
        }

        self.stage(DeploymentStage::Finalize, checkpoint, result, |this, result| {
            let version = this.registry.schema_version()?;
            result.final_schema_version = Some(version);
            result.success = true;
            result.message = format!(
                "Deployed {} migration(s); schema version {version}",
                result.applied_migrations.len()
            );
            Ok(())
        })
    }

    fn stage<T>(
        &mut self,
        stage: DeploymentStage,
        checkpoint: &Checkpoint,
        result: &mut DeploymentResult,
        op: impl FnOnce(&mut Self, &mut DeploymentResult) -> Result<T, DeployError>,
    ) -> Result<T, StageFailure> {
        checkpoint.check(stage).map_err(|e| (stage, e))?;

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::stage_span(stage.as_str()).entered();

        let deployment_id = result.deployment_id;
        log::info!("Stage {stage} started");
        self.emit(DeploymentEvent::StageStarted { deployment_id, stage });
        let started = Instant::now();

        let value = op(self, result).map_err(|e| (stage, e))?;

        let elapsed = started.elapsed();
        log::debug!("Stage {stage} finished in {elapsed:?}");
        self.emit(DeploymentEvent::StageFinished {
            deployment_id,
            stage,
            elapsed,
        });
        Ok(value)
    }

    /// Validate the graph and work out which migrations to apply
    fn validate(
        &mut self,
        target: Option<&str>,
        result: &mut DeploymentResult,
    ) -> Result<Vec<String>, DeployError> {
        let report = self.registry.validate()?;
        result
            .warnings
            .extend(report.warnings.iter().map(ToString::to_string));
        result.validation = Some(report.clone());
        if !report.is_valid {
            return Err(MigrationError::Validation(Box::new(report)).into());
        }

        match target {
            None => Ok(report.pending),
            Some(id) => {
                let definition = self.registry.get(id)?;
                if definition.applied {
                    log::info!("Migration {id} is already applied");
                    result.message = format!("Migration {id} is already applied");
                    Ok(Vec::new())
                } else {
                    Ok(vec![definition.id])
                }
            }
        }
    }

    fn run_checks(&mut self, stage: CheckStage) -> Result<(), DeployError> {
        let mut failures = match stage {
            CheckStage::Pre => checks::pre_deployment(&mut self.registry),
            CheckStage::Post => checks::post_deployment(&mut self.registry),
        };
        failures.extend(checks::run_custom(&self.checks, stage, self.registry.store()));
        if failures.is_empty() {
            Ok(())
        } else {
            for failure in &failures {
                log::warn!("Check failed: {failure}");
            }
            Err(DeployError::ChecksFailed(failures))
        }
    }

    fn backup(&self, result: &mut DeploymentResult) -> Result<(), DeployError> {
        let provider = self
            .backup_provider
            .as_ref()
            .ok_or(DeployError::NoBackupProvider)?;
        let label = format!("pre-deploy-{}", result.deployment_id);
        let location = provider
            .create_backup(&label)
            .map_err(DeployError::Backup)?;
        log::info!("Backup created at {location}");
        result.backup_location = Some(location);
        Ok(())
    }

    fn maintain(&self, options: &DeploymentOptions, result: &mut DeploymentResult) {
        for &operation in &options.maintenance {
            if let Err(e) = self.maintenance.run(self.registry.store(), operation, None) {
                log::warn!("Maintenance {operation} failed: {e}");
                result.warnings.push(format!("maintenance {operation} failed: {e}"));
            }
        }
    }

    fn fail(
        &mut self,
        options: &DeploymentOptions,
        result: &mut DeploymentResult,
        stage: DeploymentStage,
        error: &DeployError,
    ) {
        log::error!("Stage {stage} failed: {error}");
        result.success = false;
        result.failed_stage = Some(stage);
        result.errors.push(format!("{stage}: {error}"));
        result.message = format!("Deployment failed at {stage}: {error}");
        self.emit(DeploymentEvent::StageFailed {
            deployment_id: result.deployment_id,
            stage,
            error: error.to_string(),
        });

        if stage.can_leave_changes() && !result.applied_migrations.is_empty() {
            self.recover(options, result);
        }
    }

    /// Revert what this run applied
    fn recover(&mut self, options: &DeploymentOptions, result: &mut DeploymentResult) {
        if !options.enable_automatic_rollback {
            log::warn!(
                "Automatic rollback disabled; {} migration(s) remain applied",
                result.applied_migrations.len()
            );
            result
                .warnings
                .push("automatic rollback disabled; applied migrations remain in place".to_string());
            return;
        }

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::stage_span("rollback").entered();

        log::warn!(
            "Rolling back {} migration(s) applied by deployment {}",
            result.applied_migrations.len(),
            result.deployment_id
        );
        let rollback = match self.registry.rollback_migrations(&result.applied_migrations) {
            Ok(rollback) => rollback,
            Err(e) => MigrationResult {
                success: false,
                errors: vec![e.to_string()],
                ..MigrationResult::default()
            },
        };

        if rollback.success {
            log::info!("Automatic rollback reverted {:?}", rollback.rolled_back);
            result.message.push_str("; applied migrations were rolled back");
        } else {
            log::error!("Automatic rollback failed: {}", rollback.errors.join("; "));
            result
                .errors
                .push(format!("automatic rollback failed: {}", rollback.errors.join("; ")));
            result.message.push_str("; automatic rollback failed");
        }
        result.rollback_result = Some(rollback);
    }

    fn emit(&self, event: DeploymentEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                log::debug!("Deployment event receiver disconnected");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::deploy::{DeploymentOutcome, FnCheck};
    use crate::executor::Store;
    use crate::maintenance::MaintenanceOperation;
    use crate::memory::MemoryStore;
    use crate::migration::MigrationDefinition;
    use std::time::Duration;

    fn migration(version: i64, id: &str) -> MigrationDefinition {
        MigrationDefinition::new(version, id)
            .with_id(id)
            .with_up(format!("CREATE TABLE {id} (id INT)"))
            .with_down(format!("DROP TABLE {id}"))
    }

    fn deployer(store: &MemoryStore, migrations: &[MigrationDefinition]) -> Deployer {
        let mut registry = MigrationRegistry::new(Arc::new(store.clone()), Arc::new(store.clone()));
        for m in migrations {
            registry.register(m.clone()).unwrap();
        }
        Deployer::new(registry)
    }

    #[test]
    fn test_successful_deploy_applies_everything() {
        let store = MemoryStore::new();
        let mut deployer = deployer(&store, &[migration(1, "a"), migration(2, "b").depends_on("a")]);

        let result = deployer.deploy(&DeploymentOptions::default());
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.applied_migrations, vec!["a", "b"]);
        assert_eq!(result.final_schema_version, Some(2.into()));
        assert_eq!(result.outcome(), DeploymentOutcome::Deployed);
        assert!(result.finished_at >= result.started_at);
    }

    #[test]
    fn test_up_to_date_skips_backup() {
        let store = MemoryStore::new();
        let mut deployer = deployer(&store, &[migration(1, "a")])
            .with_backup_provider(Arc::new(store.clone()));
        assert!(deployer.deploy(&DeploymentOptions::default()).success);

        let again = deployer.deploy(&DeploymentOptions::default().with_backup(true));
        assert!(again.success);
        assert_eq!(again.message, "Schema is up to date");
        assert!(again.backup_location.is_none());
        assert!(store.backups().is_empty());
    }

    #[test]
    fn test_invalid_graph_stops_before_mutation() {
        let store = MemoryStore::new();
        let mut deployer = deployer(&store, &[migration(1, "a").depends_on("missing")]);

        let result = deployer.deploy(&DeploymentOptions::default());
        assert!(!result.success);
        assert_eq!(result.failed_stage, Some(DeploymentStage::Validate));
        assert!(!result.validation.as_ref().unwrap().is_valid);
        assert_eq!(result.outcome(), DeploymentOutcome::NothingApplied);
    }

    #[test]
    fn test_backup_without_provider_fails_before_apply() {
        let store = MemoryStore::new();
        let mut deployer = deployer(&store, &[migration(1, "a")]);

        let result = deployer.deploy(&DeploymentOptions::default().with_backup(true));
        assert_eq!(result.failed_stage, Some(DeploymentStage::Backup));
        assert!(result.applied_migrations.is_empty());
        assert!(deployer.registry_mut().applied().unwrap().is_empty());
    }

    #[test]
    fn test_failed_backup_aborts() {
        let store = MemoryStore::new();
        store.set_fail_backups(true);
        let mut deployer = deployer(&store, &[migration(1, "a")])
            .with_backup_provider(Arc::new(store.clone()));

        let result = deployer.deploy(&DeploymentOptions::default().with_backup(true));
        assert_eq!(result.failed_stage, Some(DeploymentStage::Backup));
        assert!(result.rollback_result.is_none());
    }

    #[test]
    fn test_post_check_failure_rolls_back() {
        let store = MemoryStore::new();
        let mut deployer = deployer(&store, &[migration(1, "a")]).with_check(FnCheck::new(
            "smoke",
            CheckStage::Post,
            |_: &dyn Store| Err("smoke test failed".to_string()),
        ));

        let result = deployer.deploy(&DeploymentOptions::default());
        assert!(!result.success);
        assert_eq!(result.failed_stage, Some(DeploymentStage::PostChecks));
        assert_eq!(result.applied_migrations, vec!["a"]);
        assert_eq!(result.outcome(), DeploymentOutcome::Recovered);
        assert!(deployer.registry_mut().applied().unwrap().is_empty());
    }

    #[test]
    fn test_failure_without_auto_rollback_leaves_migrations_applied() {
        let store = MemoryStore::new();
        store.fail_on("CREATE TABLE b");
        let mut deployer = deployer(&store, &[migration(1, "a"), migration(2, "b")]);

        let result = deployer.deploy(&DeploymentOptions::default().with_automatic_rollback(false));
        assert_eq!(result.failed_stage, Some(DeploymentStage::Apply));
        assert_eq!(result.failed_migrations, vec!["b"]);
        assert!(result.rollback_result.is_none());
        assert_eq!(result.outcome(), DeploymentOutcome::Unrecoverable);
        assert_eq!(deployer.registry_mut().applied().unwrap().len(), 1);
    }

    #[test]
    fn test_cancelled_before_start() {
        let store = MemoryStore::new();
        let mut deployer = deployer(&store, &[migration(1, "a")]);
        deployer.cancellation_token().cancel();

        let result = deployer.deploy(&DeploymentOptions::default());
        assert!(!result.success);
        assert_eq!(result.failed_stage, Some(DeploymentStage::Validate));
        assert!(result.errors[0].contains("cancelled"));
    }

    #[test]
    fn test_sub_second_timeout_still_deploys() {
        let store = MemoryStore::new();
        let mut deployer = deployer(&store, &[migration(1, "a")]);

        let options = DeploymentOptions::default().with_timeout(Duration::from_millis(900));
        let result = deployer.deploy(&options);
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.applied_migrations, vec!["a"]);
        assert!(result.failed_stage.is_none());
    }

    #[test]
    fn test_deploy_one_applies_only_target() {
        let store = MemoryStore::new();
        let mut deployer = deployer(&store, &[migration(1, "a"), migration(2, "b")]);

        let result = deployer.deploy_one("a", &DeploymentOptions::default());
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.applied_migrations, vec!["a"]);
        assert_eq!(deployer.registry_mut().pending().unwrap().len(), 1);

        let repeat = deployer.deploy_one("a", &DeploymentOptions::default());
        assert!(repeat.success);
        assert!(repeat.applied_migrations.is_empty());
    }

    #[test]
    fn test_deploy_one_unknown_id_fails_validation_stage() {
        let store = MemoryStore::new();
        let mut deployer = deployer(&store, &[migration(1, "a")]);
        let result = deployer.deploy_one("nope", &DeploymentOptions::default());
        assert_eq!(result.failed_stage, Some(DeploymentStage::Validate));
    }

    #[test]
    fn test_maintenance_failure_is_a_warning() {
        let store = MemoryStore::new();
        let mut deployer = deployer(&store, &[migration(1, "a")]);
        let options = DeploymentOptions::default()
            .with_maintenance(MaintenanceOperation::Analyze)
            .with_maintenance(MaintenanceOperation::Reindex);

        let result = deployer.deploy(&options);
        assert!(result.success);
        assert!(result.warnings.iter().any(|w| w.contains("reindex")));
        assert!(store.executed_statements().contains(&"ANALYZE".to_string()));
    }

    #[test]
    fn test_events_follow_stage_order() {
        let store = MemoryStore::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut deployer = deployer(&store, &[migration(1, "a")]).with_events(tx);

        let result = deployer.deploy(&DeploymentOptions::default());
        let started: Vec<DeploymentStage> = rx
            .try_iter()
            .filter_map(|event| match event {
                DeploymentEvent::StageStarted { stage, .. } => Some(stage),
                _ => None,
            })
            .collect();
        assert!(result.success);
        assert_eq!(
            started,
            vec![
                DeploymentStage::Validate,
                DeploymentStage::PreChecks,
                DeploymentStage::Apply,
                DeploymentStage::PostChecks,
                DeploymentStage::Finalize,
            ]
        );
    }
}
