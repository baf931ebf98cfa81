//! Deployment pipeline options

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::maintenance::MaintenanceOperation;

/// How a deployment run behaves
///
/// Deserializable from the `deployment` section of the engine config; every
/// field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentOptions {
    /// Take a backup before mutating anything
    pub create_backup: bool,
    /// Probe connectivity, schema version and the migration list first
    pub run_pre_checks: bool,
    /// Re-probe after migrations are applied
    pub run_post_checks: bool,
    /// Revert what this run applied when a later stage fails
    pub enable_automatic_rollback: bool,
    /// Wall-clock budget for the whole run, in milliseconds
    pub timeout_ms: u64,
    /// Maintenance to run after post-deployment checks
    pub maintenance: Vec<MaintenanceOperation>,
}

impl Default for DeploymentOptions {
    fn default() -> Self {
        Self {
            create_backup: false,
            run_pre_checks: true,
            run_post_checks: true,
            enable_automatic_rollback: true,
            timeout_ms: 30 * 60 * 1000,
            maintenance: Vec::new(),
        }
    }
}

impl DeploymentOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn with_backup(mut self, enabled: bool) -> Self {
        self.create_backup = enabled;
        self
    }

    #[must_use]
    pub fn with_pre_checks(mut self, enabled: bool) -> Self {
        self.run_pre_checks = enabled;
        self
    }

    #[must_use]
    pub fn with_post_checks(mut self, enabled: bool) -> Self {
        self.run_post_checks = enabled;
        self
    }

    #[must_use]
    pub fn with_automatic_rollback(mut self, enabled: bool) -> Self {
        self.enable_automatic_rollback = enabled;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_maintenance(mut self, operation: MaintenanceOperation) -> Self {
        self.maintenance.push(operation);
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = DeploymentOptions::default();
        assert!(!options.create_backup);
        assert!(options.run_pre_checks && options.run_post_checks);
        assert!(options.enable_automatic_rollback);
        assert_eq!(options.timeout(), Duration::from_secs(1800));
        assert!(options.maintenance.is_empty());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let options: DeploymentOptions =
            serde_json::from_str(r#"{"create_backup": true, "maintenance": ["analyze"]}"#).unwrap();
        assert!(options.create_backup);
        assert!(options.enable_automatic_rollback);
        assert_eq!(options.maintenance, vec![MaintenanceOperation::Analyze]);
    }

    #[test]
    fn test_sub_second_timeout_is_kept() {
        let options = DeploymentOptions::default().with_timeout(Duration::from_millis(900));
        assert_eq!(options.timeout_ms, 900);
        assert_eq!(options.timeout(), Duration::from_millis(900));
    }
}
