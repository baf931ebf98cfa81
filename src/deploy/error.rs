//! Deployment stage failures

use std::time::Duration;

use crate::executor::StoreError;
use crate::migration::MigrationError;

use super::checks::CheckFailure;
use super::result::DeploymentStage;

/// Why a pipeline stage failed
///
/// These never escape [`crate::deploy::Deployer::deploy`]; they are rendered
/// into the [`crate::deploy::DeploymentResult`] error list.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error("Deployment cancelled before {stage}")]
    Cancelled { stage: DeploymentStage },
    #[error("Deployment exceeded its {timeout:?} budget before {stage}")]
    TimedOut {
        stage: DeploymentStage,
        timeout: Duration,
    },
    #[error("{} check(s) failed: {}", .0.len(), .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    ChecksFailed(Vec<CheckFailure>),
    #[error("Backup failed: {0}")]
    Backup(#[source] StoreError),
    #[error("Backup requested but no backup provider is configured")]
    NoBackupProvider,
    #[error("{count} migration(s) failed to apply")]
    ApplyFailed { count: usize },
}
