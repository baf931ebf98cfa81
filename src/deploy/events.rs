//! Progress events published while a deployment runs

use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use super::result::{DeploymentOutcome, DeploymentStage};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeploymentEvent {
    StageStarted {
        deployment_id: Uuid,
        stage: DeploymentStage,
    },
    StageFinished {
        deployment_id: Uuid,
        stage: DeploymentStage,
        elapsed: Duration,
    },
    StageFailed {
        deployment_id: Uuid,
        stage: DeploymentStage,
        error: String,
    },
    Finished {
        deployment_id: Uuid,
        success: bool,
        outcome: DeploymentOutcome,
    },
}

impl DeploymentEvent {
    pub fn deployment_id(&self) -> Uuid {
        match self {
            DeploymentEvent::StageStarted { deployment_id, .. }
            | DeploymentEvent::StageFinished { deployment_id, .. }
            | DeploymentEvent::StageFailed { deployment_id, .. }
            | DeploymentEvent::Finished { deployment_id, .. } => *deployment_id,
        }
    }
}
