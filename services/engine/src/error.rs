//! Errors returned by the engine facade.

use railyard_id::{DeploymentId, EnvId, GroupId, ServiceId};
use thiserror::Error;

use crate::db::StoreError;
use crate::graph::GraphError;

/// Engine errors surfaced to callers of the exposed operations.
///
/// Failures that happen after a group is accepted are never returned here;
/// they are recorded on the deployment or group as a `FailureReason`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The targeted services form a dependency cycle.
    #[error("dependency cycle: {}", .names.join(" -> "))]
    CycleDetected {
        path: Vec<ServiceId>,
        names: Vec<String>,
    },

    /// A non-terminal deployment already holds the (service, environment) lease.
    #[error("service {service} in environment {environment} is already being deployed by {deployment}")]
    ConcurrentDeployConflict {
        service: ServiceId,
        environment: EnvId,
        deployment: DeploymentId,
    },

    /// No ready release matches the request.
    #[error("no ready release for service {service}{}", .commit.as_ref().map(|c| format!(" at commit {c}")).unwrap_or_default())]
    NoReadyRelease {
        service: ServiceId,
        commit: Option<String>,
    },

    #[error("unknown service: {0}")]
    UnknownService(ServiceId),

    #[error("a deployment group needs at least one service")]
    EmptyGroup,

    /// A dependency edge was refused.
    #[error("invalid dependency: {0}")]
    InvalidDependency(String),

    #[error("deployment group not found: {0}")]
    GroupNotFound(GroupId),

    /// The operation does not apply to the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LeaseHeld {
                service,
                environment,
                holder,
            } => Self::ConcurrentDeployConflict {
                service,
                environment,
                deployment: holder,
            },
            other => Self::Store(other),
        }
    }
}

impl From<GraphError> for EngineError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::CycleDetected { path, names } => Self::CycleDetected { path, names },
        }
    }
}
