//! Status enums, transition rules and failure reasons.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Returned when a persisted string does not name a known variant.
#[derive(Debug, Clone, Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Generates `as_str`, `Display` and `FromStr` for a fieldless enum.
macro_rules! string_enum {
    ($name:ident, $kind:literal { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($name::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// =============================================================================
// Deployment
// =============================================================================

/// Lifecycle of a single deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Building,
    Deploying,
    Running,
    Healthy,
    Failed,
    RolledBack,
}

string_enum!(DeploymentStatus, "deployment status" {
    Pending => "pending",
    Building => "building",
    Deploying => "deploying",
    Running => "running",
    Healthy => "healthy",
    Failed => "failed",
    RolledBack => "rolled_back",
});

impl DeploymentStatus {
    /// Terminal for leasing purposes: the (service, environment) pair is free.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Healthy | Self::Failed | Self::RolledBack)
    }

    /// The manifest has reached the cluster and the rollout is live or done.
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Deploying | Self::Running | Self::Healthy)
    }

    /// Whether `self -> next` moves forward.
    ///
    /// `rolled_back` is only reachable from a terminal state, once a
    /// compensating group has replaced the deployment.
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Pending, Building)
                | (Pending, Failed)
                | (Building, Deploying)
                | (Building, Failed)
                | (Deploying, Running)
                | (Deploying, Healthy)
                | (Deploying, Failed)
                | (Running, Healthy)
                | (Running, Failed)
                | (Healthy, RolledBack)
                | (Failed, RolledBack)
        )
    }
}

/// Observed health of a deployment's workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Degraded,
}

string_enum!(HealthState, "health state" {
    Unknown => "unknown",
    Healthy => "healthy",
    Degraded => "degraded",
});

// =============================================================================
// Group
// =============================================================================

/// Lifecycle of a deployment group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Pending,
    Building,
    Deploying,
    Completed,
    Failed,
    RolledBack,
}

string_enum!(GroupStatus, "group status" {
    Pending => "pending",
    Building => "building",
    Deploying => "deploying",
    Completed => "completed",
    Failed => "failed",
    RolledBack => "rolled_back",
});

impl GroupStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }

    pub fn can_transition_to(&self, next: GroupStatus) -> bool {
        use GroupStatus::*;
        matches!(
            (self, next),
            (Pending, Building)
                | (Pending, Failed)
                | (Building, Deploying)
                | (Building, Failed)
                | (Deploying, Completed)
                | (Deploying, Failed)
                | (Failed, RolledBack)
        )
    }
}

/// How a group sequences its deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    Parallel,
    Sequential,
    DependencyOrdered,
}

string_enum!(Strategy, "strategy" {
    Parallel => "parallel",
    Sequential => "sequential",
    DependencyOrdered => "dependency_ordered",
});

/// What started a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    #[default]
    Manual,
    Git,
    Rollback,
}

string_enum!(TriggerSource, "trigger source" {
    Manual => "manual",
    Git => "git",
    Rollback => "rollback",
});

// =============================================================================
// Release / dependency
// =============================================================================

/// Build state of a release, owned by the build collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    #[default]
    Pending,
    Building,
    Ready,
    Failed,
}

string_enum!(ReleaseStatus, "release status" {
    Pending => "pending",
    Building => "building",
    Ready => "ready",
    Failed => "failed",
});

/// What a dependency edge requires of its upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// Upstream must be healthy (reachable).
    #[default]
    Runtime,
    /// Upstream must have been applied (exists).
    Build,
    /// Upstream must have been applied (exists).
    Deploy,
}

string_enum!(DependencyType, "dependency type" {
    Runtime => "runtime",
    Build => "build",
    Deploy => "deploy",
});

impl DependencyType {
    /// Whether an upstream in `status` satisfies this edge.
    pub fn satisfied_by(&self, status: DeploymentStatus) -> bool {
        match self {
            Self::Runtime => status == DeploymentStatus::Healthy,
            Self::Build | Self::Deploy => status.is_applied(),
        }
    }
}

// =============================================================================
// Failure
// =============================================================================

/// Machine-readable reason attached to failed deployments and groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    /// An upstream dependency did not become ready in time.
    DependencyTimeout,
    /// An upstream dependency failed.
    DependencyFailed,
    /// The dependency graph became cyclic after the group was created.
    DependencyCycle,
    /// Transient cluster errors outlasted the retry budget.
    ReconcileExhausted,
    /// The cluster refused the manifest.
    ClusterRejected,
    /// The manifest could not be rendered.
    InvalidManifest,
    /// The rollout made no progress within the health window.
    HealthCheckTimeout,
    /// A container is crash-looping.
    CrashLoop,
    /// The image cannot be pulled.
    ImagePullFailed,
    /// The container configuration is invalid (missing secret, bad mount...).
    ContainerConfigError,
    /// Not started because an earlier deployment in the group failed.
    Halted,
    /// Cancelled by a user.
    Cancelled,
    /// The group exceeded its wall-clock budget.
    GroupTimeout,
    /// The release was not ready or had no image.
    ReleaseUnavailable,
    /// The worker holding the claim disappeared.
    WorkerLost,
    /// The engine could not keep driving the group (persistence failed).
    OrchestrationError,
}

string_enum!(FailureReason, "failure reason" {
    DependencyTimeout => "DependencyTimeout",
    DependencyFailed => "DependencyFailed",
    DependencyCycle => "DependencyCycle",
    ReconcileExhausted => "ReconcileExhausted",
    ClusterRejected => "ClusterRejected",
    InvalidManifest => "InvalidManifest",
    HealthCheckTimeout => "HealthCheckTimeout",
    CrashLoop => "CrashLoop",
    ImagePullFailed => "ImagePullFailed",
    ContainerConfigError => "ContainerConfigError",
    Halted => "Halted",
    Cancelled => "Cancelled",
    GroupTimeout => "GroupTimeout",
    ReleaseUnavailable => "ReleaseUnavailable",
    WorkerLost => "WorkerLost",
    OrchestrationError => "OrchestrationError",
});

/// A terminal failure: reason plus enough detail to diagnose it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub reason: FailureReason,
    pub detail: String,
}

impl Failure {
    pub fn new(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason, self.detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_status_roundtrip() {
        for status in DeploymentStatus::ALL {
            let parsed: DeploymentStatus = status.as_str().parse().unwrap();
            assert_eq!(&parsed, status);
        }
        assert!("claimed".parse::<DeploymentStatus>().is_err());
    }

    #[test]
    fn test_deployment_status_only_moves_forward() {
        use DeploymentStatus::*;
        assert!(Pending.can_transition_to(Building));
        assert!(Deploying.can_transition_to(Healthy));
        assert!(Healthy.can_transition_to(RolledBack));

        assert!(!Healthy.can_transition_to(Deploying));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!RolledBack.can_transition_to(Healthy));
        assert!(!Pending.can_transition_to(Healthy));
        assert!(!Pending.can_transition_to(RolledBack));
    }

    #[test]
    fn test_terminal_statuses() {
        use DeploymentStatus::*;
        let terminal: Vec<_> = DeploymentStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(terminal, vec![&Healthy, &Failed, &RolledBack]);
    }

    #[test]
    fn test_group_status_transitions() {
        use GroupStatus::*;
        assert!(Pending.can_transition_to(Building));
        assert!(Deploying.can_transition_to(Failed));
        assert!(Failed.can_transition_to(RolledBack));
        assert!(!Completed.can_transition_to(RolledBack));
        assert!(!Completed.can_transition_to(Failed));
    }

    #[test]
    fn test_dependency_type_satisfaction() {
        use DeploymentStatus::*;
        assert!(DependencyType::Runtime.satisfied_by(Healthy));
        assert!(!DependencyType::Runtime.satisfied_by(Running));
        assert!(DependencyType::Build.satisfied_by(Deploying));
        assert!(DependencyType::Deploy.satisfied_by(Running));
        assert!(!DependencyType::Deploy.satisfied_by(Building));
        assert!(!DependencyType::Deploy.satisfied_by(Failed));
    }

    #[test]
    fn test_failure_reason_wire_names() {
        assert_eq!(FailureReason::CrashLoop.as_str(), "CrashLoop");
        assert_eq!(
            serde_json::to_string(&FailureReason::ReconcileExhausted).unwrap(),
            "\"ReconcileExhausted\""
        );
        for reason in FailureReason::ALL {
            assert_eq!(reason.as_str().parse::<FailureReason>().unwrap(), *reason);
        }
    }
}
