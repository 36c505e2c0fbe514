//! Persisted rows.

use chrono::{DateTime, Utc};
use railyard_id::{
    DependencyId, DeploymentId, EnvId, GroupId, ProjectId, ReleaseId, ServiceId, WorkerId,
};
use serde::{Deserialize, Serialize};

use super::{
    DependencyType, DeploymentStatus, Failure, GroupStatus, HealthState, ReleaseStatus,
    ServiceConfig, Strategy, TriggerSource,
};

/// A deployable service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub project_id: ProjectId,
    pub name: String,
    /// Where the build collaborator finds the source (repository URL, path).
    pub build_ref: String,
    pub config: ServiceConfig,
    pub created_at: DateTime<Utc>,
    /// Set when the service is deleted. History keeps referencing the row.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Service {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A deployment target inside a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub id: EnvId,
    pub project_id: ProjectId,
    pub name: String,
    /// Cluster namespace the environment's workloads live in.
    pub namespace: String,
    pub created_at: DateTime<Utc>,
}

/// An immutable build artifact record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub id: ReleaseId,
    pub service_id: ServiceId,
    /// Unique per service.
    pub version: String,
    /// Set exactly once, when the release becomes ready.
    pub image: Option<String>,
    pub source_commit: Option<String>,
    pub status: ReleaseStatus,
    pub created_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
}

impl Release {
    /// The image, if this release can be deployed.
    pub fn deployable_image(&self) -> Option<&str> {
        match self.status {
            ReleaseStatus::Ready => self.image.as_deref(),
            _ => None,
        }
    }
}

/// A directed edge: `service_id` depends on `depends_on`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDependency {
    pub id: DependencyId,
    pub service_id: ServiceId,
    pub depends_on: ServiceId,
    pub dependency_type: DependencyType,
    pub created_at: DateTime<Utc>,
}

/// One attempt to run a release in an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub service_id: ServiceId,
    pub environment_id: EnvId,
    pub release_id: ReleaseId,
    pub group_id: Option<GroupId>,
    /// Rank within the group.
    pub deploy_order: Option<u32>,
    /// Lineage only: the deployment this one restores.
    pub previous_deployment_id: Option<DeploymentId>,
    pub status: DeploymentStatus,
    pub health: HealthState,
    pub desired_replicas: u32,
    pub ready_replicas: u32,
    pub failure: Option<Failure>,
    /// Transient apply failures that were retried.
    pub retry_count: u32,
    pub spec_hash: Option<String>,
    pub claimed_by: Option<WorkerId>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub applied_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// A new pending deployment.
    pub fn pending(
        service_id: ServiceId,
        environment_id: EnvId,
        release_id: ReleaseId,
        desired_replicas: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: DeploymentId::new(),
            service_id,
            environment_id,
            release_id,
            group_id: None,
            deploy_order: None,
            previous_deployment_id: None,
            status: DeploymentStatus::Pending,
            health: HealthState::Unknown,
            desired_replicas,
            ready_replicas: 0,
            failure: None,
            retry_count: 0,
            spec_hash: None,
            claimed_by: None,
            claim_expires_at: None,
            dispatched_at: None,
            applied_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn in_group(mut self, group_id: GroupId, deploy_order: u32) -> Self {
        self.group_id = Some(group_id);
        self.deploy_order = Some(deploy_order);
        self
    }

    pub fn restoring(mut self, previous: DeploymentId) -> Self {
        self.previous_deployment_id = Some(previous);
        self
    }

    /// Whether cluster changes for this deployment may exist.
    pub fn was_applied(&self) -> bool {
        self.applied_at.is_some()
    }
}

/// Who or what asked for a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Trigger {
    pub source: TriggerSource,
    /// Opaque actor identifier supplied by the trigger ingester.
    pub actor: String,
}

/// An atomic multi-service rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentGroup {
    pub id: GroupId,
    pub project_id: ProjectId,
    pub environment_id: EnvId,
    pub strategy: Strategy,
    pub status: GroupStatus,
    pub trigger: Trigger,
    pub source_commit: Option<String>,
    /// The failed group this one compensates for.
    pub rollback_group_id: Option<GroupId>,
    pub auto_rollback: bool,
    pub failure: Option<Failure>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Aggregated view of a group's deployments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupProgress {
    pub group_id: GroupId,
    pub status: GroupStatus,
    pub total: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub failed: usize,
    pub pending: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

impl GroupProgress {
    pub fn from_deployments(group: &DeploymentGroup, deployments: &[Deployment]) -> Self {
        let mut progress = Self {
            group_id: group.id,
            status: group.status,
            total: deployments.len(),
            completed: 0,
            in_progress: 0,
            failed: 0,
            pending: 0,
            failure: group.failure.clone(),
        };
        for deployment in deployments {
            match deployment.status {
                DeploymentStatus::Pending => progress.pending += 1,
                DeploymentStatus::Building
                | DeploymentStatus::Deploying
                | DeploymentStatus::Running => progress.in_progress += 1,
                DeploymentStatus::Healthy => progress.completed += 1,
                DeploymentStatus::Failed => progress.failed += 1,
                // Compensated: count by how the deployment originally ended.
                DeploymentStatus::RolledBack => {
                    if deployment.failure.is_some() {
                        progress.failed += 1
                    } else {
                        progress.completed += 1
                    }
                }
            }
        }
        progress
    }
}
