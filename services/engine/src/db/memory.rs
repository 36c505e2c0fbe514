//! In-memory store for tests and dev mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use railyard_id::{DeploymentId, EnvId, GroupId, ProjectId, ReleaseId, ServiceId, WorkerId};
use tokio::sync::Mutex;

use super::{releases_lease, DeploymentUpdate, GroupUpdate, Store, StoreError};
use crate::model::{
    Deployment, DeploymentGroup, DeploymentStatus, Environment, GroupStatus, Release,
    ReleaseStatus, Service, ServiceDependency,
};

#[derive(Debug, Default)]
struct Inner {
    services: HashMap<ServiceId, Service>,
    environments: HashMap<EnvId, Environment>,
    releases: HashMap<ReleaseId, Release>,
    dependencies: Vec<ServiceDependency>,
    groups: HashMap<GroupId, DeploymentGroup>,
    deployments: HashMap<DeploymentId, Deployment>,
    leases: HashMap<(ServiceId, EnvId), DeploymentId>,
}

/// Store backed by process memory. Same semantics as the Postgres store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    refuse_dispatch: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deployment currently leasing the pair, if any.
    pub async fn lease_holder(&self, service: ServiceId, environment: EnvId) -> Option<DeploymentId> {
        self.inner.lock().await.leases.get(&(service, environment)).copied()
    }

    /// Makes every later dispatch record fail as if the database went away.
    pub fn refuse_dispatch_records(&self) {
        self.refuse_dispatch.store(true, Ordering::SeqCst);
    }

    /// Number of deployment rows.
    pub async fn deployment_count(&self) -> usize {
        self.inner.lock().await.deployments.len()
    }
}

fn transition_error(from: impl ToString, to: impl ToString, entity: &'static str) -> StoreError {
    StoreError::InvalidTransition {
        entity,
        from: from.to_string(),
        to: to.to_string(),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert_service(&self, service: &Service) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let duplicate = inner.services.values().any(|s| {
            s.project_id == service.project_id && s.name == service.name && !s.is_deleted()
        });
        if duplicate || inner.services.contains_key(&service.id) {
            return Err(StoreError::Conflict(format!(
                "service {} already exists",
                service.name
            )));
        }
        inner.services.insert(service.id, service.clone());
        Ok(())
    }

    async fn get_service(&self, id: ServiceId) -> Result<Service, StoreError> {
        self.inner
            .lock()
            .await
            .services
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("service", id))
    }

    async fn list_services(&self, project: ProjectId) -> Result<Vec<Service>, StoreError> {
        let inner = self.inner.lock().await;
        let mut services: Vec<Service> = inner
            .services
            .values()
            .filter(|s| s.project_id == project && !s.is_deleted())
            .cloned()
            .collect();
        services.sort_by_key(|s| (s.created_at, s.id));
        Ok(services)
    }

    async fn delete_service(
        &self,
        id: ServiceId,
        at: DateTime<Utc>,
    ) -> Result<Vec<ServiceDependency>, StoreError> {
        let mut inner = self.inner.lock().await;
        let service = inner
            .services
            .get_mut(&id)
            .filter(|s| !s.is_deleted())
            .ok_or_else(|| StoreError::not_found("service", id))?;
        service.deleted_at = Some(at);

        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.dependencies)
            .into_iter()
            .partition(|d| d.service_id == id || d.depends_on == id);
        inner.dependencies = kept;
        Ok(removed)
    }

    async fn insert_environment(&self, environment: &Environment) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let duplicate = inner
            .environments
            .values()
            .any(|e| e.project_id == environment.project_id && e.name == environment.name);
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "environment {} already exists",
                environment.name
            )));
        }
        inner.environments.insert(environment.id, environment.clone());
        Ok(())
    }

    async fn get_environment(&self, id: EnvId) -> Result<Environment, StoreError> {
        self.inner
            .lock()
            .await
            .environments
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("environment", id))
    }

    async fn insert_release(&self, release: &Release) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let duplicate = inner
            .releases
            .values()
            .any(|r| r.service_id == release.service_id && r.version == release.version);
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "release {} already exists for service {}",
                release.version, release.service_id
            )));
        }
        inner.releases.insert(release.id, release.clone());
        Ok(())
    }

    async fn get_release(&self, id: ReleaseId) -> Result<Release, StoreError> {
        self.inner
            .lock()
            .await
            .releases
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("release", id))
    }

    async fn mark_release_ready(
        &self,
        id: ReleaseId,
        image: &str,
        at: DateTime<Utc>,
    ) -> Result<Release, StoreError> {
        let mut inner = self.inner.lock().await;
        let release = inner
            .releases
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("release", id))?;
        if matches!(release.status, ReleaseStatus::Ready | ReleaseStatus::Failed)
            || release.image.is_some()
        {
            return Err(transition_error(release.status, ReleaseStatus::Ready, "release"));
        }
        release.status = ReleaseStatus::Ready;
        release.image = Some(image.to_string());
        release.ready_at = Some(at);
        Ok(release.clone())
    }

    async fn latest_ready_release(
        &self,
        service: ServiceId,
        commit: Option<&str>,
    ) -> Result<Option<Release>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .releases
            .values()
            .filter(|r| r.service_id == service && r.status == ReleaseStatus::Ready)
            .filter(|r| commit.map_or(true, |c| r.source_commit.as_deref() == Some(c)))
            .max_by_key(|r| (r.ready_at, r.created_at, r.id))
            .cloned())
    }

    async fn insert_dependency(&self, dependency: &ServiceDependency) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let duplicate = inner.dependencies.iter().any(|d| {
            d.service_id == dependency.service_id && d.depends_on == dependency.depends_on
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "dependency {} -> {} already exists",
                dependency.service_id, dependency.depends_on
            )));
        }
        inner.dependencies.push(dependency.clone());
        Ok(())
    }

    async fn delete_dependency(
        &self,
        service: ServiceId,
        depends_on: ServiceId,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.dependencies.len();
        inner
            .dependencies
            .retain(|d| !(d.service_id == service && d.depends_on == depends_on));
        Ok(inner.dependencies.len() != before)
    }

    async fn list_dependencies(
        &self,
        project: ProjectId,
    ) -> Result<Vec<ServiceDependency>, StoreError> {
        let inner = self.inner.lock().await;
        let live = |id: &ServiceId| {
            inner
                .services
                .get(id)
                .is_some_and(|s| s.project_id == project && !s.is_deleted())
        };
        let mut edges: Vec<ServiceDependency> = inner
            .dependencies
            .iter()
            .filter(|d| live(&d.service_id) && live(&d.depends_on))
            .cloned()
            .collect();
        edges.sort_by_key(|d| (d.created_at, d.id));
        Ok(edges)
    }

    async fn create_group(
        &self,
        group: &DeploymentGroup,
        deployments: &[Deployment],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.groups.contains_key(&group.id) {
            return Err(StoreError::Conflict(format!("group {} already exists", group.id)));
        }
        for deployment in deployments {
            let key = (deployment.service_id, deployment.environment_id);
            if let Some(holder) = inner.leases.get(&key) {
                return Err(StoreError::LeaseHeld {
                    service: key.0,
                    environment: key.1,
                    holder: *holder,
                });
            }
        }
        // One deployment per service per group.
        let mut seen = std::collections::HashSet::new();
        for deployment in deployments {
            if !seen.insert(deployment.service_id) {
                return Err(StoreError::Conflict(format!(
                    "service {} appears twice in group {}",
                    deployment.service_id, group.id
                )));
            }
        }

        inner.groups.insert(group.id, group.clone());
        for deployment in deployments {
            inner
                .leases
                .insert((deployment.service_id, deployment.environment_id), deployment.id);
            inner.deployments.insert(deployment.id, deployment.clone());
        }
        Ok(())
    }

    async fn get_group(&self, id: GroupId) -> Result<DeploymentGroup, StoreError> {
        self.inner
            .lock()
            .await
            .groups
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("deployment group", id))
    }

    async fn list_groups(
        &self,
        project: ProjectId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<DeploymentGroup>, StoreError> {
        let inner = self.inner.lock().await;
        let mut groups: Vec<DeploymentGroup> = inner
            .groups
            .values()
            .filter(|g| g.project_id == project)
            .cloned()
            .collect();
        groups.sort_by_key(|g| std::cmp::Reverse((g.created_at, g.id)));
        Ok(groups
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn group_deployments(&self, id: GroupId) -> Result<Vec<Deployment>, StoreError> {
        let inner = self.inner.lock().await;
        if !inner.groups.contains_key(&id) {
            return Err(StoreError::not_found("deployment group", id));
        }
        let mut deployments: Vec<Deployment> = inner
            .deployments
            .values()
            .filter(|d| d.group_id == Some(id))
            .cloned()
            .collect();
        deployments.sort_by_key(|d| (d.deploy_order, d.created_at, d.id));
        Ok(deployments)
    }

    async fn transition_group(
        &self,
        id: GroupId,
        from: GroupStatus,
        update: GroupUpdate,
    ) -> Result<DeploymentGroup, StoreError> {
        if !from.can_transition_to(update.status) {
            return Err(transition_error(from, update.status, "deployment group"));
        }
        let mut inner = self.inner.lock().await;
        let group = inner
            .groups
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("deployment group", id))?;
        if group.status != from {
            return Err(StoreError::Conflict(format!(
                "group {} is {}, expected {}",
                id, group.status, from
            )));
        }
        update.apply_to(group);
        Ok(group.clone())
    }

    async fn rollback_groups_for(
        &self,
        failed: GroupId,
    ) -> Result<Vec<DeploymentGroup>, StoreError> {
        let inner = self.inner.lock().await;
        let mut groups: Vec<DeploymentGroup> = inner
            .groups
            .values()
            .filter(|g| g.rollback_group_id == Some(failed))
            .cloned()
            .collect();
        groups.sort_by_key(|g| (g.created_at, g.id));
        Ok(groups)
    }

    async fn unfinished_groups(&self) -> Result<Vec<DeploymentGroup>, StoreError> {
        let inner = self.inner.lock().await;
        let mut groups: Vec<DeploymentGroup> = inner
            .groups
            .values()
            .filter(|g| !g.status.is_terminal())
            .cloned()
            .collect();
        groups.sort_by_key(|g| (g.created_at, g.id));
        Ok(groups)
    }

    async fn get_deployment(&self, id: DeploymentId) -> Result<Deployment, StoreError> {
        self.inner
            .lock()
            .await
            .deployments
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("deployment", id))
    }

    async fn transition_deployment(
        &self,
        id: DeploymentId,
        from: DeploymentStatus,
        update: DeploymentUpdate,
    ) -> Result<Deployment, StoreError> {
        if !from.can_transition_to(update.status) {
            return Err(transition_error(from, update.status, "deployment"));
        }
        let mut inner = self.inner.lock().await;
        let deployment = inner
            .deployments
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("deployment", id))?;
        if deployment.status != from {
            return Err(StoreError::Conflict(format!(
                "deployment {} is {}, expected {}",
                id, deployment.status, from
            )));
        }
        update.apply_to(deployment);
        let updated = deployment.clone();

        if releases_lease(update.status) {
            let key = (updated.service_id, updated.environment_id);
            if inner.leases.get(&key) == Some(&id) {
                inner.leases.remove(&key);
            }
        }
        Ok(updated)
    }

    async fn claim_deployment(
        &self,
        id: DeploymentId,
        worker: WorkerId,
        expires_at: DateTime<Utc>,
    ) -> Result<Deployment, StoreError> {
        let mut inner = self.inner.lock().await;
        let deployment = inner
            .deployments
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("deployment", id))?;
        if deployment.status != DeploymentStatus::Pending || deployment.claimed_by.is_some() {
            return Err(StoreError::Conflict(format!(
                "deployment {} is {} and cannot be claimed",
                id, deployment.status
            )));
        }
        let now = Utc::now();
        deployment.status = DeploymentStatus::Building;
        deployment.claimed_by = Some(worker);
        deployment.claim_expires_at = Some(expires_at);
        deployment.updated_at = now;
        Ok(deployment.clone())
    }

    async fn renew_claim(
        &self,
        id: DeploymentId,
        worker: WorkerId,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let deployment = inner
            .deployments
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("deployment", id))?;
        if deployment.claimed_by != Some(worker) {
            return Err(StoreError::Conflict(format!(
                "worker {} no longer holds deployment {}",
                worker, id
            )));
        }
        deployment.claim_expires_at = Some(expires_at);
        Ok(())
    }

    async fn record_progress(
        &self,
        id: DeploymentId,
        ready_replicas: u32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let deployment = inner
            .deployments
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("deployment", id))?;
        deployment.ready_replicas = ready_replicas;
        deployment.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_dispatched(&self, id: DeploymentId, at: DateTime<Utc>) -> Result<(), StoreError> {
        if self.refuse_dispatch.load(Ordering::SeqCst) {
            return Err(StoreError::Query(sqlx::Error::PoolClosed));
        }
        let mut inner = self.inner.lock().await;
        let deployment = inner
            .deployments
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("deployment", id))?;
        if deployment.dispatched_at.is_none() {
            deployment.dispatched_at = Some(at);
        }
        Ok(())
    }

    async fn claimed_deployments(&self) -> Result<Vec<Deployment>, StoreError> {
        let inner = self.inner.lock().await;
        let mut claimed: Vec<Deployment> = inner
            .deployments
            .values()
            .filter(|d| d.claimed_by.is_some() && !d.status.is_terminal())
            .cloned()
            .collect();
        claimed.sort_by_key(|d| (d.created_at, d.id));
        Ok(claimed)
    }

    async fn expired_claims(&self, now: DateTime<Utc>) -> Result<Vec<Deployment>, StoreError> {
        let inner = self.inner.lock().await;
        let mut expired: Vec<Deployment> = inner
            .deployments
            .values()
            .filter(|d| !d.status.is_terminal())
            .filter(|d| d.claim_expires_at.is_some_and(|at| at < now))
            .cloned()
            .collect();
        expired.sort_by_key(|d| (d.created_at, d.id));
        Ok(expired)
    }

    async fn latest_healthy_deployment(
        &self,
        service: ServiceId,
        environment: EnvId,
        exclude_group: GroupId,
        before: DateTime<Utc>,
    ) -> Result<Option<Deployment>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .deployments
            .values()
            .filter(|d| {
                d.service_id == service
                    && d.environment_id == environment
                    && d.status == DeploymentStatus::Healthy
                    && d.group_id != Some(exclude_group)
                    && d.created_at < before
            })
            .max_by_key(|d| (d.created_at, d.id))
            .cloned())
    }
}
