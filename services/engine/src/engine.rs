//! Engine facade.
//!
//! Wires the store, cluster client, worker pool and orchestrators together
//! and exposes the operations callers use: creating and cancelling groups,
//! rolling them back, and managing the services, releases and dependency
//! edges groups are built from.
//!
//! Every accepted group runs on its own supervisor task. The supervisor
//! drives the group orchestrator, finalizes rollbacks, triggers automatic
//! rollback on failure and then drops the group from the running registry.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use railyard_events::{
    event_types, ActorType, AggregateType, TransitionRecord, TransitionRecordBuilder,
};
use railyard_id::{DependencyId, EnvId, GroupId, ProjectId, ReleaseId, ServiceId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::audit::{Actor, Audit};
use crate::cancel::GroupSignal;
use crate::cluster::{ClusterApi, ClusterRateLimiter, RateLimitedCluster};
use crate::config::EngineConfig;
use crate::db::{Store, StoreError};
use crate::error::EngineError;
use crate::graph::{would_create_cycle, GraphBuilder, GraphNode};
use crate::health::HealthVerifier;
use crate::model::{
    Deployment, DeploymentGroup, DependencyType, Environment, Failure, FailureReason, GroupProgress,
    GroupStatus, Release, ReleaseStatus, Service, ServiceConfig, ServiceDependency, Strategy,
    Trigger, TriggerSource,
};
use crate::orchestrator::{GroupOrchestrator, RollbackOrchestrator, RollbackReport};
use crate::scheduler::{Reconciler, WorkQueue, WorkerPool};

/// Request to deploy a set of services together.
#[derive(Debug, Clone)]
pub struct CreateGroupRequest {
    pub project_id: ProjectId,
    pub environment_id: EnvId,
    pub services: Vec<ServiceId>,
    pub strategy: Strategy,
    /// Prefer releases built from this commit.
    pub source_commit: Option<String>,
    pub trigger: Trigger,
    /// Overrides the engine-wide auto-rollback setting.
    pub auto_rollback: Option<bool>,
}

struct RunningGroup {
    signal: GroupSignal,
    done: watch::Receiver<Option<GroupStatus>>,
    task: Option<JoinHandle<()>>,
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<dyn Store>,
    audit: Audit,
    pool: Arc<WorkerPool>,
    groups: GroupOrchestrator,
    rollback: RollbackOrchestrator,
    running: Mutex<HashMap<GroupId, RunningGroup>>,
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Recovers persisted work, starts the worker pool and resumes every
    /// unfinished group.
    pub async fn start(
        config: EngineConfig,
        store: Arc<dyn Store>,
        cluster: Arc<dyn ClusterApi>,
        audit: Audit,
    ) -> Result<Self, EngineError> {
        let limiter = ClusterRateLimiter::new(config.cluster_rate_per_sec, config.cluster_burst);
        let cluster: Arc<dyn ClusterApi> = Arc::new(RateLimitedCluster::new(cluster, limiter));

        let queue = Arc::new(WorkQueue::new(store.clone(), audit.clone()));
        let unfinished = queue.recover().await?;

        let verifier = HealthVerifier::new(
            cluster.clone(),
            config.health_poll_interval,
            config.health_no_progress_window,
        );
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            cluster,
            verifier,
            queue.clone(),
            audit.clone(),
            config.backoff,
            config.claim_ttl,
        ));
        let pool = Arc::new(WorkerPool::start(
            config.worker_pool_size,
            queue.clone(),
            reconciler,
            store.clone(),
            config.claim_sweep_interval,
        ));

        let groups = GroupOrchestrator::new(
            store.clone(),
            pool.clone(),
            queue,
            audit.clone(),
            config.dependency_timeout,
            config.group_budget,
        );
        let rollback = RollbackOrchestrator::new(store.clone(), audit.clone());

        let engine = Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                audit,
                pool,
                groups,
                rollback,
                running: Mutex::new(HashMap::new()),
            }),
        };

        for group in unfinished {
            info!(group_id = %group.id, status = %group.status, "Resuming unfinished group");
            engine.spawn_group(group.id);
        }
        Ok(engine)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    /// Whether the worker pool is accepting work.
    pub fn is_running(&self) -> bool {
        self.inner.pool.is_running()
    }

    // ---- groups ---------------------------------------------------------

    /// Validates and persists a group, then starts it in the background.
    ///
    /// Nothing is persisted when validation fails: unknown services, a
    /// dependency cycle, a service without a ready release, or a service
    /// that already has a deployment in flight in the environment.
    #[instrument(skip_all, fields(project_id = %request.project_id, environment_id = %request.environment_id))]
    pub async fn create_group(&self, request: CreateGroupRequest) -> Result<GroupId, EngineError> {
        let store = &self.inner.store;
        if request.services.is_empty() {
            return Err(EngineError::EmptyGroup);
        }

        let environment = store
            .get_environment(request.environment_id)
            .await
            .map_err(|e| match e {
                e if e.is_not_found() => EngineError::InvalidState(format!(
                    "unknown environment {}",
                    request.environment_id
                )),
                e => e.into(),
            })?;
        if environment.project_id != request.project_id {
            return Err(EngineError::InvalidState(format!(
                "environment {} belongs to another project",
                environment.id
            )));
        }

        let mut seen = HashSet::new();
        let mut services = Vec::with_capacity(request.services.len());
        for id in &request.services {
            if !seen.insert(*id) {
                continue;
            }
            let service = self.live_service(*id).await?;
            if service.project_id != request.project_id {
                return Err(EngineError::UnknownService(*id));
            }
            services.push(service);
        }

        let edges = store.list_dependencies(request.project_id).await?;
        let graph = GraphBuilder::build(services.iter().map(GraphNode::from), &edges);
        let order = graph.topological_order()?;
        let ranks = graph.ranks()?;

        let mut releases = HashMap::with_capacity(services.len());
        for service in &services {
            let release = self
                .resolve_release(service.id, request.source_commit.as_deref())
                .await?;
            releases.insert(service.id, release);
        }

        let group = DeploymentGroup {
            id: GroupId::new(),
            project_id: request.project_id,
            environment_id: request.environment_id,
            strategy: request.strategy,
            status: GroupStatus::Pending,
            trigger: request.trigger,
            source_commit: request.source_commit,
            rollback_group_id: None,
            auto_rollback: request
                .auto_rollback
                .unwrap_or(self.inner.config.auto_rollback),
            failure: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        let by_id: HashMap<ServiceId, &Service> = services.iter().map(|s| (s.id, s)).collect();
        let mut deployments = Vec::with_capacity(order.len());
        for (index, service_id) in order.iter().enumerate() {
            let (Some(service), Some(release)) = (by_id.get(service_id), releases.get(service_id))
            else {
                continue;
            };
            let deploy_order = match group.strategy {
                Strategy::Parallel => 0,
                Strategy::Sequential => index as u32,
                Strategy::DependencyOrdered => ranks.get(service_id).copied().unwrap_or(0),
            };
            deployments.push(
                Deployment::pending(
                    service.id,
                    group.environment_id,
                    release.id,
                    service.config.desired_replicas(),
                )
                .in_group(group.id, deploy_order),
            );
        }

        store.create_group(&group, &deployments).await?;

        let actor = trigger_actor(&group.trigger);
        self.inner.audit.group(&group, None, &actor).await;
        for deployment in &deployments {
            self.inner.audit.deployment(deployment, None, &actor).await;
        }
        info!(
            group_id = %group.id,
            strategy = %group.strategy,
            deployments = deployments.len(),
            "Deployment group created"
        );

        self.spawn_group(group.id);
        Ok(group.id)
    }

    /// Aggregated progress of a group.
    pub async fn group_status(&self, id: GroupId) -> Result<GroupProgress, EngineError> {
        let group = self.group(id).await?;
        let deployments = self.inner.store.group_deployments(id).await?;
        Ok(GroupProgress::from_deployments(&group, &deployments))
    }

    /// Stops a running group.
    ///
    /// Deployments not yet started fail with `Cancelled`; in-flight waits are
    /// interrupted. Changes already applied to the cluster stay in place
    /// until a rollback is triggered.
    #[instrument(skip(self))]
    pub async fn cancel_group(&self, id: GroupId) -> Result<(), EngineError> {
        let signal = self.lock_running().get(&id).map(|g| g.signal.clone());
        let Some(signal) = signal else {
            let group = self.group(id).await?;
            return Err(EngineError::InvalidState(format!(
                "group {id} is {} and not running",
                group.status
            )));
        };

        signal.abort(FailureReason::Cancelled);
        let group = self.group(id).await?;
        self.inner
            .audit
            .emit(
                TransitionRecord::builder()
                    .aggregate(AggregateType::DeploymentGroup, id)
                    .event_type(event_types::GROUP_CANCEL_REQUESTED)
                    .actor(ActorType::System, "engine")
                    .transition(Some(group.status), group.status)
                    .group_id(id),
            )
            .await;
        info!("Group cancellation requested");
        Ok(())
    }

    /// Rolls back a failed group by hand.
    #[instrument(skip(self))]
    pub async fn trigger_rollback(&self, id: GroupId) -> Result<RollbackReport, EngineError> {
        let report = self
            .inner
            .rollback
            .rollback(id, &Actor::system("manual-rollback"))
            .await?;
        if let Some(rollback_id) = report.rollback_group_id {
            self.spawn_group(rollback_id);
        }
        Ok(report)
    }

    /// Waits until the group is no longer running and returns its status.
    pub async fn wait_for_group(&self, id: GroupId) -> Result<GroupStatus, EngineError> {
        let done = self.lock_running().get(&id).map(|g| g.done.clone());
        if let Some(mut done) = done {
            if let Ok(status) = done.wait_for(|s| s.is_some()).await {
                if let Some(status) = *status {
                    return Ok(status);
                }
            }
        }
        Ok(self.group(id).await?.status)
    }

    /// Groups of a project, newest first.
    pub async fn list_groups(
        &self,
        project: ProjectId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<DeploymentGroup>, EngineError> {
        Ok(self.inner.store.list_groups(project, limit, offset).await?)
    }

    /// A group's deployments ordered by `deploy_order`.
    pub async fn group_deployments(&self, id: GroupId) -> Result<Vec<Deployment>, EngineError> {
        self.group(id).await?;
        Ok(self.inner.store.group_deployments(id).await?)
    }

    // ---- services, releases, dependencies -------------------------------

    pub async fn register_service(
        &self,
        project_id: ProjectId,
        name: &str,
        build_ref: &str,
        config: ServiceConfig,
    ) -> Result<Service, EngineError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::InvalidState("service name is empty".to_string()));
        }
        let service = Service {
            id: ServiceId::new(),
            project_id,
            name: name.to_string(),
            build_ref: build_ref.to_string(),
            config,
            created_at: Utc::now(),
            deleted_at: None,
        };
        self.inner.store.insert_service(&service).await?;
        self.record(
            TransitionRecord::builder()
                .aggregate(AggregateType::Service, service.id)
                .event_type(event_types::SERVICE_REGISTERED)
                .transition(None::<&str>, "active")
                .detail(service.name.clone()),
        )
        .await;
        info!(service_id = %service.id, name = %service.name, "Service registered");
        Ok(service)
    }

    pub async fn register_environment(
        &self,
        project_id: ProjectId,
        name: &str,
        namespace: &str,
    ) -> Result<Environment, EngineError> {
        let environment = Environment {
            id: EnvId::new(),
            project_id,
            name: name.to_string(),
            namespace: namespace.to_string(),
            created_at: Utc::now(),
        };
        self.inner.store.insert_environment(&environment).await?;
        info!(environment_id = %environment.id, namespace, "Environment registered");
        Ok(environment)
    }

    /// Records a release that is still being built.
    pub async fn record_release(
        &self,
        service_id: ServiceId,
        version: &str,
        source_commit: Option<String>,
    ) -> Result<Release, EngineError> {
        self.live_service(service_id).await?;
        let release = Release {
            id: ReleaseId::new(),
            service_id,
            version: version.to_string(),
            image: None,
            source_commit,
            status: ReleaseStatus::Building,
            created_at: Utc::now(),
            ready_at: None,
        };
        self.inner.store.insert_release(&release).await?;
        self.record(
            TransitionRecord::builder()
                .aggregate(AggregateType::Release, release.id)
                .event_type(event_types::RELEASE_RECORDED)
                .transition(None::<&str>, release.status),
        )
        .await;
        Ok(release)
    }

    /// Attaches the built image and makes the release deployable.
    pub async fn mark_release_ready(
        &self,
        release_id: ReleaseId,
        image: &str,
    ) -> Result<Release, EngineError> {
        let before = self.inner.store.get_release(release_id).await?;
        let release = self
            .inner
            .store
            .mark_release_ready(release_id, image, Utc::now())
            .await?;
        self.record(
            TransitionRecord::builder()
                .aggregate(AggregateType::Release, release.id)
                .event_type(event_types::RELEASE_READY)
                .transition(Some(before.status), release.status)
                .detail(image.to_string()),
        )
        .await;
        Ok(release)
    }

    /// Adds `service -> depends_on`.
    ///
    /// Refuses self-loops, duplicates, edges across projects and edges that
    /// would close a cycle.
    pub async fn add_dependency(
        &self,
        service_id: ServiceId,
        depends_on: ServiceId,
        dependency_type: DependencyType,
    ) -> Result<ServiceDependency, EngineError> {
        if service_id == depends_on {
            return Err(EngineError::InvalidDependency(
                "a service cannot depend on itself".to_string(),
            ));
        }
        let service = self.live_service(service_id).await?;
        let upstream = self.live_service(depends_on).await?;
        if service.project_id != upstream.project_id {
            return Err(EngineError::InvalidDependency(format!(
                "{} and {} belong to different projects",
                service.name, upstream.name
            )));
        }

        let store = &self.inner.store;
        let edges = store.list_dependencies(service.project_id).await?;
        if edges
            .iter()
            .any(|e| e.service_id == service_id && e.depends_on == depends_on)
        {
            return Err(EngineError::InvalidDependency(format!(
                "{} already depends on {}",
                service.name, upstream.name
            )));
        }
        if let Some(path) = would_create_cycle(&edges, service_id, depends_on) {
            let names: HashMap<ServiceId, String> = store
                .list_services(service.project_id)
                .await?
                .into_iter()
                .map(|s| (s.id, s.name))
                .collect();
            let names = path
                .iter()
                .map(|id| names.get(id).cloned().unwrap_or_else(|| id.to_string()))
                .collect();
            return Err(EngineError::CycleDetected { path, names });
        }

        let dependency = ServiceDependency {
            id: DependencyId::new(),
            service_id,
            depends_on,
            dependency_type,
            created_at: Utc::now(),
        };
        store.insert_dependency(&dependency).await?;
        self.record(
            TransitionRecord::builder()
                .aggregate(AggregateType::ServiceDependency, dependency.id)
                .event_type(event_types::DEPENDENCY_ADDED)
                .transition(None::<&str>, dependency_type.as_str())
                .detail(format!("{} -> {}", service.name, upstream.name)),
        )
        .await;
        Ok(dependency)
    }

    /// Returns whether an edge was removed.
    pub async fn remove_dependency(
        &self,
        service_id: ServiceId,
        depends_on: ServiceId,
    ) -> Result<bool, EngineError> {
        let removed = self
            .inner
            .store
            .delete_dependency(service_id, depends_on)
            .await?;
        if removed {
            self.record(
                TransitionRecord::builder()
                    .aggregate(AggregateType::Service, service_id)
                    .event_type(event_types::DEPENDENCY_REMOVED)
                    .transition(None::<&str>, "removed")
                    .detail(format!("{service_id} -> {depends_on}")),
            )
            .await;
        }
        Ok(removed)
    }

    /// Soft-deletes a service and every edge touching it.
    pub async fn delete_service(
        &self,
        service_id: ServiceId,
    ) -> Result<Vec<ServiceDependency>, EngineError> {
        self.live_service(service_id).await?;
        let removed = self
            .inner
            .store
            .delete_service(service_id, Utc::now())
            .await?;
        self.record(
            TransitionRecord::builder()
                .aggregate(AggregateType::Service, service_id)
                .event_type(event_types::SERVICE_DELETED)
                .transition(Some("active"), "deleted")
                .detail(format!("{} edges removed", removed.len())),
        )
        .await;
        Ok(removed)
    }

    /// Edges from `service_id` to what it depends on.
    pub async fn dependencies_of(
        &self,
        service_id: ServiceId,
    ) -> Result<Vec<ServiceDependency>, EngineError> {
        let service = self.live_service(service_id).await?;
        let edges = self.inner.store.list_dependencies(service.project_id).await?;
        Ok(edges
            .into_iter()
            .filter(|e| e.service_id == service_id)
            .collect())
    }

    /// Edges from services that depend on `service_id`.
    pub async fn dependents_of(
        &self,
        service_id: ServiceId,
    ) -> Result<Vec<ServiceDependency>, EngineError> {
        let service = self.live_service(service_id).await?;
        let edges = self.inner.store.list_dependencies(service.project_id).await?;
        Ok(edges
            .into_iter()
            .filter(|e| e.depends_on == service_id)
            .collect())
    }

    /// Stops the workers and every group supervisor.
    ///
    /// Groups stay in the store as they are and resume on the next start.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .lock_running()
            .values_mut()
            .filter_map(|g| g.task.take())
            .collect();
        for task in &tasks {
            task.abort();
        }
        self.inner.pool.shutdown().await;
        info!(groups = tasks.len(), "Engine stopped");
    }

    // ---- internals ------------------------------------------------------

    fn spawn_group(&self, group_id: GroupId) {
        let signal = GroupSignal::new();
        let (done_tx, done_rx) = watch::channel(None);

        // Register before spawning so a fast group cannot finish unregistered.
        let mut running = self.lock_running();
        if running.contains_key(&group_id) {
            return;
        }
        running.insert(
            group_id,
            RunningGroup {
                signal: signal.clone(),
                done: done_rx,
                task: None,
            },
        );
        let engine = self.clone();
        let task = tokio::spawn(async move {
            engine.supervise(group_id, signal, done_tx).await;
        });
        if let Some(entry) = running.get_mut(&group_id) {
            entry.task = Some(task);
        }
    }

    async fn supervise(
        &self,
        group_id: GroupId,
        signal: GroupSignal,
        done: watch::Sender<Option<GroupStatus>>,
    ) {
        match self.inner.groups.run_group(group_id, signal.clone()).await {
            Ok(group) => {
                if group.rollback_group_id.is_some() {
                    if let Err(e) = self.inner.rollback.finalize(&group).await {
                        error!(group_id = %group_id, error = %e, "Failed to finalize rollback");
                    }
                }
                if should_auto_rollback(&group) {
                    self.auto_rollback(&group).await;
                }
                let _ = done.send(Some(group.status));
            }
            Err(e) => {
                error!(group_id = %group_id, error = %e, "Group orchestration aborted");
                // Interrupt whatever is still in flight, then record the failure.
                signal.abort(FailureReason::OrchestrationError);
                let failure = Failure::new(
                    FailureReason::OrchestrationError,
                    format!("orchestration stopped: {e}"),
                );
                match self.inner.groups.fail_group(group_id, failure).await {
                    Ok(group) => {
                        let _ = done.send(Some(group.status));
                    }
                    Err(e) => {
                        error!(group_id = %group_id, error = %e, "Failed to record group failure");
                    }
                }
            }
        }
        self.lock_running().remove(&group_id);
    }

    async fn auto_rollback(&self, group: &DeploymentGroup) {
        match self
            .inner
            .rollback
            .rollback(group.id, &Actor::system("auto-rollback"))
            .await
        {
            Ok(report) => {
                if let Some(rollback_id) = report.rollback_group_id {
                    self.spawn_group(rollback_id);
                }
            }
            Err(e) => {
                warn!(group_id = %group.id, error = %e, "Automatic rollback failed");
            }
        }
    }

    /// Newest ready release built from `commit`, else the newest ready one.
    async fn resolve_release(
        &self,
        service_id: ServiceId,
        commit: Option<&str>,
    ) -> Result<Release, EngineError> {
        let store = &self.inner.store;
        if let Some(commit) = commit {
            if let Some(release) = store.latest_ready_release(service_id, Some(commit)).await? {
                return Ok(release);
            }
        }
        store
            .latest_ready_release(service_id, None)
            .await?
            .ok_or_else(|| EngineError::NoReadyRelease {
                service: service_id,
                commit: commit.map(str::to_string),
            })
    }

    async fn live_service(&self, id: ServiceId) -> Result<Service, EngineError> {
        match self.inner.store.get_service(id).await {
            Ok(service) if !service.is_deleted() => Ok(service),
            Ok(_) => Err(EngineError::UnknownService(id)),
            Err(e) if e.is_not_found() => Err(EngineError::UnknownService(id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn group(&self, id: GroupId) -> Result<DeploymentGroup, EngineError> {
        match self.inner.store.get_group(id).await {
            Ok(group) => Ok(group),
            Err(StoreError::NotFound { .. }) => Err(EngineError::GroupNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn record(&self, builder: TransitionRecordBuilder) {
        self.inner
            .audit
            .emit(builder.actor(ActorType::System, "engine"))
            .await;
    }

    fn lock_running(&self) -> MutexGuard<'_, HashMap<GroupId, RunningGroup>> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn should_auto_rollback(group: &DeploymentGroup) -> bool {
    group.status == GroupStatus::Failed
        && group.auto_rollback
        && group.rollback_group_id.is_none()
        // Cancellation leaves applied changes alone until asked.
        && group.failure.as_ref().map(|f| f.reason) != Some(FailureReason::Cancelled)
}

fn trigger_actor(trigger: &Trigger) -> Actor {
    match trigger.source {
        TriggerSource::Manual => Actor::user(trigger.actor.clone()),
        TriggerSource::Git => Actor {
            actor_type: ActorType::Trigger,
            id: trigger.actor.clone(),
        },
        TriggerSource::Rollback => Actor::system(trigger.actor.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::cluster::MockCluster;
    use crate::db::MemoryStore;

    struct Harness {
        engine: Engine,
        store: Arc<MemoryStore>,
        project: ProjectId,
        environment: Environment,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let config = EngineConfig {
            cluster_rate_per_sec: 10_000,
            cluster_burst: 1_000,
            ..EngineConfig::default()
        };
        let engine = Engine::start(
            config,
            store.clone(),
            Arc::new(MockCluster::new()),
            Audit::new(Arc::new(MemoryAuditSink::new())),
        )
        .await
        .unwrap();
        let project = ProjectId::new();
        let environment = engine
            .register_environment(project, "production", "prod")
            .await
            .unwrap();
        Harness {
            engine,
            store,
            project,
            environment,
        }
    }

    impl Harness {
        async fn service(&self, name: &str) -> Service {
            self.engine
                .register_service(self.project, name, "main", ServiceConfig::default())
                .await
                .unwrap()
        }

        async fn ready_release(&self, service: &Service, version: &str, commit: &str) -> Release {
            let release = self
                .engine
                .record_release(service.id, version, Some(commit.to_string()))
                .await
                .unwrap();
            self.engine
                .mark_release_ready(release.id, &format!("registry.local/{}:{version}", service.name))
                .await
                .unwrap()
        }

        fn request(&self, services: Vec<ServiceId>) -> CreateGroupRequest {
            CreateGroupRequest {
                project_id: self.project,
                environment_id: self.environment.id,
                services,
                strategy: Strategy::DependencyOrdered,
                source_commit: None,
                trigger: Trigger::default(),
                auto_rollback: None,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_group_rejects_empty_request() {
        let h = harness().await;
        let err = h.engine.create_group(h.request(vec![])).await.unwrap_err();
        assert!(matches!(err, EngineError::EmptyGroup));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_service_persists_nothing() {
        let h = harness().await;
        let api = h.service("api").await;
        h.ready_release(&api, "v1", "abc").await;

        let missing = ServiceId::new();
        let err = h
            .engine
            .create_group(h.request(vec![api.id, missing]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownService(id) if id == missing));
        assert_eq!(h.store.deployment_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ready_release_fails_creation() {
        let h = harness().await;
        let api = h.service("api").await;
        h.engine
            .record_release(api.id, "v1", Some("abc".to_string()))
            .await
            .unwrap();

        let err = h
            .engine
            .create_group(h.request(vec![api.id]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoReadyRelease { service, .. } if service == api.id));
        assert_eq!(h.store.deployment_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_resolution_prefers_commit_then_newest() {
        let h = harness().await;
        let api = h.service("api").await;
        let old = h.ready_release(&api, "v1", "aaa").await;
        let new = h.ready_release(&api, "v2", "bbb").await;

        let mut request = h.request(vec![api.id]);
        request.source_commit = Some("aaa".to_string());
        let group = h.engine.create_group(request).await.unwrap();
        assert_eq!(
            h.engine.wait_for_group(group).await.unwrap(),
            GroupStatus::Completed
        );
        let deployments = h.engine.group_deployments(group).await.unwrap();
        assert_eq!(deployments[0].release_id, old.id);

        let mut request = h.request(vec![api.id]);
        request.source_commit = Some("unknown".to_string());
        let group = h.engine.create_group(request).await.unwrap();
        h.engine.wait_for_group(group).await.unwrap();
        let deployments = h.engine.group_deployments(group).await.unwrap();
        assert_eq!(deployments[0].release_id, new.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_services_collapse() {
        let h = harness().await;
        let api = h.service("api").await;
        h.ready_release(&api, "v1", "abc").await;

        let group = h
            .engine
            .create_group(h.request(vec![api.id, api.id]))
            .await
            .unwrap();
        assert_eq!(h.engine.group_deployments(group).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_dependency_refuses_cycles_with_names() {
        let h = harness().await;
        let a = h.service("a").await;
        let b = h.service("b").await;

        h.engine
            .add_dependency(b.id, a.id, DependencyType::Runtime)
            .await
            .unwrap();

        let err = h
            .engine
            .add_dependency(a.id, b.id, DependencyType::Runtime)
            .await
            .unwrap_err();
        match err {
            EngineError::CycleDetected { path, names } => {
                assert_eq!(path, vec![a.id, b.id, a.id]);
                assert_eq!(names, vec!["a", "b", "a"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_dependency_validation() {
        let h = harness().await;
        let a = h.service("a").await;
        let b = h.service("b").await;

        let err = h
            .engine
            .add_dependency(a.id, a.id, DependencyType::Runtime)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDependency(_)));

        h.engine
            .add_dependency(a.id, b.id, DependencyType::Build)
            .await
            .unwrap();
        let err = h
            .engine
            .add_dependency(a.id, b.id, DependencyType::Runtime)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDependency(_)));

        let other = h
            .engine
            .register_service(ProjectId::new(), "c", "main", ServiceConfig::default())
            .await
            .unwrap();
        let err = h
            .engine
            .add_dependency(a.id, other.id, DependencyType::Runtime)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDependency(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependency_queries_and_service_deletion() {
        let h = harness().await;
        let db = h.service("db").await;
        let api = h.service("api").await;
        let web = h.service("web").await;
        h.engine
            .add_dependency(api.id, db.id, DependencyType::Runtime)
            .await
            .unwrap();
        h.engine
            .add_dependency(web.id, api.id, DependencyType::Runtime)
            .await
            .unwrap();

        let ups = h.engine.dependencies_of(api.id).await.unwrap();
        assert_eq!(ups.len(), 1);
        assert_eq!(ups[0].depends_on, db.id);
        let downs = h.engine.dependents_of(api.id).await.unwrap();
        assert_eq!(downs.len(), 1);
        assert_eq!(downs[0].service_id, web.id);

        let removed = h.engine.delete_service(api.id).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(h.engine.dependents_of(db.id).await.unwrap().is_empty());
        assert!(matches!(
            h.engine.dependencies_of(api.id).await.unwrap_err(),
            EngineError::UnknownService(_)
        ));

        assert!(!h.engine.remove_dependency(web.id, api.id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_requires_running_group() {
        let h = harness().await;
        let err = h.engine.cancel_group(GroupId::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::GroupNotFound(_)));

        let api = h.service("api").await;
        h.ready_release(&api, "v1", "abc").await;
        let group = h.engine.create_group(h.request(vec![api.id])).await.unwrap();
        h.engine.wait_for_group(group).await.unwrap();

        let err = h.engine.cancel_group(group).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_status_counts() {
        let h = harness().await;
        let api = h.service("api").await;
        let web = h.service("web").await;
        h.ready_release(&api, "v1", "abc").await;
        h.ready_release(&web, "v1", "abc").await;

        let group = h
            .engine
            .create_group(h.request(vec![api.id, web.id]))
            .await
            .unwrap();
        h.engine.wait_for_group(group).await.unwrap();

        let progress = h.engine.group_status(group).await.unwrap();
        assert_eq!(progress.status, GroupStatus::Completed);
        assert_eq!(progress.total, 2);
        assert_eq!(progress.completed, 2);
        assert_eq!(progress.failed, 0);

        let listed = h.engine.list_groups(h.project, 10, 0).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, group);
    }
}
