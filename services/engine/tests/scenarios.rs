//! End-to-end group scenarios against the in-memory store and mock cluster.

use std::sync::Arc;
use std::time::Duration;

use railyard_engine::{
    audit::{Audit, MemoryAuditSink},
    cluster::{ClusterError, MockCluster, MockRollout},
    config::EngineConfig,
    db::{MemoryStore, Store},
    model::{
        DependencyType, Deployment, DeploymentStatus, Environment, FailureReason, GroupStatus,
        Release, Service, ServiceConfig, ServiceDependency, Strategy, Trigger, TriggerSource,
    },
    CreateGroupRequest, Engine, EngineError,
};
use railyard_events::event_types;
use railyard_id::{DependencyId, GroupId, ProjectId, WorkerId};

struct World {
    engine: Engine,
    store: Arc<MemoryStore>,
    cluster: Arc<MockCluster>,
    audit: Arc<MemoryAuditSink>,
    project: ProjectId,
    environment: Environment,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,railyard_engine=info".into()),
        )
        .with_test_writer()
        .try_init();
}

/// High cluster rate: the limiter waits on wall-clock time, which paused
/// tests never advance.
fn test_config() -> EngineConfig {
    EngineConfig {
        cluster_rate_per_sec: 10_000,
        cluster_burst: 1_000,
        auto_rollback: false,
        ..EngineConfig::default()
    }
}

async fn world(config: EngineConfig, cluster: MockCluster) -> World {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let cluster = Arc::new(cluster);
    let audit = Arc::new(MemoryAuditSink::new());
    let engine = Engine::start(config, store.clone(), cluster.clone(), Audit::new(audit.clone()))
        .await
        .unwrap();
    let project = ProjectId::new();
    let environment = engine
        .register_environment(project, "production", "prod")
        .await
        .unwrap();
    World {
        engine,
        store,
        cluster,
        audit,
        project,
        environment,
    }
}

impl World {
    async fn service(&self, name: &str) -> Service {
        self.engine
            .register_service(self.project, name, "main", ServiceConfig::default())
            .await
            .unwrap()
    }

    async fn release(&self, service: &Service, version: &str) -> Release {
        let release = self
            .engine
            .record_release(service.id, version, Some(format!("commit-{version}")))
            .await
            .unwrap();
        self.engine
            .mark_release_ready(
                release.id,
                &format!("registry.local/{}:{version}", service.name),
            )
            .await
            .unwrap()
    }

    /// A service with one ready release.
    async fn deployable(&self, name: &str) -> Service {
        let service = self.service(name).await;
        self.release(&service, "v1").await;
        service
    }

    async fn depends(&self, service: &Service, on: &Service) {
        self.engine
            .add_dependency(service.id, on.id, DependencyType::Runtime)
            .await
            .unwrap();
    }

    fn request(&self, services: &[&Service], strategy: Strategy) -> CreateGroupRequest {
        CreateGroupRequest {
            project_id: self.project,
            environment_id: self.environment.id,
            services: services.iter().map(|s| s.id).collect(),
            strategy,
            source_commit: None,
            trigger: Trigger {
                source: TriggerSource::Manual,
                actor: "usr_test".to_string(),
            },
            auto_rollback: None,
        }
    }

    async fn run(&self, request: CreateGroupRequest) -> (GroupId, GroupStatus) {
        let group = self.engine.create_group(request).await.unwrap();
        let status = self.engine.wait_for_group(group).await.unwrap();
        (group, status)
    }

    async fn deployment_of(&self, group: GroupId, service: &Service) -> Deployment {
        self.engine
            .group_deployments(group)
            .await
            .unwrap()
            .into_iter()
            .find(|d| d.service_id == service.id)
            .unwrap()
    }
}

fn reason(deployment: &Deployment) -> Option<FailureReason> {
    deployment.failure.as_ref().map(|f| f.reason)
}

#[tokio::test(start_paused = true)]
async fn parallel_group_with_one_crash_loop_fails_only_that_service() {
    let w = world(
        test_config(),
        MockCluster::new().with_rollout("b", MockRollout::CrashLoop(4)),
    )
    .await;
    let a = w.deployable("a").await;
    let b = w.deployable("b").await;
    let c = w.deployable("c").await;

    let (group, status) = w.run(w.request(&[&a, &b, &c], Strategy::Parallel)).await;
    assert_eq!(status, GroupStatus::Failed);

    let da = w.deployment_of(group, &a).await;
    let db = w.deployment_of(group, &b).await;
    let dc = w.deployment_of(group, &c).await;
    assert_eq!(da.status, DeploymentStatus::Healthy);
    assert_eq!(dc.status, DeploymentStatus::Healthy);
    assert_eq!(db.status, DeploymentStatus::Failed);
    assert_eq!(reason(&db), Some(FailureReason::CrashLoop));

    let progress = w.engine.group_status(group).await.unwrap();
    assert_eq!(progress.total, 3);
    assert_eq!(progress.completed, 2);
    assert_eq!(progress.failed, 1);
    assert_eq!(progress.in_progress, 0);
    assert_eq!(
        progress.failure.map(|f| f.reason),
        Some(FailureReason::CrashLoop)
    );
}

#[tokio::test(start_paused = true)]
async fn parallel_failure_does_not_stop_queued_deployments() {
    // One worker: two of the three deployments sit in the queue while the
    // first one runs.
    let config = EngineConfig {
        worker_pool_size: 1,
        ..test_config()
    };
    let w = world(
        config,
        MockCluster::new().with_rollout("b", MockRollout::CrashLoop(4)),
    )
    .await;
    let b = w.deployable("b").await;
    let a = w.deployable("a").await;
    let c = w.deployable("c").await;

    let (group, status) = w.run(w.request(&[&b, &a, &c], Strategy::Parallel)).await;
    assert_eq!(status, GroupStatus::Failed);

    for service in [&a, &c] {
        let deployment = w.deployment_of(group, service).await;
        assert_eq!(deployment.status, DeploymentStatus::Healthy, "{}", service.name);
        assert_eq!(reason(&deployment), None);
    }
    assert_eq!(
        reason(&w.deployment_of(group, &b).await),
        Some(FailureReason::CrashLoop)
    );
    assert_eq!(w.cluster.apply_order().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn dependency_chain_dispatches_after_upstream_healthy() {
    let w = world(
        test_config(),
        MockCluster::new().with_default_rollout(MockRollout::ReadyAfter(3)),
    )
    .await;
    let a = w.deployable("a").await;
    let b = w.deployable("b").await;
    let c = w.deployable("c").await;
    w.depends(&b, &a).await;
    w.depends(&c, &b).await;

    // Request order deliberately differs from dependency order.
    let (group, status) = w
        .run(w.request(&[&c, &a, &b], Strategy::DependencyOrdered))
        .await;
    assert_eq!(status, GroupStatus::Completed);
    assert_eq!(w.cluster.apply_order(), vec!["a", "b", "c"]);

    let da = w.deployment_of(group, &a).await;
    let db = w.deployment_of(group, &b).await;
    let dc = w.deployment_of(group, &c).await;
    assert_eq!(
        (da.deploy_order, db.deploy_order, dc.deploy_order),
        (Some(0), Some(1), Some(2))
    );
    assert!(db.dispatched_at.unwrap() >= da.finished_at.unwrap());
    assert!(dc.dispatched_at.unwrap() >= db.finished_at.unwrap());
}

#[tokio::test(start_paused = true)]
async fn pool_bounds_concurrent_rollouts() {
    let config = EngineConfig {
        worker_pool_size: 2,
        ..test_config()
    };
    let w = world(
        config,
        MockCluster::new()
            .with_default_rollout(MockRollout::ReadyAfter(2))
            .with_apply_latency(Duration::from_millis(500)),
    )
    .await;
    let mut services = Vec::new();
    for name in ["s1", "s2", "s3", "s4", "s5"] {
        services.push(w.deployable(name).await);
    }
    let refs: Vec<&Service> = services.iter().collect();

    let group = w
        .engine
        .create_group(w.request(&refs, Strategy::Parallel))
        .await
        .unwrap();

    // Sample how many deployments are owned by a worker while the group runs.
    let store = w.store.clone();
    let sampler = tokio::spawn(async move {
        let mut max = 0;
        for _ in 0..600 {
            max = max.max(store.claimed_deployments().await.unwrap().len());
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        max
    });

    assert_eq!(
        w.engine.wait_for_group(group).await.unwrap(),
        GroupStatus::Completed
    );
    let max_claimed = sampler.await.unwrap();
    assert!(max_claimed <= 2, "saw {max_claimed} claimed deployments");
    assert!(w.cluster.max_concurrent_applies() <= 2);
    assert_eq!(w.cluster.apply_order().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn transient_cluster_errors_are_retried() {
    let w = world(test_config(), MockCluster::new()).await;
    let api = w.deployable("api").await;
    w.cluster.fail_applies(
        "api",
        vec![
            ClusterError::Unreachable("connection reset".into()),
            ClusterError::Throttled("slow down".into()),
        ],
    );

    let (group, status) = w.run(w.request(&[&api], Strategy::Parallel)).await;
    assert_eq!(status, GroupStatus::Completed);

    let deployment = w.deployment_of(group, &api).await;
    assert_eq!(deployment.status, DeploymentStatus::Healthy);
    assert_eq!(deployment.retry_count, 2);
    assert_eq!(w.cluster.applies().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cyclic_services_persist_nothing() {
    let w = world(test_config(), MockCluster::new()).await;
    let a = w.deployable("a").await;
    let b = w.deployable("b").await;

    // The engine refuses cyclic edges, so write them behind its back.
    for (service, on) in [(&a, &b), (&b, &a)] {
        w.store
            .insert_dependency(&ServiceDependency {
                id: DependencyId::new(),
                service_id: service.id,
                depends_on: on.id,
                dependency_type: DependencyType::Runtime,
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
    }

    let err = w
        .engine
        .create_group(w.request(&[&a, &b], Strategy::DependencyOrdered))
        .await
        .unwrap_err();
    match err {
        EngineError::CycleDetected { names, .. } => {
            assert_eq!(names.first(), names.last());
            assert!(names.contains(&"a".to_string()));
            assert!(names.contains(&"b".to_string()));
        }
        other => panic!("expected cycle, got {other:?}"),
    }
    assert_eq!(w.store.deployment_count().await, 0);
    assert!(w.engine.list_groups(w.project, 10, 0).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn concurrent_group_for_same_service_is_rejected() {
    let w = world(
        test_config(),
        MockCluster::new().with_rollout("api", MockRollout::Stuck),
    )
    .await;
    let api = w.deployable("api").await;
    let web = w.deployable("web").await;

    let first = w
        .engine
        .create_group(w.request(&[&api], Strategy::Parallel))
        .await
        .unwrap();
    let holder = w.deployment_of(first, &api).await;

    let err = w
        .engine
        .create_group(w.request(&[&web, &api], Strategy::Parallel))
        .await
        .unwrap_err();
    match err {
        EngineError::ConcurrentDeployConflict {
            service,
            deployment,
            ..
        } => {
            assert_eq!(service, api.id);
            assert_eq!(deployment, holder.id);
        }
        other => panic!("expected lease conflict, got {other:?}"),
    }
    // Nothing of the rejected group exists, including the web deployment.
    assert_eq!(w.store.deployment_count().await, 1);
    assert_eq!(
        w.store.lease_holder(api.id, w.environment.id).await,
        Some(holder.id)
    );

    w.engine.cancel_group(first).await.unwrap();
    assert_eq!(
        w.engine.wait_for_group(first).await.unwrap(),
        GroupStatus::Failed
    );
    assert_eq!(w.store.lease_holder(api.id, w.environment.id).await, None);
}

#[tokio::test(start_paused = true)]
async fn manual_rollback_restores_previous_release() {
    let w = world(test_config(), MockCluster::new()).await;
    let a = w.service("a").await;
    let a_v1 = w.release(&a, "v1").await;

    let (first, status) = w.run(w.request(&[&a], Strategy::Parallel)).await;
    assert_eq!(status, GroupStatus::Completed);
    let a_healthy = w.deployment_of(first, &a).await;

    w.release(&a, "v2").await;
    let b = w.deployable("b").await;
    w.cluster.set_rollout("b", MockRollout::CrashLoop(3));

    let (failed, status) = w.run(w.request(&[&a, &b], Strategy::Parallel)).await;
    assert_eq!(status, GroupStatus::Failed);
    assert_eq!(
        w.deployment_of(failed, &a).await.status,
        DeploymentStatus::Healthy
    );

    let report = w.engine.trigger_rollback(failed).await.unwrap();
    assert_eq!(report.restored, vec![a.id]);
    assert_eq!(report.no_rollback_target, vec![b.id]);
    let rollback = report.rollback_group_id.unwrap();

    let group = w.store.get_group(rollback).await.unwrap();
    assert_eq!(group.rollback_group_id, Some(failed));
    assert_eq!(group.strategy, Strategy::Parallel);
    assert_eq!(group.trigger.source, TriggerSource::Rollback);

    let restoring = w.engine.group_deployments(rollback).await.unwrap();
    assert_eq!(restoring.len(), 1);
    assert_eq!(restoring[0].service_id, a.id);
    assert_eq!(restoring[0].release_id, a_v1.id);
    assert_eq!(restoring[0].previous_deployment_id, Some(a_healthy.id));

    assert_eq!(
        w.engine.wait_for_group(rollback).await.unwrap(),
        GroupStatus::Completed
    );
    let failed_group = w.store.get_group(failed).await.unwrap();
    assert_eq!(failed_group.status, GroupStatus::RolledBack);
    assert_eq!(
        w.deployment_of(failed, &a).await.status,
        DeploymentStatus::RolledBack
    );
    // B had nothing to go back to and keeps its failure.
    let db = w.deployment_of(failed, &b).await;
    assert_eq!(db.status, DeploymentStatus::Failed);
    assert_eq!(reason(&db), Some(FailureReason::CrashLoop));

    let flagged = w
        .audit
        .records_for(&failed.to_string())
        .into_iter()
        .filter(|r| r.event_type == event_types::DEPLOYMENT_NO_ROLLBACK_TARGET)
        .count();
    assert_eq!(flagged, 1);

    // A group is compensated at most once.
    assert!(matches!(
        w.engine.trigger_rollback(failed).await.unwrap_err(),
        EngineError::InvalidState(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn failed_group_rolls_back_automatically() {
    let config = EngineConfig {
        auto_rollback: true,
        ..test_config()
    };
    let w = world(config, MockCluster::new()).await;
    let a = w.deployable("a").await;
    let (_, status) = w.run(w.request(&[&a], Strategy::Parallel)).await;
    assert_eq!(status, GroupStatus::Completed);

    w.release(&a, "v2").await;
    let b = w.deployable("b").await;
    w.cluster.set_rollout("b", MockRollout::ImagePullError);

    let (failed, status) = w.run(w.request(&[&a, &b], Strategy::Parallel)).await;
    assert_eq!(status, GroupStatus::Failed);
    assert_eq!(
        reason(&w.deployment_of(failed, &b).await),
        Some(FailureReason::ImagePullFailed)
    );

    // The compensating group is registered before the failed group reports.
    let rollbacks = w.store.rollback_groups_for(failed).await.unwrap();
    assert_eq!(rollbacks.len(), 1);
    let restoring = w.engine.group_deployments(rollbacks[0].id).await.unwrap();
    assert_eq!(restoring.len(), 1);
    assert_eq!(restoring[0].service_id, a.id);

    assert_eq!(
        w.engine.wait_for_group(rollbacks[0].id).await.unwrap(),
        GroupStatus::Completed
    );
    assert_eq!(
        w.store.get_group(failed).await.unwrap().status,
        GroupStatus::RolledBack
    );
}

#[tokio::test(start_paused = true)]
async fn upstream_failure_fails_dependents_without_dispatch() {
    let w = world(
        test_config(),
        MockCluster::new().with_rollout("db", MockRollout::ConfigError),
    )
    .await;
    let db = w.deployable("db").await;
    let api = w.deployable("api").await;
    w.depends(&api, &db).await;

    let (group, status) = w
        .run(w.request(&[&api, &db], Strategy::DependencyOrdered))
        .await;
    assert_eq!(status, GroupStatus::Failed);

    let d_db = w.deployment_of(group, &db).await;
    assert_eq!(reason(&d_db), Some(FailureReason::ContainerConfigError));
    let d_api = w.deployment_of(group, &api).await;
    assert_eq!(d_api.status, DeploymentStatus::Failed);
    assert_eq!(reason(&d_api), Some(FailureReason::DependencyFailed));
    assert!(d_api.dispatched_at.is_none());
    assert_eq!(w.cluster.apply_order(), vec!["db"]);
}

#[tokio::test(start_paused = true)]
async fn stuck_upstream_times_out_its_dependent() {
    let config = EngineConfig {
        dependency_timeout: Duration::from_secs(30),
        ..test_config()
    };
    let w = world(
        config,
        MockCluster::new().with_rollout("db", MockRollout::Stuck),
    )
    .await;
    let db = w.deployable("db").await;
    let api = w.deployable("api").await;
    w.depends(&api, &db).await;

    let (group, status) = w
        .run(w.request(&[&api, &db], Strategy::DependencyOrdered))
        .await;
    assert_eq!(status, GroupStatus::Failed);

    let d_api = w.deployment_of(group, &api).await;
    assert_eq!(d_api.status, DeploymentStatus::Failed);
    assert_eq!(reason(&d_api), Some(FailureReason::DependencyTimeout));
    assert!(d_api.dispatched_at.is_none());
    assert_eq!(
        reason(&w.deployment_of(group, &db).await),
        Some(FailureReason::HealthCheckTimeout)
    );
    assert_eq!(w.cluster.apply_order(), vec!["db"]);
}

#[tokio::test(start_paused = true)]
async fn build_and_deploy_edges_only_wait_for_apply() {
    // base is applied but never becomes healthy.
    let config = EngineConfig {
        health_no_progress_window: Duration::from_secs(60),
        ..test_config()
    };
    let w = world(
        config,
        MockCluster::new().with_rollout("base", MockRollout::Stuck),
    )
    .await;
    let base = w.deployable("base").await;
    let assets = w.deployable("assets").await;
    let migrate = w.deployable("migrate").await;
    let web = w.deployable("web").await;
    w.engine
        .add_dependency(assets.id, base.id, DependencyType::Build)
        .await
        .unwrap();
    w.engine
        .add_dependency(migrate.id, base.id, DependencyType::Deploy)
        .await
        .unwrap();
    w.depends(&web, &base).await;

    let (group, status) = w
        .run(w.request(
            &[&web, &assets, &migrate, &base],
            Strategy::DependencyOrdered,
        ))
        .await;
    assert_eq!(status, GroupStatus::Failed);
    assert_eq!(
        reason(&w.deployment_of(group, &base).await),
        Some(FailureReason::HealthCheckTimeout)
    );

    for service in [&assets, &migrate] {
        let deployment = w.deployment_of(group, service).await;
        assert_eq!(deployment.status, DeploymentStatus::Healthy, "{}", service.name);
    }
    let d_web = w.deployment_of(group, &web).await;
    assert_eq!(reason(&d_web), Some(FailureReason::DependencyFailed));
    assert!(d_web.dispatched_at.is_none());

    let mut applied = w.cluster.apply_order();
    assert_eq!(applied.first().map(String::as_str), Some("base"));
    applied.sort();
    assert_eq!(applied, vec!["assets", "base", "migrate"]);
}

#[tokio::test(start_paused = true)]
async fn sequential_group_halts_after_failure() {
    let w = world(
        test_config(),
        MockCluster::new().with_rollout("b", MockRollout::CrashLoop(5)),
    )
    .await;
    let a = w.deployable("a").await;
    let b = w.deployable("b").await;
    let c = w.deployable("c").await;

    let (group, status) = w.run(w.request(&[&a, &b, &c], Strategy::Sequential)).await;
    assert_eq!(status, GroupStatus::Failed);
    assert_eq!(w.cluster.apply_order(), vec!["a", "b"]);

    let dc = w.deployment_of(group, &c).await;
    assert_eq!(dc.status, DeploymentStatus::Failed);
    assert_eq!(reason(&dc), Some(FailureReason::Halted));
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_pending_work_and_skips_auto_rollback() {
    let config = EngineConfig {
        auto_rollback: true,
        ..test_config()
    };
    let w = world(
        config,
        MockCluster::new().with_rollout("a", MockRollout::Stuck),
    )
    .await;
    let a = w.deployable("a").await;
    let b = w.deployable("b").await;
    w.depends(&b, &a).await;

    let group = w
        .engine
        .create_group(w.request(&[&a, &b], Strategy::DependencyOrdered))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(
        w.deployment_of(group, &a).await.status,
        DeploymentStatus::Deploying
    );

    w.engine.cancel_group(group).await.unwrap();
    assert_eq!(
        w.engine.wait_for_group(group).await.unwrap(),
        GroupStatus::Failed
    );

    let failure = w.store.get_group(group).await.unwrap().failure.unwrap();
    assert_eq!(failure.reason, FailureReason::Cancelled);
    assert_eq!(
        reason(&w.deployment_of(group, &a).await),
        Some(FailureReason::Cancelled)
    );
    let db = w.deployment_of(group, &b).await;
    assert_eq!(reason(&db), Some(FailureReason::Cancelled));
    assert!(db.dispatched_at.is_none());

    assert!(w.store.rollback_groups_for(group).await.unwrap().is_empty());
    let cancel_records = w
        .audit
        .records_for(&group.to_string())
        .into_iter()
        .filter(|r| r.event_type == event_types::GROUP_CANCEL_REQUESTED)
        .count();
    assert_eq!(cancel_records, 1);
}

#[tokio::test(start_paused = true)]
async fn group_budget_forces_failure() {
    let config = EngineConfig {
        group_budget: Duration::from_secs(30),
        ..test_config()
    };
    let w = world(
        config,
        MockCluster::new().with_rollout("api", MockRollout::Stuck),
    )
    .await;
    let api = w.deployable("api").await;

    let (group, status) = w.run(w.request(&[&api], Strategy::Parallel)).await;
    assert_eq!(status, GroupStatus::Failed);

    let failure = w.store.get_group(group).await.unwrap().failure.unwrap();
    assert_eq!(failure.reason, FailureReason::GroupTimeout);
    assert_eq!(
        reason(&w.deployment_of(group, &api).await),
        Some(FailureReason::GroupTimeout)
    );
}

#[tokio::test(start_paused = true)]
async fn stalled_rollout_fails_health_check() {
    let config = EngineConfig {
        health_no_progress_window: Duration::from_secs(60),
        ..test_config()
    };
    let w = world(
        config,
        MockCluster::new().with_rollout("api", MockRollout::Stuck),
    )
    .await;
    let api = w.deployable("api").await;

    let (group, status) = w.run(w.request(&[&api], Strategy::Parallel)).await;
    assert_eq!(status, GroupStatus::Failed);
    assert_eq!(
        reason(&w.deployment_of(group, &api).await),
        Some(FailureReason::HealthCheckTimeout)
    );
}

#[tokio::test(start_paused = true)]
async fn unfinished_groups_resume_on_restart() {
    let w = world(test_config(), MockCluster::new()).await;
    let api = w.deployable("api").await;
    let web = w.deployable("web").await;
    w.depends(&web, &api).await;

    let group = w
        .engine
        .create_group(w.request(&[&api, &web], Strategy::DependencyOrdered))
        .await
        .unwrap();
    // Stop before the group's supervisor ever runs.
    w.engine.shutdown().await;
    assert!(!w.engine.is_running());
    assert_eq!(
        w.store.get_group(group).await.unwrap().status,
        GroupStatus::Pending
    );

    let restarted = Engine::start(
        test_config(),
        w.store.clone(),
        w.cluster.clone(),
        Audit::new(w.audit.clone()),
    )
    .await
    .unwrap();
    assert_eq!(
        restarted.wait_for_group(group).await.unwrap(),
        GroupStatus::Completed
    );
    assert_eq!(w.cluster.apply_order(), vec!["api", "web"]);
    restarted.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn lost_claims_fail_with_worker_lost_on_restart() {
    let w = world(test_config(), MockCluster::new()).await;
    let api = w.deployable("api").await;

    let group = w
        .engine
        .create_group(w.request(&[&api], Strategy::Parallel))
        .await
        .unwrap();
    w.engine.shutdown().await;

    // Simulate a worker that died mid-reconcile.
    let deployment = w.deployment_of(group, &api).await;
    w.store
        .claim_deployment(
            deployment.id,
            WorkerId::new(),
            chrono::Utc::now() + chrono::Duration::minutes(10),
        )
        .await
        .unwrap();

    let restarted = Engine::start(
        test_config(),
        w.store.clone(),
        w.cluster.clone(),
        Audit::new(w.audit.clone()),
    )
    .await
    .unwrap();
    assert_eq!(
        restarted.wait_for_group(group).await.unwrap(),
        GroupStatus::Failed
    );
    assert_eq!(
        reason(&w.deployment_of(group, &api).await),
        Some(FailureReason::WorkerLost)
    );
    assert!(w.cluster.applies().is_empty());
    restarted.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_group_is_reported() {
    let w = world(test_config(), MockCluster::new()).await;
    let missing = GroupId::new();
    assert!(matches!(
        w.engine.group_status(missing).await.unwrap_err(),
        EngineError::GroupNotFound(id) if id == missing
    ));
    assert!(matches!(
        w.engine.trigger_rollback(missing).await.unwrap_err(),
        EngineError::GroupNotFound(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn store_failure_during_dispatch_fails_the_group() {
    let w = world(test_config(), MockCluster::new()).await;
    let api = w.deployable("api").await;
    w.store.refuse_dispatch_records();

    let (group, status) = w.run(w.request(&[&api], Strategy::Parallel)).await;
    assert_eq!(status, GroupStatus::Failed);

    let stored = w.store.get_group(group).await.unwrap();
    assert_eq!(stored.status, GroupStatus::Failed);
    assert_eq!(
        stored.failure.map(|f| f.reason),
        Some(FailureReason::OrchestrationError)
    );
    assert!(stored.completed_at.is_some());

    let deployment = w.deployment_of(group, &api).await;
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert_eq!(reason(&deployment), Some(FailureReason::OrchestrationError));
    assert_eq!(
        w.store.lease_holder(api.id, w.environment.id).await,
        None
    );
    assert!(w.cluster.applies().is_empty());
    assert!(matches!(
        w.engine.cancel_group(group).await.unwrap_err(),
        EngineError::InvalidState(_)
    ));
}
