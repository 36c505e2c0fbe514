//! Rollback orchestrator.
//!
//! Compensates a failed group by redeploying, for every service the failed
//! group actually applied, the release of that service's last healthy
//! deployment from another group. Rollback is best-effort: services without
//! such a deployment are reported and left alone.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use railyard_events::{event_types, AggregateType, TransitionRecord};
use railyard_id::{DeploymentId, GroupId, ServiceId};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::audit::{Actor, Audit};
use crate::db::{DeploymentUpdate, GroupUpdate, Store};
use crate::error::EngineError;
use crate::model::{
    Deployment, DeploymentGroup, DeploymentStatus, GroupStatus, Strategy, Trigger, TriggerSource,
};

/// A service that will be restored.
#[derive(Debug, Clone)]
pub struct RollbackTarget {
    pub service_id: ServiceId,
    /// The deployment of the failed group being compensated.
    pub failed_deployment_id: DeploymentId,
    /// The last healthy deployment to restore.
    pub previous: Deployment,
}

/// What a rollback would do.
#[derive(Debug, Clone)]
pub struct RollbackPlan {
    pub failed_group: DeploymentGroup,
    pub targets: Vec<RollbackTarget>,
    pub no_rollback_target: Vec<ServiceId>,
}

/// What a rollback did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    pub failed_group_id: GroupId,
    /// `None` when no service had anything to restore.
    pub rollback_group_id: Option<GroupId>,
    pub restored: Vec<ServiceId>,
    pub no_rollback_target: Vec<ServiceId>,
}

pub struct RollbackOrchestrator {
    store: Arc<dyn Store>,
    audit: Audit,
}

impl RollbackOrchestrator {
    pub fn new(store: Arc<dyn Store>, audit: Audit) -> Self {
        Self { store, audit }
    }

    /// Works out the restore target of every applied service.
    pub async fn plan(&self, group_id: GroupId) -> Result<RollbackPlan, EngineError> {
        let failed_group = self
            .store
            .get_group(group_id)
            .await
            .map_err(|e| not_found_as_group(e, group_id))?;
        if failed_group.status != GroupStatus::Failed {
            return Err(EngineError::InvalidState(format!(
                "group {} is {}, only failed groups can be rolled back",
                group_id, failed_group.status
            )));
        }
        if !self.store.rollback_groups_for(group_id).await?.is_empty() {
            return Err(EngineError::InvalidState(format!(
                "group {group_id} already has a rollback group"
            )));
        }

        let mut targets = Vec::new();
        let mut no_rollback_target = Vec::new();
        for deployment in self.store.group_deployments(group_id).await? {
            // Never applied: nothing on the cluster to undo.
            if !deployment.was_applied() {
                continue;
            }
            let previous = self
                .store
                .latest_healthy_deployment(
                    deployment.service_id,
                    deployment.environment_id,
                    group_id,
                    deployment.created_at,
                )
                .await?;
            match previous {
                Some(previous) => targets.push(RollbackTarget {
                    service_id: deployment.service_id,
                    failed_deployment_id: deployment.id,
                    previous,
                }),
                None => no_rollback_target.push(deployment.service_id),
            }
        }

        Ok(RollbackPlan {
            failed_group,
            targets,
            no_rollback_target,
        })
    }

    /// Creates the compensating group. The caller runs it.
    #[instrument(skip_all, fields(group_id = %group_id))]
    pub async fn rollback(
        &self,
        group_id: GroupId,
        actor: &Actor,
    ) -> Result<RollbackReport, EngineError> {
        let plan = self.plan(group_id).await?;
        let failed = &plan.failed_group;

        for service_id in &plan.no_rollback_target {
            warn!(service_id = %service_id, "No healthy deployment to roll back to");
            self.audit
                .emit(
                    TransitionRecord::builder()
                        .aggregate(AggregateType::DeploymentGroup, failed.id)
                        .event_type(event_types::DEPLOYMENT_NO_ROLLBACK_TARGET)
                        .actor(actor.actor_type, actor.id.clone())
                        .transition(Some(failed.status), failed.status)
                        .reason("NoRollbackTarget")
                        .detail(format!("service {service_id} has no prior healthy deployment"))
                        .group_id(failed.id),
                )
                .await;
        }

        let restored: Vec<ServiceId> = plan.targets.iter().map(|t| t.service_id).collect();
        if plan.targets.is_empty() {
            info!("Nothing to roll back");
            return Ok(RollbackReport {
                failed_group_id: failed.id,
                rollback_group_id: None,
                restored,
                no_rollback_target: plan.no_rollback_target,
            });
        }

        let group = DeploymentGroup {
            id: GroupId::new(),
            project_id: failed.project_id,
            environment_id: failed.environment_id,
            strategy: Strategy::Parallel,
            status: GroupStatus::Pending,
            trigger: Trigger {
                source: TriggerSource::Rollback,
                actor: actor.id.clone(),
            },
            source_commit: None,
            rollback_group_id: Some(failed.id),
            auto_rollback: false,
            failure: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let deployments: Vec<Deployment> = plan
            .targets
            .iter()
            .map(|target| {
                Deployment::pending(
                    target.service_id,
                    failed.environment_id,
                    target.previous.release_id,
                    target.previous.desired_replicas,
                )
                .in_group(group.id, 0)
                .restoring(target.previous.id)
            })
            .collect();

        self.store.create_group(&group, &deployments).await?;

        self.audit
            .emit(
                TransitionRecord::builder()
                    .aggregate(AggregateType::DeploymentGroup, failed.id)
                    .event_type(event_types::GROUP_ROLLBACK_REQUESTED)
                    .actor(actor.actor_type, actor.id.clone())
                    .transition(Some(failed.status), failed.status)
                    .detail(format!("compensating group {}", group.id))
                    .group_id(failed.id),
            )
            .await;
        self.audit.group(&group, None, actor).await;
        for deployment in &deployments {
            self.audit.deployment(deployment, None, actor).await;
        }

        info!(
            rollback_group_id = %group.id,
            restored = restored.len(),
            skipped = plan.no_rollback_target.len(),
            "Rollback group created"
        );
        Ok(RollbackReport {
            failed_group_id: failed.id,
            rollback_group_id: Some(group.id),
            restored,
            no_rollback_target: plan.no_rollback_target,
        })
    }

    /// Records the outcome of a finished compensating group.
    ///
    /// On success the failed group and every deployment it had for a
    /// restored service become `rolled_back`. A failed compensating group
    /// leaves the original untouched.
    pub async fn finalize(&self, compensating: &DeploymentGroup) -> Result<(), EngineError> {
        let Some(failed_id) = compensating.rollback_group_id else {
            return Ok(());
        };
        if compensating.status != GroupStatus::Completed {
            warn!(
                group_id = %failed_id,
                rollback_group_id = %compensating.id,
                status = %compensating.status,
                "Rollback did not complete"
            );
            return Ok(());
        }

        let actor = Actor::system("rollback-orchestrator");
        let restored: HashSet<ServiceId> = self
            .store
            .group_deployments(compensating.id)
            .await?
            .into_iter()
            .filter(|d| d.status == DeploymentStatus::Healthy)
            .map(|d| d.service_id)
            .collect();

        for deployment in self.store.group_deployments(failed_id).await? {
            if !restored.contains(&deployment.service_id)
                || !deployment.status.can_transition_to(DeploymentStatus::RolledBack)
            {
                continue;
            }
            let from = deployment.status;
            let rolled_back = self
                .store
                .transition_deployment(
                    deployment.id,
                    from,
                    DeploymentUpdate::to(DeploymentStatus::RolledBack),
                )
                .await?;
            self.audit.deployment(&rolled_back, Some(from), &actor).await;
        }

        let failed = self.store.get_group(failed_id).await?;
        if failed.status == GroupStatus::Failed {
            let updated = self
                .store
                .transition_group(failed_id, GroupStatus::Failed, GroupUpdate::to(GroupStatus::RolledBack))
                .await?;
            self.audit
                .group(&updated, Some(GroupStatus::Failed), &actor)
                .await;
            info!(group_id = %failed_id, rollback_group_id = %compensating.id, "Group rolled back");
        }
        Ok(())
    }
}

fn not_found_as_group(err: crate::db::StoreError, id: GroupId) -> EngineError {
    if err.is_not_found() {
        EngineError::GroupNotFound(id)
    } else {
        err.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::db::MemoryStore;
    use crate::model::{Failure, FailureReason};
    use railyard_id::{EnvId, ProjectId, ReleaseId};

    struct Fixture {
        store: Arc<MemoryStore>,
        sink: Arc<MemoryAuditSink>,
        rollback: RollbackOrchestrator,
        project: ProjectId,
        env: EnvId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemoryAuditSink::new());
        let rollback = RollbackOrchestrator::new(store.clone(), Audit::new(sink.clone()));
        Fixture {
            store,
            sink,
            rollback,
            project: ProjectId::new(),
            env: EnvId::new(),
        }
    }

    fn group(f: &Fixture) -> DeploymentGroup {
        DeploymentGroup {
            id: GroupId::new(),
            project_id: f.project,
            environment_id: f.env,
            strategy: Strategy::Parallel,
            status: GroupStatus::Pending,
            trigger: Trigger::default(),
            source_commit: None,
            rollback_group_id: None,
            auto_rollback: true,
            failure: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Walks a group and its deployments to the given end states.
    async fn settle(
        f: &Fixture,
        group: &DeploymentGroup,
        deployments: &[(Deployment, DeploymentStatus)],
    ) {
        let rows: Vec<Deployment> = deployments.iter().map(|(d, _)| d.clone()).collect();
        f.store.create_group(group, &rows).await.unwrap();
        f.store
            .transition_group(group.id, GroupStatus::Pending, GroupUpdate::to(GroupStatus::Building))
            .await
            .unwrap();
        f.store
            .transition_group(group.id, GroupStatus::Building, GroupUpdate::to(GroupStatus::Deploying))
            .await
            .unwrap();

        let mut any_failed = false;
        for (deployment, end) in deployments {
            let s = &f.store;
            s.claim_deployment(deployment.id, railyard_id::WorkerId::new(), Utc::now())
                .await
                .unwrap();
            s.transition_deployment(
                deployment.id,
                DeploymentStatus::Building,
                DeploymentUpdate::to(DeploymentStatus::Deploying),
            )
            .await
            .unwrap();
            let update = match end {
                DeploymentStatus::Healthy => DeploymentUpdate::to(DeploymentStatus::Healthy),
                _ => {
                    any_failed = true;
                    DeploymentUpdate::failed(Failure::new(FailureReason::CrashLoop, "restarts=5"))
                }
            };
            s.transition_deployment(deployment.id, DeploymentStatus::Deploying, update)
                .await
                .unwrap();
        }

        let update = if any_failed {
            GroupUpdate::failed(Failure::new(FailureReason::CrashLoop, "b failed"))
        } else {
            GroupUpdate::to(GroupStatus::Completed)
        };
        f.store
            .transition_group(group.id, GroupStatus::Deploying, update)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rollback_restores_prior_release_and_flags_missing_target() {
        let f = fixture();
        let a = ServiceId::new();
        let b = ServiceId::new();
        let a_v1 = ReleaseId::new();

        // A was healthy on v1 in an earlier group.
        let first = group(&f);
        let a_first = Deployment::pending(a, f.env, a_v1, 2).in_group(first.id, 0);
        settle(&f, &first, &[(a_first.clone(), DeploymentStatus::Healthy)]).await;

        // Then A (v2) succeeded and B failed together.
        let second = group(&f);
        let a_second = Deployment::pending(a, f.env, ReleaseId::new(), 2).in_group(second.id, 0);
        let b_second = Deployment::pending(b, f.env, ReleaseId::new(), 1).in_group(second.id, 0);
        settle(
            &f,
            &second,
            &[
                (a_second.clone(), DeploymentStatus::Healthy),
                (b_second.clone(), DeploymentStatus::Failed),
            ],
        )
        .await;

        let report = f
            .rollback
            .rollback(second.id, &Actor::user("usr_1"))
            .await
            .unwrap();
        assert_eq!(report.restored, vec![a]);
        assert_eq!(report.no_rollback_target, vec![b]);

        let rollback_id = report.rollback_group_id.unwrap();
        let compensating = f.store.get_group(rollback_id).await.unwrap();
        assert_eq!(compensating.rollback_group_id, Some(second.id));
        assert_eq!(compensating.strategy, Strategy::Parallel);
        assert!(!compensating.auto_rollback);

        let rows = f.store.group_deployments(rollback_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].service_id, a);
        assert_eq!(rows[0].release_id, a_v1);
        assert_eq!(rows[0].previous_deployment_id, Some(a_first.id));

        let flagged: Vec<_> = f
            .sink
            .records()
            .into_iter()
            .filter(|r| r.event_type == event_types::DEPLOYMENT_NO_ROLLBACK_TARGET)
            .collect();
        assert_eq!(flagged.len(), 1);

        // A second rollback of the same group is refused.
        let err = f
            .rollback
            .rollback(second.id, &Actor::user("usr_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_finalize_marks_group_rolled_back() {
        let f = fixture();
        let a = ServiceId::new();

        let first = group(&f);
        let a_first = Deployment::pending(a, f.env, ReleaseId::new(), 1).in_group(first.id, 0);
        settle(&f, &first, &[(a_first, DeploymentStatus::Healthy)]).await;

        let second = group(&f);
        let a_second = Deployment::pending(a, f.env, ReleaseId::new(), 1).in_group(second.id, 0);
        settle(&f, &second, &[(a_second.clone(), DeploymentStatus::Failed)]).await;

        let report = f
            .rollback
            .rollback(second.id, &Actor::system("engine"))
            .await
            .unwrap();
        let compensating = f
            .store
            .get_group(report.rollback_group_id.unwrap())
            .await
            .unwrap();
        // Run the compensating group to completion by hand.
        for deployment in f.store.group_deployments(compensating.id).await.unwrap() {
            f.store
                .claim_deployment(deployment.id, railyard_id::WorkerId::new(), Utc::now())
                .await
                .unwrap();
            f.store
                .transition_deployment(
                    deployment.id,
                    DeploymentStatus::Building,
                    DeploymentUpdate::to(DeploymentStatus::Deploying),
                )
                .await
                .unwrap();
            f.store
                .transition_deployment(
                    deployment.id,
                    DeploymentStatus::Deploying,
                    DeploymentUpdate::to(DeploymentStatus::Healthy),
                )
                .await
                .unwrap();
        }
        for (from, to) in [
            (GroupStatus::Pending, GroupStatus::Building),
            (GroupStatus::Building, GroupStatus::Deploying),
            (GroupStatus::Deploying, GroupStatus::Completed),
        ] {
            f.store
                .transition_group(compensating.id, from, GroupUpdate::to(to))
                .await
                .unwrap();
        }
        let compensating = f.store.get_group(compensating.id).await.unwrap();

        f.rollback.finalize(&compensating).await.unwrap();

        assert_eq!(
            f.store.get_group(second.id).await.unwrap().status,
            GroupStatus::RolledBack
        );
        let original = f.store.get_deployment(a_second.id).await.unwrap();
        assert_eq!(original.status, DeploymentStatus::RolledBack);
        assert!(original.failure.is_some());
    }

    #[tokio::test]
    async fn test_rollback_requires_failed_group() {
        let f = fixture();
        let g = group(&f);
        let d = Deployment::pending(ServiceId::new(), f.env, ReleaseId::new(), 1).in_group(g.id, 0);
        settle(&f, &g, &[(d, DeploymentStatus::Healthy)]).await;

        let err = f.rollback.plan(g.id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));

        let err = f.rollback.plan(GroupId::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::GroupNotFound(_)));
    }
}
