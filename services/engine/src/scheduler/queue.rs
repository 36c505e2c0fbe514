//! Persistence-backed queue of dispatched deployments.

use std::sync::Arc;

use chrono::Utc;
use railyard_id::{DeploymentId, GroupId};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::audit::{Actor, Audit};
use crate::cancel::GroupToken;
use crate::db::{DeploymentUpdate, Store, StoreError};
use crate::model::{Deployment, DeploymentGroup, DeploymentStatus, Failure, FailureReason};

const EVENT_CAPACITY: usize = 1024;

/// A committed deployment status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentEvent {
    pub deployment_id: DeploymentId,
    pub group_id: Option<GroupId>,
    pub status: DeploymentStatus,
    pub failure: Option<Failure>,
}

impl From<&Deployment> for DeploymentEvent {
    fn from(deployment: &Deployment) -> Self {
        Self {
            deployment_id: deployment.id,
            group_id: deployment.group_id,
            status: deployment.status,
            failure: deployment.failure.clone(),
        }
    }
}

/// One unit of work handed to a worker.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub deployment_id: DeploymentId,
    /// Stop signal of the group the deployment belongs to.
    pub token: GroupToken,
}

/// Queue of deployments waiting for a worker, plus the outcome bus.
///
/// Every status change committed by a worker or an orchestrator is
/// published on the bus after the write, so subscribers never observe a
/// status the store does not have yet.
pub struct WorkQueue {
    store: Arc<dyn Store>,
    audit: Audit,
    tx: mpsc::UnboundedSender<WorkItem>,
    rx: Mutex<mpsc::UnboundedReceiver<WorkItem>>,
    events: broadcast::Sender<DeploymentEvent>,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn Store>, audit: Audit) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            audit,
            tx,
            rx: Mutex::new(rx),
            events,
        }
    }

    /// Records the dispatch and makes the deployment available to workers.
    pub async fn enqueue(
        &self,
        deployment_id: DeploymentId,
        token: GroupToken,
    ) -> Result<(), StoreError> {
        self.store.mark_dispatched(deployment_id, Utc::now()).await?;
        debug!(deployment_id = %deployment_id, "Deployment dispatched");
        // The receiver lives as long as the queue.
        let _ = self.tx.send(WorkItem {
            deployment_id,
            token,
        });
        Ok(())
    }

    /// Waits for the next dispatched deployment.
    pub async fn next(&self) -> Option<WorkItem> {
        self.rx.lock().await.recv().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.events.subscribe()
    }

    /// Announces a committed transition.
    pub fn publish(&self, event: DeploymentEvent) {
        // No subscribers is fine: nobody is waiting on this group.
        let _ = self.events.send(event);
    }

    /// Fails deployments whose worker is gone. Returns how many were failed.
    pub async fn fail_lost(&self, deployments: Vec<Deployment>, detail: &str) -> usize {
        let mut failed = 0;
        for deployment in deployments {
            let from = deployment.status;
            let update = DeploymentUpdate::failed(Failure::new(
                FailureReason::WorkerLost,
                format!(
                    "{detail} (claimed by {})",
                    deployment
                        .claimed_by
                        .map(|w| w.to_string())
                        .unwrap_or_else(|| "nobody".to_string())
                ),
            ));
            match self.store.transition_deployment(deployment.id, from, update).await {
                Ok(updated) => {
                    warn!(
                        deployment_id = %updated.id,
                        from = %from,
                        "Failed deployment with lost worker"
                    );
                    self.audit
                        .deployment(&updated, Some(from), &Actor::system("claim-sweeper"))
                        .await;
                    self.publish(DeploymentEvent::from(&updated));
                    failed += 1;
                }
                // The worker finished it after all.
                Err(e) if e.is_conflict() => {
                    debug!(deployment_id = %deployment.id, "Lost claim already settled");
                }
                Err(e) => {
                    warn!(deployment_id = %deployment.id, error = %e, "Failed to fail lost deployment");
                }
            }
        }
        failed
    }

    /// Rebuilds queue state after a restart.
    ///
    /// Deployments that were claimed by a worker of the previous process
    /// cannot be resumed mid-apply and are failed with `WorkerLost`. Returns
    /// the groups that still need orchestration; their pending deployments
    /// are dispatched again when the groups are resumed.
    pub async fn recover(&self) -> Result<Vec<DeploymentGroup>, StoreError> {
        let claimed = self.store.claimed_deployments().await?;
        let lost = self
            .fail_lost(claimed, "engine restarted while the deployment was in flight")
            .await;
        let groups = self.store.unfinished_groups().await?;
        info!(
            lost_deployments = lost,
            unfinished_groups = groups.len(),
            "Work queue recovered"
        );
        Ok(groups)
    }
}
