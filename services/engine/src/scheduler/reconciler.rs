//! Single-deployment reconciler.
//!
//! Drives one deployment from `pending` to a terminal status:
//!
//! 1. Claim the deployment (`pending -> building`) for this worker
//! 2. Render the manifest from service config, release and environment
//! 3. Apply it, retrying transient cluster errors with backoff
//! 4. Mark it `deploying` and verify the rollout
//! 5. Finish as `healthy` or `failed`
//!
//! Every committed transition is audited and then published on the queue's
//! event bus. A store error aborts the pipeline and leaves the claim in
//! place; the claim sweeper fails the deployment once the claim expires.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use railyard_id::{DeploymentId, WorkerId};
use railyard_reconcile::{BackoffPolicy, RolloutProgress};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::queue::{DeploymentEvent, WorkItem, WorkQueue};
use crate::audit::{Actor, Audit};
use crate::cancel::{not_started, GroupToken};
use crate::cluster::{ApplyOutcome, ClusterApi};
use crate::db::{DeploymentUpdate, Store, StoreError};
use crate::health::{HealthObserver, HealthOutcome, HealthVerifier};
use crate::manifest::{render_manifest, ManifestError, ManifestInput, RenderedManifest};
use crate::model::{Deployment, DeploymentStatus, Failure, FailureReason, HealthState};

/// Executes the reconcile pipeline for dispatched deployments.
pub struct Reconciler {
    store: Arc<dyn Store>,
    cluster: Arc<dyn ClusterApi>,
    verifier: HealthVerifier,
    queue: Arc<WorkQueue>,
    audit: Audit,
    backoff: BackoffPolicy,
    claim_ttl: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        cluster: Arc<dyn ClusterApi>,
        verifier: HealthVerifier,
        queue: Arc<WorkQueue>,
        audit: Audit,
        backoff: BackoffPolicy,
        claim_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cluster,
            verifier,
            queue,
            audit,
            backoff,
            claim_ttl,
        }
    }

    /// Runs the pipeline for one work item.
    ///
    /// Returns the deployment in its final state, or `None` when another
    /// worker or the sweeper settled it first.
    #[instrument(skip_all, fields(deployment_id = %item.deployment_id, worker_id = %worker))]
    pub async fn run(
        &self,
        worker: WorkerId,
        item: WorkItem,
    ) -> Result<Option<Deployment>, StoreError> {
        let WorkItem {
            deployment_id,
            mut token,
        } = item;
        let actor = Actor::system(worker.to_string());

        if let Some(reason) = token.should_start() {
            return self.fail_unstarted(deployment_id, reason, &actor).await;
        }

        let claimed = match self
            .store
            .claim_deployment(deployment_id, worker, claim_deadline(self.claim_ttl))
            .await
        {
            Ok(deployment) => deployment,
            Err(e) if e.is_conflict() => {
                debug!("Deployment already claimed or settled");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        self.committed(&claimed, DeploymentStatus::Pending, &actor).await;

        let manifest = match self.render(&claimed).await? {
            Ok(manifest) => manifest,
            Err(failure) => return self.fail(&claimed, failure, &actor).await,
        };

        let retries = match self.apply(&manifest, &mut token).await {
            Ok(retries) => retries,
            Err(failure) => return self.fail(&claimed, failure, &actor).await,
        };

        let update = DeploymentUpdate::to(DeploymentStatus::Deploying)
            .with_spec_hash(manifest.spec_hash.to_string())
            .with_retry_count(retries);
        let Some(deploying) = self.advance(&claimed, update, &actor).await? else {
            return Ok(None);
        };

        let observer = ProgressObserver {
            store: self.store.clone(),
            queue: self.queue.clone(),
            audit: self.audit.clone(),
            actor: actor.clone(),
            worker,
            claim_ttl: self.claim_ttl,
            current: Mutex::new(deploying),
        };
        let outcome = self
            .verifier
            .verify(&manifest.workload, &mut token, &observer)
            .await;
        let current = observer.current.into_inner();

        match outcome {
            HealthOutcome::Healthy { ready } => {
                let update = DeploymentUpdate::to(DeploymentStatus::Healthy)
                    .with_health(HealthState::Healthy)
                    .with_ready_replicas(ready);
                let healthy = self.advance(&current, update, &actor).await?;
                if let Some(d) = &healthy {
                    info!(ready_replicas = d.ready_replicas, "Deployment healthy");
                }
                Ok(healthy)
            }
            HealthOutcome::Failed(failure) => self.fail(&current, failure, &actor).await,
            HealthOutcome::Aborted(reason) => {
                let failure = Failure::new(reason, "group stopped while the rollout was verified");
                self.fail(&current, failure, &actor).await
            }
        }
    }

    /// Fails a deployment the group no longer wants started.
    async fn fail_unstarted(
        &self,
        id: DeploymentId,
        reason: FailureReason,
        actor: &Actor,
    ) -> Result<Option<Deployment>, StoreError> {
        let update = DeploymentUpdate::failed(not_started(reason));
        match self
            .store
            .transition_deployment(id, DeploymentStatus::Pending, update)
            .await
        {
            Ok(failed) => {
                self.committed(&failed, DeploymentStatus::Pending, actor).await;
                Ok(Some(failed))
            }
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Loads the inputs and renders the manifest.
    ///
    /// The outer result carries store errors, the inner one the failure to
    /// record on the deployment.
    async fn render(
        &self,
        deployment: &Deployment,
    ) -> Result<Result<RenderedManifest, Failure>, StoreError> {
        let service = self.store.get_service(deployment.service_id).await?;
        let release = self.store.get_release(deployment.release_id).await?;
        let environment = self.store.get_environment(deployment.environment_id).await?;

        let input = ManifestInput {
            service: &service,
            release: &release,
            environment: &environment,
            deployment,
        };
        Ok(render_manifest(&input).map_err(|e| {
            let reason = match e {
                ManifestError::MissingImage(_) => FailureReason::ReleaseUnavailable,
                _ => FailureReason::InvalidManifest,
            };
            Failure::new(reason, e.to_string())
        }))
    }

    /// Applies the manifest, returning the number of transient failures
    /// that were retried.
    async fn apply(
        &self,
        manifest: &RenderedManifest,
        token: &mut GroupToken,
    ) -> Result<u32, Failure> {
        let mut budget = self.backoff.budget();
        loop {
            if let Some(reason) = token.abort_reason() {
                return Err(Failure::new(reason, "group stopped before the manifest was applied"));
            }

            match self.cluster.apply(manifest).await {
                Ok(outcome) => {
                    if outcome == ApplyOutcome::Unchanged {
                        debug!(spec_hash = %manifest.spec_hash, "Cluster already holds this spec");
                    }
                    return Ok(budget.failures());
                }
                Err(e) if e.is_transient() => match budget.record_failure() {
                    Some(delay) => {
                        warn!(
                            error = %e,
                            attempt = budget.failures(),
                            delay_ms = delay.as_millis() as u64,
                            "Transient apply failure, retrying"
                        );
                        token.sleep(delay).await.map_err(|reason| {
                            Failure::new(reason, "group stopped while retrying apply")
                        })?;
                    }
                    None => {
                        return Err(Failure::new(
                            FailureReason::ReconcileExhausted,
                            format!("gave up after {} attempts: {e}", budget.failures()),
                        ));
                    }
                },
                Err(e) => {
                    return Err(Failure::new(FailureReason::ClusterRejected, e.to_string()));
                }
            }
        }
    }

    async fn fail(
        &self,
        deployment: &Deployment,
        failure: Failure,
        actor: &Actor,
    ) -> Result<Option<Deployment>, StoreError> {
        warn!(reason = %failure.reason, detail = %failure.detail, "Deployment failed");
        let mut update = DeploymentUpdate::failed(failure);
        if deployment.status.is_applied() {
            update = update.with_health(HealthState::Degraded);
        }
        self.advance(deployment, update, actor).await
    }

    /// Commits a transition from the deployment's current status.
    ///
    /// Losing the compare-and-set means the claim was taken away (expired
    /// and swept); the result is `None` and the worker stops.
    async fn advance(
        &self,
        deployment: &Deployment,
        update: DeploymentUpdate,
        actor: &Actor,
    ) -> Result<Option<Deployment>, StoreError> {
        let from = deployment.status;
        match self
            .store
            .transition_deployment(deployment.id, from, update)
            .await
        {
            Ok(updated) => {
                self.committed(&updated, from, actor).await;
                Ok(Some(updated))
            }
            Err(e) if e.is_conflict() => {
                warn!(error = %e, "Lost the deployment to another writer");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn committed(&self, deployment: &Deployment, from: DeploymentStatus, actor: &Actor) {
        self.audit.deployment(deployment, Some(from), actor).await;
        self.queue.publish(DeploymentEvent::from(deployment));
    }
}

fn claim_deadline(ttl: Duration) -> chrono::DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(15));
    Utc::now() + ttl
}

/// Persists rollout progress and keeps the claim alive while it moves.
struct ProgressObserver {
    store: Arc<dyn Store>,
    queue: Arc<WorkQueue>,
    audit: Audit,
    actor: Actor,
    worker: WorkerId,
    claim_ttl: Duration,
    current: Mutex<Deployment>,
}

#[async_trait]
impl HealthObserver for ProgressObserver {
    async fn on_progress(&self, progress: &RolloutProgress) {
        let mut current = self.current.lock().await;
        let id = current.id;

        if let Err(e) = self.store.record_progress(id, progress.ready).await {
            warn!(deployment_id = %id, error = %e, "Failed to record rollout progress");
        }
        if let Err(e) = self
            .store
            .renew_claim(id, self.worker, claim_deadline(self.claim_ttl))
            .await
        {
            warn!(deployment_id = %id, error = %e, "Failed to renew claim");
        }

        if current.status == DeploymentStatus::Deploying && progress.ready > 0 {
            let update = DeploymentUpdate::to(DeploymentStatus::Running)
                .with_ready_replicas(progress.ready);
            match self
                .store
                .transition_deployment(id, DeploymentStatus::Deploying, update)
                .await
            {
                Ok(running) => {
                    self.audit
                        .deployment(&running, Some(DeploymentStatus::Deploying), &self.actor)
                        .await;
                    self.queue.publish(DeploymentEvent::from(&running));
                    *current = running;
                }
                Err(e) => {
                    warn!(deployment_id = %id, error = %e, "Failed to mark deployment running");
                }
            }
        }
    }
}
