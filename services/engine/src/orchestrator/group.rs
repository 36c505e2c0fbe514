//! Group orchestrator.
//!
//! Sequences the deployments of one group according to its strategy and
//! derives the group's terminal status from theirs. The orchestrator never
//! touches the cluster; it only decides when a deployment is handed to the
//! worker pool, and fails the ones that must never start.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use railyard_id::{DeploymentId, GroupId, ServiceId};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::audit::{Actor, Audit};
use crate::cancel::{not_started, GroupSignal};
use crate::db::{DeploymentUpdate, GroupUpdate, Store};
use crate::error::EngineError;
use crate::graph::{DependencyGraph, GraphBuilder, GraphError, GraphNode};
use crate::model::{
    Deployment, DeploymentGroup, DeploymentStatus, Failure, FailureReason, GroupStatus, Strategy,
};
use crate::scheduler::{DeploymentEvent, WorkQueue, WorkerPool};

const ACTOR: &str = "group-orchestrator";

/// Drives deployment groups to a terminal status.
pub struct GroupOrchestrator {
    store: Arc<dyn Store>,
    pool: Arc<WorkerPool>,
    queue: Arc<WorkQueue>,
    audit: Audit,
    dependency_timeout: Duration,
    group_budget: Duration,
}

impl GroupOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        pool: Arc<WorkerPool>,
        queue: Arc<WorkQueue>,
        audit: Audit,
        dependency_timeout: Duration,
        group_budget: Duration,
    ) -> Self {
        Self {
            store,
            pool,
            queue,
            audit,
            dependency_timeout,
            group_budget,
        }
    }

    /// Runs a group from its current status to `completed` or `failed`.
    ///
    /// Safe to call on a group left unfinished by a previous process: terminal
    /// deployments are kept, pending ones are dispatched again.
    #[instrument(skip_all, fields(group_id = %group_id))]
    pub async fn run_group(
        &self,
        group_id: GroupId,
        signal: GroupSignal,
    ) -> Result<DeploymentGroup, EngineError> {
        let mut group = self.store.get_group(group_id).await?;
        if group.status.is_terminal() {
            return Ok(group);
        }

        if group.status == GroupStatus::Pending {
            if let Some(cycle) = self.find_cycle(&group).await? {
                return self.fail_cyclic(group, cycle).await;
            }
            group = self.advance(&group, GroupUpdate::to(GroupStatus::Building)).await?;
        }
        if group.status == GroupStatus::Building {
            group = self.advance(&group, GroupUpdate::to(GroupStatus::Deploying)).await?;
        }

        info!(strategy = %group.strategy, "Deploying group");
        let timer = self.start_budget_timer(&group, &signal);
        let executed = self.execute(&group, &signal).await;
        timer.abort();
        executed?;

        self.finalize(group, &signal).await
    }

    /// Dispatches the group's deployments per strategy and waits until every
    /// one of them is healthy or failed.
    pub async fn execute(
        &self,
        group: &DeploymentGroup,
        signal: &GroupSignal,
    ) -> Result<(), EngineError> {
        // Subscribe before reading state so no transition falls in between.
        let events = self.queue.subscribe();
        let deployments = self.store.group_deployments(group.id).await?;
        let mut tracker = Tracker::new(self.store.clone(), group.id, deployments, events);

        match group.strategy {
            Strategy::Parallel => self.run_parallel(&mut tracker, signal).await,
            Strategy::Sequential => self.run_sequential(&mut tracker, signal).await,
            Strategy::DependencyOrdered => {
                self.run_dependency_ordered(group, &mut tracker, signal).await
            }
        }
    }

    async fn run_parallel(
        &self,
        tracker: &mut Tracker,
        signal: &GroupSignal,
    ) -> Result<(), EngineError> {
        for id in tracker.pending() {
            match signal.token().should_start() {
                Some(reason) => self.fail_pending(tracker, id, not_started(reason)).await?,
                None => self.pool.submit(id, signal.token()).await?,
            }
        }

        // Everything is dispatched, so a failure stops nothing here. Only an
        // abort (cancel or group budget) keeps queued work from starting.
        while !tracker.all_settled() {
            tracker.changed().await?;
        }
        Ok(())
    }

    async fn run_sequential(
        &self,
        tracker: &mut Tracker,
        signal: &GroupSignal,
    ) -> Result<(), EngineError> {
        let order: Vec<DeploymentId> = tracker.deployments.iter().map(|d| d.id).collect();

        for id in order {
            if tracker.status(id) == Some(DeploymentStatus::Pending) {
                if let Some(reason) = signal.token().should_start() {
                    self.fail_pending(tracker, id, not_started(reason)).await?;
                    continue;
                }
                self.pool.submit(id, signal.token()).await?;
            }

            while !tracker.is_settled(id) {
                tracker.changed().await?;
            }
            if tracker.status(id) == Some(DeploymentStatus::Failed) {
                signal.halt();
            }
        }
        Ok(())
    }

    async fn run_dependency_ordered(
        &self,
        group: &DeploymentGroup,
        tracker: &mut Tracker,
        signal: &GroupSignal,
    ) -> Result<(), EngineError> {
        let graph = self.group_graph(group, &tracker.deployments).await?;
        let by_service: HashMap<ServiceId, DeploymentId> = tracker
            .deployments
            .iter()
            .map(|d| (d.service_id, d.id))
            .collect();
        let mut dispatched: HashMap<DeploymentId, Instant> = HashMap::new();
        let mut token = signal.token();
        let mut aborted = token.abort_reason();

        loop {
            tracker.reload_if_stale().await?;
            let mut next_deadline: Option<Instant> = None;
            let waiting: Vec<Deployment> = tracker
                .deployments
                .iter()
                .filter(|d| d.status == DeploymentStatus::Pending && !dispatched.contains_key(&d.id))
                .cloned()
                .collect();

            for deployment in waiting {
                if let Some(reason) = aborted {
                    self.fail_pending(tracker, deployment.id, not_started(reason))
                        .await?;
                    continue;
                }
                match self.readiness(&graph, &by_service, &dispatched, tracker, &deployment) {
                    Readiness::Ready => {
                        self.pool.submit(deployment.id, signal.token()).await?;
                        dispatched.insert(deployment.id, Instant::now());
                    }
                    Readiness::Blocked(failure) => {
                        self.fail_pending(tracker, deployment.id, failure).await?;
                    }
                    Readiness::Waiting(deadline) => {
                        if let Some(due) = deadline {
                            next_deadline = Some(next_deadline.map_or(due, |d| d.min(due)));
                        }
                    }
                }
            }

            if tracker.all_settled() {
                return Ok(());
            }

            tokio::select! {
                changed = tracker.changed() => changed?,
                reason = token.aborted(), if aborted.is_none() => aborted = Some(reason),
                _ = sleep_until(next_deadline) => {}
            }
        }
    }

    /// Whether every in-group dependency of `deployment` lets it start.
    fn readiness(
        &self,
        graph: &DependencyGraph,
        by_service: &HashMap<ServiceId, DeploymentId>,
        dispatched: &HashMap<DeploymentId, Instant>,
        tracker: &Tracker,
        deployment: &Deployment,
    ) -> Readiness {
        let mut waiting = false;
        let mut deadline: Option<Instant> = None;

        for (upstream, dependency_type) in graph.upstream_of(&deployment.service_id) {
            let Some(upstream_deployment) = by_service
                .get(upstream)
                .and_then(|id| tracker.get(*id))
            else {
                continue;
            };
            if dependency_type.satisfied_by(upstream_deployment.status) {
                continue;
            }

            let name = graph
                .node(upstream)
                .map(|n| n.name.clone())
                .unwrap_or_else(|| upstream.to_string());
            if upstream_deployment.status.is_terminal() {
                return Readiness::Blocked(Failure::new(
                    FailureReason::DependencyFailed,
                    format!("{} dependency {name} failed", dependency_type.as_str()),
                ));
            }

            waiting = true;
            // The clock starts when the upstream is handed to a worker.
            if let Some(started) = dispatched.get(&upstream_deployment.id) {
                let due = *started + self.dependency_timeout;
                if Instant::now() >= due {
                    return Readiness::Blocked(Failure::new(
                        FailureReason::DependencyTimeout,
                        format!(
                            "{} dependency {name} not ready after {}s (status {})",
                            dependency_type.as_str(),
                            self.dependency_timeout.as_secs(),
                            upstream_deployment.status
                        ),
                    ));
                }
                deadline = Some(deadline.map_or(due, |d| d.min(due)));
            }
        }

        if waiting {
            Readiness::Waiting(deadline)
        } else {
            Readiness::Ready
        }
    }

    async fn group_graph(
        &self,
        group: &DeploymentGroup,
        deployments: &[Deployment],
    ) -> Result<DependencyGraph, EngineError> {
        let mut nodes = Vec::with_capacity(deployments.len());
        for deployment in deployments {
            let service = self.store.get_service(deployment.service_id).await?;
            nodes.push(GraphNode::from(&service));
        }
        let edges = self.store.list_dependencies(group.project_id).await?;
        Ok(GraphBuilder::build(nodes, &edges))
    }

    /// Edges may have changed between creation and start.
    async fn find_cycle(&self, group: &DeploymentGroup) -> Result<Option<String>, EngineError> {
        let deployments = self.store.group_deployments(group.id).await?;
        let graph = self.group_graph(group, &deployments).await?;
        match graph.validate_acyclic() {
            Ok(()) => Ok(None),
            Err(GraphError::CycleDetected { names, .. }) => Ok(Some(names.join(" -> "))),
        }
    }

    async fn fail_cyclic(
        &self,
        group: DeploymentGroup,
        cycle: String,
    ) -> Result<DeploymentGroup, EngineError> {
        warn!(cycle = %cycle, "Dependency cycle appeared before the group started");
        let failure = Failure::new(FailureReason::DependencyCycle, format!("dependency cycle: {cycle}"));
        self.fail_unfinished(group, failure).await
    }

    /// Fails a group whose orchestration stopped on an error.
    ///
    /// Deployments that never started are failed too, which releases their
    /// leases. A group that already reached a terminal status is returned
    /// unchanged.
    #[instrument(skip_all, fields(group_id = %group_id))]
    pub async fn fail_group(
        &self,
        group_id: GroupId,
        failure: Failure,
    ) -> Result<DeploymentGroup, EngineError> {
        let group = self.store.get_group(group_id).await?;
        if group.status.is_terminal() {
            return Ok(group);
        }
        warn!(reason = %failure.reason, detail = %failure.detail, "Group failed");
        self.fail_unfinished(group, failure).await
    }

    async fn fail_unfinished(
        &self,
        group: DeploymentGroup,
        failure: Failure,
    ) -> Result<DeploymentGroup, EngineError> {
        let deployments = self.store.group_deployments(group.id).await?;
        let events = self.queue.subscribe();
        let mut tracker = Tracker::new(self.store.clone(), group.id, deployments, events);
        for id in tracker.pending() {
            self.fail_pending(&mut tracker, id, failure.clone()).await?;
        }
        self.advance(&group, GroupUpdate::failed(failure)).await
    }

    async fn finalize(
        &self,
        group: DeploymentGroup,
        signal: &GroupSignal,
    ) -> Result<DeploymentGroup, EngineError> {
        let failure = match signal.abort_reason() {
            Some(reason) => Some(self.abort_failure(reason)),
            None => {
                let deployments = self.store.group_deployments(group.id).await?;
                deployments
                    .iter()
                    .filter(|d| d.status == DeploymentStatus::Failed)
                    .find_map(|d| {
                        d.failure.as_ref().map(|f| {
                            Failure::new(f.reason, format!("deployment {} failed: {}", d.id, f.detail))
                        })
                    })
            }
        };

        let update = match failure {
            Some(failure) => {
                warn!(reason = %failure.reason, detail = %failure.detail, "Group failed");
                GroupUpdate::failed(failure)
            }
            None => {
                info!("Group completed");
                GroupUpdate::to(GroupStatus::Completed)
            }
        };
        self.advance(&group, update).await
    }

    fn abort_failure(&self, reason: FailureReason) -> Failure {
        match reason {
            FailureReason::GroupTimeout => Failure::new(
                reason,
                format!("group exceeded its {}s budget", self.group_budget.as_secs()),
            ),
            FailureReason::Cancelled => Failure::new(reason, "group cancelled"),
            other => Failure::new(other, "group aborted"),
        }
    }

    fn start_budget_timer(&self, group: &DeploymentGroup, signal: &GroupSignal) -> JoinHandle<()> {
        let elapsed = group
            .started_at
            .and_then(|started| (Utc::now() - started).to_std().ok())
            .unwrap_or_default();
        let remaining = self.group_budget.saturating_sub(elapsed);
        let budget_secs = self.group_budget.as_secs();
        let group_id = group.id;
        let signal = signal.clone();

        tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            warn!(group_id = %group_id, budget_secs, "Group exceeded its time budget");
            signal.abort(FailureReason::GroupTimeout);
        })
    }

    async fn fail_pending(
        &self,
        tracker: &mut Tracker,
        id: DeploymentId,
        failure: Failure,
    ) -> Result<(), EngineError> {
        match self
            .store
            .transition_deployment(id, DeploymentStatus::Pending, DeploymentUpdate::failed(failure))
            .await
        {
            Ok(failed) => {
                debug!(deployment_id = %id, reason = ?failed.failure.as_ref().map(|f| f.reason), "Failed deployment before start");
                self.audit
                    .deployment(&failed, Some(DeploymentStatus::Pending), &Actor::system(ACTOR))
                    .await;
                self.queue.publish(DeploymentEvent::from(&failed));
                tracker.record(failed);
                Ok(())
            }
            // A worker got there first.
            Err(e) if e.is_conflict() => tracker.refresh().await,
            Err(e) => Err(e.into()),
        }
    }

    async fn advance(
        &self,
        group: &DeploymentGroup,
        update: GroupUpdate,
    ) -> Result<DeploymentGroup, EngineError> {
        let updated = self
            .store
            .transition_group(group.id, group.status, update)
            .await?;
        self.audit
            .group(&updated, Some(group.status), &Actor::system(ACTOR))
            .await;
        Ok(updated)
    }
}

enum Readiness {
    Ready,
    /// Waiting on upstreams; the earliest dependency deadline, if any
    /// upstream is already running.
    Waiting(Option<Instant>),
    Blocked(Failure),
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Ordering of statuses along the lifecycle. Events that would move a
/// tracked deployment backwards are stale.
fn stage(status: DeploymentStatus) -> u8 {
    match status {
        DeploymentStatus::Pending => 0,
        DeploymentStatus::Building => 1,
        DeploymentStatus::Deploying => 2,
        DeploymentStatus::Running => 3,
        DeploymentStatus::Healthy | DeploymentStatus::Failed => 4,
        DeploymentStatus::RolledBack => 5,
    }
}

/// Local view of a group's deployments, fed by the event bus.
struct Tracker {
    store: Arc<dyn Store>,
    group_id: GroupId,
    events: broadcast::Receiver<DeploymentEvent>,
    deployments: Vec<Deployment>,
    /// Set when events were lost and cleared only by a completed reload.
    stale: bool,
}

impl Tracker {
    fn new(
        store: Arc<dyn Store>,
        group_id: GroupId,
        deployments: Vec<Deployment>,
        events: broadcast::Receiver<DeploymentEvent>,
    ) -> Self {
        Self {
            store,
            group_id,
            events,
            deployments,
            stale: false,
        }
    }

    fn get(&self, id: DeploymentId) -> Option<&Deployment> {
        self.deployments.iter().find(|d| d.id == id)
    }

    fn status(&self, id: DeploymentId) -> Option<DeploymentStatus> {
        self.get(id).map(|d| d.status)
    }

    fn pending(&self) -> Vec<DeploymentId> {
        self.deployments
            .iter()
            .filter(|d| d.status == DeploymentStatus::Pending)
            .map(|d| d.id)
            .collect()
    }

    fn is_settled(&self, id: DeploymentId) -> bool {
        self.status(id).map_or(true, |s| s.is_terminal())
    }

    fn all_settled(&self) -> bool {
        self.deployments.iter().all(|d| d.status.is_terminal())
    }

    /// Takes in a row this process just wrote.
    fn record(&mut self, deployment: Deployment) {
        if let Some(slot) = self.deployments.iter_mut().find(|d| d.id == deployment.id) {
            if stage(deployment.status) >= stage(slot.status) {
                *slot = deployment;
            }
        }
    }

    /// Waits for the next status change of one of the group's deployments.
    ///
    /// Cancel safe: a reload interrupted by the caller is retried on the
    /// next call.
    async fn changed(&mut self) -> Result<(), EngineError> {
        if self.stale {
            return self.refresh().await;
        }
        loop {
            match self.events.recv().await {
                Ok(event) if event.group_id == Some(self.group_id) => {
                    if let Some(slot) = self
                        .deployments
                        .iter_mut()
                        .find(|d| d.id == event.deployment_id)
                    {
                        if stage(event.status) > stage(slot.status) {
                            slot.status = event.status;
                            slot.failure = event.failure;
                            return Ok(());
                        }
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(group_id = %self.group_id, skipped, "Event bus lagged, reloading group");
                    self.stale = true;
                    return self.refresh().await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EngineError::InvalidState(
                        "deployment event bus closed".to_string(),
                    ));
                }
            }
        }
    }

    async fn reload_if_stale(&mut self) -> Result<(), EngineError> {
        if self.stale {
            self.refresh().await?;
        }
        Ok(())
    }

    async fn refresh(&mut self) -> Result<(), EngineError> {
        self.deployments = self.store.group_deployments(self.group_id).await?;
        self.stale = false;
        Ok(())
    }
}
