//! Scripted in-process cluster for testing and development.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use railyard_id::DeploymentId;
use railyard_reconcile::{RolloutProgress, SpecHash};
use serde_json::Value;
use tracing::{debug, info};

use super::{ApplyOutcome, ClusterApi, ClusterError, ContainerIssue, RolloutStatus};
use crate::manifest::{ObjectKind, RenderedManifest, WorkloadRef};

/// How a workload's pods behave after it is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockRollout {
    /// Fully ready on the n-th status read, ramping up before that.
    ReadyAfter(u32),
    /// Pods are created but never become ready.
    Stuck,
    /// Containers keep crashing with the given restart count.
    CrashLoop(u32),
    /// The image cannot be pulled.
    ImagePullError,
    /// The container references missing configuration.
    ConfigError,
}

impl Default for MockRollout {
    fn default() -> Self {
        Self::ReadyAfter(1)
    }
}

/// One apply the mock accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyRecord {
    pub sequence: u64,
    pub namespace: String,
    pub name: String,
    pub deployment_id: DeploymentId,
    pub spec_hash: SpecHash,
    pub outcome: ApplyOutcome,
}

#[derive(Debug)]
struct Workload {
    kind: ObjectKind,
    spec_hash: SpecHash,
    body: Value,
    desired: u32,
    polls: u32,
}

#[derive(Debug, Default)]
struct MockState {
    default_rollout: MockRollout,
    rollouts: HashMap<String, MockRollout>,
    apply_failures: HashMap<String, VecDeque<ClusterError>>,
    workloads: HashMap<(String, String), Workload>,
    applies: Vec<ApplyRecord>,
}

/// Mock cluster.
///
/// Behaviour is keyed by workload name, which is the service name after
/// sanitizing.
pub struct MockCluster {
    state: Mutex<MockState>,
    apply_latency: Duration,
    sequence: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockCluster {
    /// Create a mock cluster where every rollout is ready on the first read.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            apply_latency: Duration::ZERO,
            sequence: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Rollout behaviour for workloads without an explicit script.
    pub fn with_default_rollout(self, rollout: MockRollout) -> Self {
        self.lock().default_rollout = rollout;
        self
    }

    pub fn with_rollout(self, name: &str, rollout: MockRollout) -> Self {
        self.set_rollout(name, rollout);
        self
    }

    /// Time each apply takes.
    pub fn with_apply_latency(mut self, latency: Duration) -> Self {
        self.apply_latency = latency;
        self
    }

    pub fn set_rollout(&self, name: &str, rollout: MockRollout) {
        self.lock().rollouts.insert(name.to_string(), rollout);
    }

    /// Queues errors returned by the next applies of `name`, in order.
    pub fn fail_applies(&self, name: &str, errors: Vec<ClusterError>) {
        self.lock()
            .apply_failures
            .entry(name.to_string())
            .or_default()
            .extend(errors);
    }

    /// Every accepted apply, oldest first.
    pub fn applies(&self) -> Vec<ApplyRecord> {
        self.lock().applies.clone()
    }

    /// Workload names in the order they were first changed.
    pub fn apply_order(&self) -> Vec<String> {
        self.lock()
            .applies
            .iter()
            .filter(|a| a.outcome != ApplyOutcome::Unchanged)
            .map(|a| a.name.clone())
            .collect()
    }

    /// The last applied workload object body.
    pub fn applied_spec(&self, namespace: &str, name: &str) -> Option<Value> {
        self.lock()
            .workloads
            .get(&(namespace.to_string(), name.to_string()))
            .map(|w| w.body.clone())
    }

    /// Highest number of applies that were in progress at once.
    pub fn max_concurrent_applies(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panic while holding the lock only happens in a failing test.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn take_failure(&self, name: &str) -> Option<ClusterError> {
        self.lock()
            .apply_failures
            .get_mut(name)
            .and_then(|queue| queue.pop_front())
    }

    async fn simulate_latency(&self) {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.apply_latency.is_zero() {
            tokio::time::sleep(self.apply_latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn apply(&self, manifest: &RenderedManifest) -> Result<ApplyOutcome, ClusterError> {
        let workload = &manifest.workload;
        if let Some(err) = self.take_failure(&workload.name) {
            debug!(workload = %workload.name, error = %err, "[MOCK] Failing apply");
            return Err(err);
        }

        self.simulate_latency().await;

        let body = manifest
            .objects
            .iter()
            .find(|o| o.kind == workload.kind && o.name == workload.name)
            .map(|o| o.body.clone())
            .ok_or_else(|| {
                ClusterError::Rejected {
                    status: 422,
                    message: format!("manifest has no {} object", workload.kind.as_str()),
                }
            })?;
        let desired = body["spec"]["replicas"].as_u64().unwrap_or(0) as u32;

        let mut state = self.lock();
        let key = (workload.namespace.clone(), workload.name.clone());
        let outcome = match state.workloads.get_mut(&key) {
            Some(existing) if existing.spec_hash == manifest.spec_hash => ApplyOutcome::Unchanged,
            Some(existing) => {
                existing.kind = workload.kind;
                existing.spec_hash = manifest.spec_hash.clone();
                existing.body = body;
                existing.desired = desired;
                existing.polls = 0;
                ApplyOutcome::Configured
            }
            None => {
                state.workloads.insert(
                    key,
                    Workload {
                        kind: workload.kind,
                        spec_hash: manifest.spec_hash.clone(),
                        body,
                        desired,
                        polls: 0,
                    },
                );
                ApplyOutcome::Created
            }
        };

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        state.applies.push(ApplyRecord {
            sequence,
            namespace: workload.namespace.clone(),
            name: workload.name.clone(),
            deployment_id: workload.deployment_id,
            spec_hash: manifest.spec_hash.clone(),
            outcome,
        });

        info!(
            workload = %workload.name,
            namespace = %workload.namespace,
            spec_hash = %manifest.spec_hash.short(),
            outcome = ?outcome,
            "[MOCK] Applied workload"
        );
        Ok(outcome)
    }

    async fn rollout_status(&self, workload: &WorkloadRef) -> Result<RolloutStatus, ClusterError> {
        let mut state = self.lock();
        let rollout = state
            .rollouts
            .get(&workload.name)
            .copied()
            .unwrap_or(state.default_rollout);
        let key = (workload.namespace.clone(), workload.name.clone());
        let current = state
            .workloads
            .get_mut(&key)
            .ok_or_else(|| ClusterError::NotFound(format!("{}/{}", key.0, key.1)))?;
        current.polls += 1;

        let desired = current.desired;
        let pod = format!("{}-{}", workload.name, current.spec_hash.short());
        let issue = |reason: &str, message: &str, restart_count: u32| ContainerIssue {
            pod: pod.clone(),
            container: workload.name.clone(),
            reason: reason.to_string(),
            message: message.to_string(),
            restart_count,
        };

        let stalled = RolloutProgress {
            desired,
            updated: desired,
            ready: 0,
            available: 0,
            observed: true,
        };
        let status = if current.kind == ObjectKind::CronJob {
            RolloutStatus {
                progress: RolloutProgress {
                    observed: true,
                    ..Default::default()
                },
                issues: Vec::new(),
            }
        } else {
            match rollout {
                MockRollout::ReadyAfter(n) => {
                    let ready = if current.polls >= n {
                        desired
                    } else {
                        desired.saturating_mul(current.polls) / n.max(1)
                    };
                    RolloutStatus {
                        progress: RolloutProgress {
                            desired,
                            updated: desired,
                            ready,
                            available: ready,
                            observed: true,
                        },
                        issues: Vec::new(),
                    }
                }
                MockRollout::Stuck => RolloutStatus {
                    progress: stalled,
                    issues: Vec::new(),
                },
                MockRollout::CrashLoop(restarts) => RolloutStatus {
                    progress: stalled,
                    issues: vec![issue(
                        "CrashLoopBackOff",
                        "back-off 5m0s restarting failed container",
                        restarts,
                    )],
                },
                MockRollout::ImagePullError => RolloutStatus {
                    progress: stalled,
                    issues: vec![issue(
                        "ImagePullBackOff",
                        "pull access denied, repository does not exist or may require authorization",
                        0,
                    )],
                },
                MockRollout::ConfigError => RolloutStatus {
                    progress: stalled,
                    issues: vec![issue(
                        "CreateContainerConfigError",
                        "secret \"app-secrets\" not found",
                        0,
                    )],
                },
            }
        };

        debug!(
            workload = %workload.name,
            polls = current.polls,
            ready = status.progress.ready,
            desired,
            "[MOCK] Rollout status"
        );
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ClusterObject;
    use serde_json::json;

    fn manifest(name: &str, replicas: u32, hash: &str) -> RenderedManifest {
        RenderedManifest {
            workload: WorkloadRef {
                kind: ObjectKind::Deployment,
                namespace: "shop".to_string(),
                name: name.to_string(),
                deployment_id: DeploymentId::new(),
            },
            objects: vec![ClusterObject {
                kind: ObjectKind::Deployment,
                namespace: "shop".to_string(),
                name: name.to_string(),
                body: json!({"spec": {"replicas": replicas}}),
            }],
            spec_hash: SpecHash::from_raw(hash),
        }
    }

    #[tokio::test]
    async fn test_apply_is_idempotent_by_hash() {
        let cluster = MockCluster::new();
        let m = manifest("api", 2, "sha256:aaaa");
        assert_eq!(cluster.apply(&m).await.unwrap(), ApplyOutcome::Created);
        assert_eq!(cluster.apply(&m).await.unwrap(), ApplyOutcome::Unchanged);

        let changed = manifest("api", 3, "sha256:bbbb");
        assert_eq!(cluster.apply(&changed).await.unwrap(), ApplyOutcome::Configured);
        assert_eq!(cluster.apply_order(), vec!["api", "api"]);
        assert_eq!(cluster.applies().len(), 3);
        assert_eq!(
            cluster.applied_spec("shop", "api").unwrap()["spec"]["replicas"],
            3
        );
    }

    #[tokio::test]
    async fn test_queued_failures_come_first() {
        let cluster = MockCluster::new();
        cluster.fail_applies("api", vec![ClusterError::Conflict("busy".to_string())]);
        let m = manifest("api", 1, "sha256:aaaa");
        assert!(matches!(cluster.apply(&m).await, Err(ClusterError::Conflict(_))));
        assert_eq!(cluster.apply(&m).await.unwrap(), ApplyOutcome::Created);
    }

    #[tokio::test]
    async fn test_ready_after_ramps_up() {
        let cluster = MockCluster::new().with_rollout("api", MockRollout::ReadyAfter(2));
        let m = manifest("api", 2, "sha256:aaaa");
        cluster.apply(&m).await.unwrap();

        let first = cluster.rollout_status(&m.workload).await.unwrap();
        assert_eq!(first.progress.ready, 1);
        assert!(!first.progress.status().is_converged());

        let second = cluster.rollout_status(&m.workload).await.unwrap();
        assert!(second.progress.status().is_converged());
    }

    #[tokio::test]
    async fn test_crash_loop_reports_issue() {
        let cluster = MockCluster::new().with_rollout("api", MockRollout::CrashLoop(4));
        let m = manifest("api", 1, "sha256:aaaa");
        cluster.apply(&m).await.unwrap();

        let status = cluster.rollout_status(&m.workload).await.unwrap();
        assert_eq!(status.issues[0].reason, "CrashLoopBackOff");
        assert_eq!(status.issues[0].restart_count, 4);
    }

    #[tokio::test]
    async fn test_status_of_unknown_workload() {
        let cluster = MockCluster::new();
        let m = manifest("api", 1, "sha256:aaaa");
        assert!(matches!(
            cluster.rollout_status(&m.workload).await,
            Err(ClusterError::NotFound(_))
        ));
    }
}
