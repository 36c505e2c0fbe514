//! Rollout health verification.
//!
//! After a manifest is applied the verifier polls rollout status until the
//! workload is fully ready, stops making progress for a bounded window, or
//! reports a container condition that will never heal on its own.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use railyard_reconcile::RolloutProgress;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::GroupToken;
use crate::cluster::{ClusterApi, ContainerIssue};
use crate::manifest::WorkloadRef;
use crate::model::{Failure, FailureReason};

/// Result of verifying one rollout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy { ready: u32 },
    Failed(Failure),
    /// The group was aborted while waiting.
    Aborted(FailureReason),
}

/// Receives rollout snapshots whenever they move forward.
#[async_trait]
pub trait HealthObserver: Send + Sync {
    async fn on_progress(&self, progress: &RolloutProgress);
}

/// Polls rollout status for one workload at a time.
#[derive(Clone)]
pub struct HealthVerifier {
    cluster: Arc<dyn ClusterApi>,
    poll_interval: Duration,
    window: Duration,
}

impl HealthVerifier {
    /// `window` is how long a rollout may go without any counter moving.
    pub fn new(cluster: Arc<dyn ClusterApi>, poll_interval: Duration, window: Duration) -> Self {
        Self {
            cluster,
            poll_interval,
            window,
        }
    }

    /// Waits until the rollout settles one way or the other.
    pub async fn verify(
        &self,
        workload: &WorkloadRef,
        token: &mut GroupToken,
        observer: &dyn HealthObserver,
    ) -> HealthOutcome {
        let mut last: Option<RolloutProgress> = None;
        let mut last_progress_at = Instant::now();

        loop {
            match self.cluster.rollout_status(workload).await {
                Ok(status) => {
                    if let Some(failure) = classify_issues(&status.issues) {
                        warn!(
                            workload = %workload.name,
                            reason = %failure.reason,
                            "Fatal container condition"
                        );
                        return HealthOutcome::Failed(failure);
                    }

                    let progress = status.progress;
                    let advanced = last.map_or(true, |prev| progress.advanced_since(&prev));
                    if advanced {
                        last_progress_at = Instant::now();
                        observer.on_progress(&progress).await;
                    }
                    last = Some(progress);

                    if progress.status().is_converged() {
                        info!(
                            workload = %workload.name,
                            ready = progress.ready,
                            "Rollout converged"
                        );
                        return HealthOutcome::Healthy {
                            ready: progress.ready,
                        };
                    }
                    debug!(
                        workload = %workload.name,
                        desired = progress.desired,
                        updated = progress.updated,
                        ready = progress.ready,
                        "Rollout in progress"
                    );
                }
                // Status reads are eventually consistent; an error is just
                // a poll without progress.
                Err(e) => {
                    warn!(workload = %workload.name, error = %e, "Failed to read rollout status");
                }
            }

            if last_progress_at.elapsed() >= self.window {
                let detail = match last {
                    Some(p) => format!(
                        "no rollout progress for {}s: {}/{} ready, {}/{} updated",
                        self.window.as_secs(),
                        p.ready,
                        p.desired,
                        p.updated,
                        p.desired
                    ),
                    None => format!(
                        "rollout status unavailable for {}s",
                        self.window.as_secs()
                    ),
                };
                return HealthOutcome::Failed(Failure::new(FailureReason::HealthCheckTimeout, detail));
            }

            if let Err(reason) = token.sleep(self.poll_interval).await {
                return HealthOutcome::Aborted(reason);
            }
        }
    }
}

/// Maps container waiting reasons that never recover by themselves.
pub fn classify_issues(issues: &[ContainerIssue]) -> Option<Failure> {
    issues.iter().find_map(|issue| {
        let reason = match issue.reason.as_str() {
            "CrashLoopBackOff" => FailureReason::CrashLoop,
            "InvalidImageName" => FailureReason::ImagePullFailed,
            "ImagePullBackOff" | "ErrImagePull" if is_permanent_pull_error(&issue.message) => {
                FailureReason::ImagePullFailed
            }
            "CreateContainerConfigError" => FailureReason::ContainerConfigError,
            _ => return None,
        };
        Some(Failure::new(
            reason,
            format!(
                "pod {} container {}: {} ({}), restarts={}",
                issue.pod, issue.container, issue.reason, issue.message, issue.restart_count
            ),
        ))
    })
}

fn is_permanent_pull_error(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["unauthorized", "authorization", "access denied", "not found", "manifest unknown"]
        .iter()
        .any(|needle| message.contains(needle))
}
