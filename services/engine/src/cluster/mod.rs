//! Cluster orchestration API interface.
//!
//! The engine needs two things from the cluster: an idempotent apply of
//! rendered objects, and an eventually consistent view of rollout progress.
//!
//! - [`HttpClusterClient`] talks to a Kubernetes API server using
//!   server-side apply.
//! - [`MockCluster`] is a scripted in-process cluster for tests and dev mode.
//! - [`RateLimitedCluster`] wraps either with the shared token bucket.

mod http;
mod limiter;
mod mock;

pub use http::HttpClusterClient;
pub use limiter::{ClusterRateLimiter, RateLimitedCluster};
pub use mock::{ApplyRecord, MockCluster, MockRollout};

use async_trait::async_trait;
use railyard_reconcile::RolloutProgress;
use thiserror::Error;

use crate::manifest::{RenderedManifest, WorkloadRef};

/// Errors returned by the cluster API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    /// Timeout or connection failure.
    #[error("cluster unreachable: {0}")]
    Unreachable(String),

    /// Optimistic-lock or field-ownership conflict.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The API server asked us to slow down.
    #[error("throttled: {0}")]
    Throttled(String),

    /// The API server failed.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The API server refused the request (validation, admission).
    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The response could not be decoded.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ClusterError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unreachable(_) | Self::Conflict(_) | Self::Throttled(_) | Self::Server { .. }
        )
    }

    /// Maps an HTTP error status to an error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 => Self::NotFound(message),
            408 | 504 => Self::Unreachable(message),
            409 => Self::Conflict(message),
            429 => Self::Throttled(message),
            500..=599 => Self::Server { status, message },
            _ => Self::Rejected { status, message },
        }
    }
}

/// What an apply did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Configured,
    /// The cluster already held this exact spec.
    Unchanged,
}

/// A container that is not starting, as reported on its pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerIssue {
    pub pod: String,
    pub container: String,
    /// Waiting reason, e.g. `CrashLoopBackOff`.
    pub reason: String,
    pub message: String,
    pub restart_count: u32,
}

/// Rollout counters plus any container-level problems.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RolloutStatus {
    pub progress: RolloutProgress,
    pub issues: Vec<ContainerIssue>,
}

/// Cluster orchestration API.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Applies every object of the manifest. Applying an identical manifest
    /// again must converge to the same state.
    async fn apply(&self, manifest: &RenderedManifest) -> Result<ApplyOutcome, ClusterError>;

    /// Reads rollout progress for a workload.
    async fn rollout_status(&self, workload: &WorkloadRef) -> Result<RolloutStatus, ClusterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(ClusterError::from_status(409, "conflict").is_transient());
        assert!(ClusterError::from_status(429, "slow down").is_transient());
        assert!(ClusterError::from_status(503, "unavailable").is_transient());
        assert!(ClusterError::from_status(504, "gateway timeout").is_transient());

        assert!(!ClusterError::from_status(422, "invalid").is_transient());
        assert!(!ClusterError::from_status(403, "forbidden").is_transient());
        assert_eq!(
            ClusterError::from_status(404, "gone"),
            ClusterError::NotFound("gone".to_string())
        );
    }
}
