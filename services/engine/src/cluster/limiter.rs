//! Shared token bucket for cluster API calls.
//!
//! Every worker goes through the same limiter, so the engine as a whole
//! never exceeds the configured request rate no matter how many deployments
//! are in flight.

use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use super::{ApplyOutcome, ClusterApi, ClusterError, RolloutStatus};
use crate::manifest::{RenderedManifest, WorkloadRef};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Engine-wide cluster request limiter.
#[derive(Clone)]
pub struct ClusterRateLimiter {
    inner: Arc<DirectLimiter>,
    per_second: u32,
    burst: u32,
}

impl std::fmt::Debug for ClusterRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRateLimiter")
            .field("per_second", &self.per_second)
            .field("burst", &self.burst)
            .finish()
    }
}

impl ClusterRateLimiter {
    /// Creates a limiter allowing `per_second` steady requests with `burst`
    /// requests of headroom. Zero values are raised to one.
    pub fn new(per_second: u32, burst: u32) -> Self {
        let rate = NonZeroU32::new(per_second.max(1)).unwrap_or(NonZeroU32::MIN);
        let burst_size = NonZeroU32::new(burst.max(1)).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(rate).allow_burst(burst_size);
        Self {
            inner: Arc::new(RateLimiter::direct(quota)),
            per_second: rate.get(),
            burst: burst_size.get(),
        }
    }

    /// Waits until one request may be sent.
    pub async fn acquire(&self) {
        self.inner.until_ready().await;
    }

    /// Takes a token without waiting. Returns false if none is available.
    pub fn try_acquire(&self) -> bool {
        self.inner.check().is_ok()
    }

    pub fn per_second(&self) -> u32 {
        self.per_second
    }
}

/// A [`ClusterApi`] that takes one limiter token per call.
pub struct RateLimitedCluster {
    inner: Arc<dyn ClusterApi>,
    limiter: ClusterRateLimiter,
}

impl RateLimitedCluster {
    pub fn new(inner: Arc<dyn ClusterApi>, limiter: ClusterRateLimiter) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl ClusterApi for RateLimitedCluster {
    async fn apply(&self, manifest: &RenderedManifest) -> Result<ApplyOutcome, ClusterError> {
        self.limiter.acquire().await;
        self.inner.apply(manifest).await
    }

    async fn rollout_status(&self, workload: &WorkloadRef) -> Result<RolloutStatus, ClusterError> {
        self.limiter.acquire().await;
        self.inner.rollout_status(workload).await
    }
}
