//! Reconciliation loop primitives.
//!
//! Helpers for converging a rendered workload spec onto the cluster:
//!
//! - **Spec identity**: [`SpecHash`] over canonical JSON, so re-applying an
//!   identical manifest is recognisably a no-op.
//! - **Rollout bounds**: [`RollingUpdate`] resolves max-surge/max-unavailable
//!   against a replica count.
//! - **Retry**: [`BackoffPolicy`] and [`RetryBudget`] drive bounded retry of
//!   transient failures.
//! - **Progress**: [`RolloutProgress`] classifies a status snapshot into a
//!   [`ConvergenceStatus`].
//!
//! # Invariants
//!
//! - All operations are deterministic given the same inputs
//! - Hashes ignore object key order
//! - A retry budget never hands out more attempts than its policy allows

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Timeout waiting for convergence.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout {
        resource: String,
        elapsed: Duration,
    },

    /// Retries exhausted.
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    /// A rollout bound could not be parsed.
    #[error("invalid rollout bound: {0}")]
    InvalidBound(String),

    /// A value could not be serialized for hashing.
    #[error("serialization error: {0}")]
    Serialization(String),
}

// =============================================================================
// Convergence
// =============================================================================

/// Convergence status for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Resource has converged (current matches desired).
    Converged,

    /// Resource is converging (current is moving toward desired).
    Converging,

    /// Resource has diverged (requires intervention).
    Diverged,

    /// Status is unknown (the controller has not observed the spec yet).
    Unknown,
}

impl ConvergenceStatus {
    /// Returns true if the resource has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Returns true if the resource is still converging.
    pub fn is_converging(&self) -> bool {
        matches!(self, Self::Converging | Self::Unknown)
    }
}

/// A snapshot of rollout counters as reported by the cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutProgress {
    /// Replicas the spec asks for.
    pub desired: u32,
    /// Replicas running the newest spec.
    pub updated: u32,
    /// Replicas passing readiness.
    pub ready: u32,
    /// Replicas available for the minimum ready period.
    pub available: u32,
    /// Whether the controller has observed the latest generation.
    pub observed: bool,
}

impl RolloutProgress {
    /// Classifies this snapshot.
    pub fn status(&self) -> ConvergenceStatus {
        if !self.observed {
            return ConvergenceStatus::Unknown;
        }
        if self.updated >= self.desired
            && self.ready >= self.desired
            && self.available >= self.desired
        {
            ConvergenceStatus::Converged
        } else {
            ConvergenceStatus::Converging
        }
    }

    /// Returns true if any counter moved forward relative to `earlier`.
    ///
    /// Used to reset a no-progress window: a rollout that keeps bringing
    /// replicas up is not stuck even when it is slow.
    pub fn advanced_since(&self, earlier: &RolloutProgress) -> bool {
        (self.observed && !earlier.observed)
            || self.updated > earlier.updated
            || self.ready > earlier.ready
            || self.available > earlier.available
    }
}

// =============================================================================
// Spec Hash
// =============================================================================

/// A spec hash for deterministic comparison.
///
/// Two manifests with the same hash render the same cluster end-state, so
/// applying one after the other changes nothing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16])))
    }

    /// Compute a spec hash from any serializable value.
    pub fn of<T: Serialize>(value: &T) -> Result<Self, ReconcileError> {
        let json =
            serde_json::to_value(value).map_err(|e| ReconcileError::Serialization(e.to_string()))?;
        Ok(Self::from_json(&json))
    }

    /// Wraps a previously computed hash string.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex digest without the algorithm prefix, suitable for labels.
    pub fn short(&self) -> &str {
        let digest = self.0.strip_prefix("sha256:").unwrap_or(&self.0);
        &digest[..digest.len().min(12)]
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

// =============================================================================
// Rolling Update
// =============================================================================

/// A rollout bound, either an absolute count or a percentage of desired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutBound {
    Count(u32),
    Percent(u8),
}

impl RolloutBound {
    /// Parses `"3"` or `"25%"`.
    pub fn parse(s: &str) -> Result<Self, ReconcileError> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let pct: u8 = pct
                .parse()
                .map_err(|_| ReconcileError::InvalidBound(s.to_string()))?;
            if pct > 100 {
                return Err(ReconcileError::InvalidBound(s.to_string()));
            }
            Ok(Self::Percent(pct))
        } else {
            s.parse()
                .map(Self::Count)
                .map_err(|_| ReconcileError::InvalidBound(s.to_string()))
        }
    }

    fn resolve(&self, desired: u32, round_up: bool) -> u32 {
        match *self {
            Self::Count(n) => n,
            Self::Percent(p) => {
                let scaled = desired as u64 * p as u64;
                let value = if round_up {
                    scaled.div_ceil(100)
                } else {
                    scaled / 100
                };
                value as u32
            }
        }
    }

    /// The value as the cluster API expects it (int or percent string).
    pub fn to_json(&self) -> serde_json::Value {
        match *self {
            Self::Count(n) => serde_json::Value::from(n),
            Self::Percent(p) => serde_json::Value::from(format!("{}%", p)),
        }
    }
}

impl std::fmt::Display for RolloutBound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Count(n) => write!(f, "{}", n),
            Self::Percent(p) => write!(f, "{}%", p),
        }
    }
}

/// Rolling update parameters for stateless workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollingUpdate {
    /// Maximum number of replicas that can be created above desired count.
    pub max_surge: RolloutBound,

    /// Maximum number of replicas that can be unavailable during rollout.
    pub max_unavailable: RolloutBound,
}

impl Default for RollingUpdate {
    fn default() -> Self {
        Self {
            max_surge: RolloutBound::Percent(25),
            max_unavailable: RolloutBound::Percent(25),
        }
    }
}

impl RollingUpdate {
    /// Resolves the bounds against `desired` replicas.
    ///
    /// Surge rounds up and unavailability rounds down. If both resolve to
    /// zero the rollout could never make progress, so one replica of
    /// unavailability is allowed.
    ///
    /// Returns (surge, unavailable).
    pub fn resolve(&self, desired: u32) -> (u32, u32) {
        let surge = self.max_surge.resolve(desired, true);
        let mut unavailable = self.max_unavailable.resolve(desired, false);
        if surge == 0 && unavailable == 0 && desired > 0 {
            unavailable = 1;
        }
        (surge, unavailable.min(desired))
    }

    /// Minimum replicas that stay available while the rollout proceeds.
    pub fn min_available(&self, desired: u32) -> u32 {
        let (_, unavailable) = self.resolve(desired);
        desired.saturating_sub(unavailable)
    }
}

// =============================================================================
// Retry
// =============================================================================

/// Exponential backoff without jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Multiplier applied per attempt.
    pub factor: u32,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Total attempts including the first one.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            factor: 2,
            max_delay: Duration::from_secs(60),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after the `retry`-th failure (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let multiplier = (self.factor.max(1) as u64).saturating_pow(retry);
        let millis = (self.base.as_millis() as u64).saturating_mul(multiplier);
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Starts a fresh budget for one operation.
    pub fn budget(&self) -> RetryBudget {
        RetryBudget {
            policy: *self,
            failures: 0,
        }
    }
}

/// Tracks the retries spent on a single operation.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    policy: BackoffPolicy,
    failures: u32,
}

impl RetryBudget {
    /// Records a failed attempt.
    ///
    /// Returns the delay before the next attempt, or `None` when the budget
    /// is spent.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            None
        } else {
            Some(self.policy.delay(self.failures - 1))
        }
    }

    /// Failed attempts so far. After a success this is the retry count.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Returns true if no further attempt is allowed.
    pub fn is_exhausted(&self) -> bool {
        self.failures >= self.policy.max_attempts
    }
}

/// Default delay before the first retry.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Default attempts per apply, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
