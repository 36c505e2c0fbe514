use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use railyard_reconcile::BackoffPolicy;

use crate::db::DbConfig;

/// Process configuration, loaded from `RAILYARD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    /// `None` runs against the in-memory store (dev mode only).
    pub database: Option<DbConfig>,
    pub engine: EngineConfig,
    pub cluster: ClusterConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("RAILYARD_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8081".to_string())
            .parse()
            .context("RAILYARD_LISTEN_ADDR is not a socket address")?;

        let log_level = std::env::var("RAILYARD_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = env_flag("RAILYARD_DEV", false);

        let database = if std::env::var("DATABASE_URL").is_ok() || !dev_mode {
            Some(DbConfig::from_env())
        } else {
            None
        };

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            database,
            engine: EngineConfig::from_env()?,
            cluster: ClusterConfig::from_env()?,
        })
    }
}

/// Tunables for the worker pool, health verifier and orchestrator.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of concurrent reconciler workers.
    pub worker_pool_size: usize,
    /// Interval between rollout status polls.
    pub health_poll_interval: Duration,
    /// A rollout that shows no progress for this long fails.
    pub health_no_progress_window: Duration,
    /// Upper bound on waiting for one upstream dependency.
    pub dependency_timeout: Duration,
    /// Wall-clock budget for a whole group.
    pub group_budget: Duration,
    /// Retry policy for transient cluster errors.
    pub backoff: BackoffPolicy,
    /// Sustained cluster API requests per second across all workers.
    pub cluster_rate_per_sec: u32,
    /// Requests allowed above the sustained rate.
    pub cluster_burst: u32,
    /// Roll back failed groups automatically.
    pub auto_rollback: bool,
    /// Claims not renewed within this period are considered lost.
    pub claim_ttl: Duration,
    /// How often expired claims are swept.
    pub claim_sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            health_poll_interval: Duration::from_secs(5),
            health_no_progress_window: Duration::from_secs(5 * 60),
            dependency_timeout: Duration::from_secs(10 * 60),
            group_budget: Duration::from_secs(60 * 60),
            backoff: BackoffPolicy::default(),
            cluster_rate_per_sec: 20,
            cluster_burst: 10,
            auto_rollback: true,
            claim_ttl: Duration::from_secs(15 * 60),
            claim_sweep_interval: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let backoff = BackoffPolicy {
            base: env_millis("RAILYARD_BACKOFF_BASE_MS", defaults.backoff.base)?,
            factor: env_parse("RAILYARD_BACKOFF_FACTOR", defaults.backoff.factor)?,
            max_delay: env_secs("RAILYARD_BACKOFF_MAX_DELAY_SECS", defaults.backoff.max_delay)?,
            max_attempts: env_parse("RAILYARD_BACKOFF_MAX_ATTEMPTS", defaults.backoff.max_attempts)?,
        };

        let config = Self {
            worker_pool_size: env_parse("RAILYARD_WORKERS", defaults.worker_pool_size)?,
            health_poll_interval: env_secs(
                "RAILYARD_HEALTH_POLL_SECS",
                defaults.health_poll_interval,
            )?,
            health_no_progress_window: env_secs(
                "RAILYARD_HEALTH_WINDOW_SECS",
                defaults.health_no_progress_window,
            )?,
            dependency_timeout: env_secs(
                "RAILYARD_DEPENDENCY_TIMEOUT_SECS",
                defaults.dependency_timeout,
            )?,
            group_budget: env_secs("RAILYARD_GROUP_BUDGET_SECS", defaults.group_budget)?,
            backoff,
            cluster_rate_per_sec: env_parse(
                "RAILYARD_CLUSTER_RATE_PER_SEC",
                defaults.cluster_rate_per_sec,
            )?,
            cluster_burst: env_parse("RAILYARD_CLUSTER_BURST", defaults.cluster_burst)?,
            auto_rollback: env_flag("RAILYARD_AUTO_ROLLBACK", defaults.auto_rollback),
            claim_ttl: env_secs("RAILYARD_CLAIM_TTL_SECS", defaults.claim_ttl)?,
            claim_sweep_interval: env_secs(
                "RAILYARD_CLAIM_SWEEP_SECS",
                defaults.claim_sweep_interval,
            )?,
        };

        if config.worker_pool_size == 0 {
            anyhow::bail!("RAILYARD_WORKERS must be at least 1");
        }
        if config.cluster_rate_per_sec == 0 || config.cluster_burst == 0 {
            anyhow::bail!("cluster rate limit and burst must be positive");
        }
        if config.backoff.max_attempts == 0 {
            anyhow::bail!("RAILYARD_BACKOFF_MAX_ATTEMPTS must be at least 1");
        }
        // Claims are renewed on rollout progress, so a silent rollout must
        // time out before its claim does.
        if config.claim_ttl <= config.health_no_progress_window {
            anyhow::bail!("RAILYARD_CLAIM_TTL_SECS must exceed RAILYARD_HEALTH_WINDOW_SECS");
        }

        Ok(config)
    }
}

/// Cluster API connection settings.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// API server base URL, e.g. `https://10.0.0.1:6443`.
    pub api_url: String,
    /// File containing a bearer token (service account token).
    pub token_file: Option<PathBuf>,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Server-side apply field manager.
    pub field_manager: String,
    /// Use the in-process mock cluster instead of a real API server.
    pub mock: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            api_url: "https://kubernetes.default.svc".to_string(),
            token_file: None,
            request_timeout: Duration::from_secs(30),
            field_manager: "railyard".to_string(),
            mock: false,
        }
    }
}

impl ClusterConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            api_url: std::env::var("RAILYARD_CLUSTER_URL").unwrap_or(defaults.api_url),
            token_file: std::env::var("RAILYARD_CLUSTER_TOKEN_FILE")
                .ok()
                .map(PathBuf::from),
            request_timeout: env_secs("RAILYARD_CLUSTER_TIMEOUT_SECS", defaults.request_timeout)?,
            field_manager: std::env::var("RAILYARD_FIELD_MANAGER")
                .unwrap_or(defaults.field_manager),
            mock: env_flag("RAILYARD_CLUSTER_MOCK", false),
        })
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has invalid value {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}
