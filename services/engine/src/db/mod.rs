//! Persistence layer for the engine.
//!
//! This module provides:
//! - Connection pool management and migrations
//! - The [`Store`] interface every component persists through
//! - A Postgres implementation ([`PgStore`]) and an in-memory one
//!   ([`MemoryStore`]) with the same semantics
//!
//! Every status change is a compare-and-set on the expected current status,
//! so a writer always reads its own transition back and two writers can
//! never both advance the same row.

mod error;
mod memory;
mod pg;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use pg::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use railyard_id::{DeploymentId, EnvId, GroupId, ProjectId, ReleaseId, ServiceId, WorkerId};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

use crate::model::{
    Deployment, DeploymentGroup, DeploymentStatus, Environment, Failure, GroupStatus,
    HealthState, Release, Service, ServiceDependency,
};

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Duration,

    /// Maximum lifetime of a connection.
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/railyard".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DbConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let database_url = std::env::var("DATABASE_URL").unwrap_or(defaults.database_url);

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_connections);

        let min_connections = std::env::var("DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.min_connections);

        let acquire_timeout = std::env::var("DB_ACQUIRE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.acquire_timeout);

        Self {
            database_url,
            max_connections,
            min_connections,
            acquire_timeout,
            ..defaults
        }
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn connect(config: &DbConfig) -> Result<Self, StoreError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(StoreError::Connect)?;

        info!("Database connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the database is reachable.
    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        Ok(())
    }

    /// Run pending migrations.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        let candidates = vec![
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from("services/engine/migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<sqlx::migrate::MigrateError> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    migrator
                        .run(&self.pool)
                        .await
                        .map_err(StoreError::Migration)?;
                    info!("Database migrations complete");
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }
        }

        let tried = candidates
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Err(StoreError::MigrationDirNotFound {
            tried,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// Get a store handle.
    pub fn store(&self) -> PgStore {
        PgStore::new(self.pool.clone())
    }
}

/// A forward status change for one deployment.
///
/// Optional fields are left untouched when `None`.
#[derive(Debug, Clone)]
pub struct DeploymentUpdate {
    pub status: DeploymentStatus,
    pub health: Option<HealthState>,
    pub ready_replicas: Option<u32>,
    pub failure: Option<Failure>,
    pub retry_count: Option<u32>,
    pub spec_hash: Option<String>,
    pub at: DateTime<Utc>,
}

impl DeploymentUpdate {
    pub fn to(status: DeploymentStatus) -> Self {
        Self {
            status,
            health: None,
            ready_replicas: None,
            failure: None,
            retry_count: None,
            spec_hash: None,
            at: Utc::now(),
        }
    }

    pub fn failed(failure: Failure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::to(DeploymentStatus::Failed)
        }
    }

    pub fn with_health(mut self, health: HealthState) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_ready_replicas(mut self, ready: u32) -> Self {
        self.ready_replicas = Some(ready);
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = Some(retries);
        self
    }

    pub fn with_spec_hash(mut self, hash: impl Into<String>) -> Self {
        self.spec_hash = Some(hash.into());
        self
    }

    /// Fills the timestamp fields implied by the new status.
    pub(crate) fn apply_to(&self, deployment: &mut Deployment) {
        deployment.status = self.status;
        if let Some(health) = self.health {
            deployment.health = health;
        }
        if let Some(ready) = self.ready_replicas {
            deployment.ready_replicas = ready;
        }
        if let Some(failure) = &self.failure {
            deployment.failure = Some(failure.clone());
        }
        if let Some(retries) = self.retry_count {
            deployment.retry_count = retries;
        }
        if let Some(hash) = &self.spec_hash {
            deployment.spec_hash = Some(hash.clone());
        }
        if self.status == DeploymentStatus::Deploying && deployment.applied_at.is_none() {
            deployment.applied_at = Some(self.at);
        }
        if releases_lease(self.status) {
            deployment.finished_at = Some(self.at);
            deployment.claimed_by = None;
            deployment.claim_expires_at = None;
        }
        deployment.updated_at = self.at;
    }
}

/// A forward status change for one group.
#[derive(Debug, Clone)]
pub struct GroupUpdate {
    pub status: GroupStatus,
    pub failure: Option<Failure>,
    pub at: DateTime<Utc>,
}

impl GroupUpdate {
    pub fn to(status: GroupStatus) -> Self {
        Self {
            status,
            failure: None,
            at: Utc::now(),
        }
    }

    pub fn failed(failure: Failure) -> Self {
        Self {
            status: GroupStatus::Failed,
            failure: Some(failure),
            at: Utc::now(),
        }
    }

    pub(crate) fn apply_to(&self, group: &mut DeploymentGroup) {
        group.status = self.status;
        if let Some(failure) = &self.failure {
            group.failure = Some(failure.clone());
        }
        if self.status == GroupStatus::Building && group.started_at.is_none() {
            group.started_at = Some(self.at);
        }
        if matches!(self.status, GroupStatus::Completed | GroupStatus::Failed) {
            group.completed_at = Some(self.at);
        }
    }
}

/// Statuses at which a deployment gives up its lease and claim.
/// `rolled_back` is excluded: the lease is already gone by then.
pub(crate) fn releases_lease(status: DeploymentStatus) -> bool {
    matches!(status, DeploymentStatus::Healthy | DeploymentStatus::Failed)
}

/// Persistence interface for the engine.
#[async_trait]
pub trait Store: Send + Sync {
    /// Check that the backing store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    // ---- services -------------------------------------------------------

    /// Fails with `Conflict` if a live service of the same name exists in
    /// the project.
    async fn insert_service(&self, service: &Service) -> Result<(), StoreError>;
    async fn get_service(&self, id: ServiceId) -> Result<Service, StoreError>;
    /// Live services of a project, oldest first.
    async fn list_services(&self, project: ProjectId) -> Result<Vec<Service>, StoreError>;
    /// Soft-deletes the service and removes every edge touching it.
    /// Returns the removed edges.
    async fn delete_service(
        &self,
        id: ServiceId,
        at: DateTime<Utc>,
    ) -> Result<Vec<ServiceDependency>, StoreError>;

    async fn insert_environment(&self, environment: &Environment) -> Result<(), StoreError>;
    async fn get_environment(&self, id: EnvId) -> Result<Environment, StoreError>;

    // ---- releases -------------------------------------------------------

    /// Fails with `Conflict` on a duplicate version for the service.
    async fn insert_release(&self, release: &Release) -> Result<(), StoreError>;
    async fn get_release(&self, id: ReleaseId) -> Result<Release, StoreError>;
    /// Sets the image and flips the release to ready. Only once.
    async fn mark_release_ready(
        &self,
        id: ReleaseId,
        image: &str,
        at: DateTime<Utc>,
    ) -> Result<Release, StoreError>;
    /// Newest ready release, restricted to `commit` when given.
    async fn latest_ready_release(
        &self,
        service: ServiceId,
        commit: Option<&str>,
    ) -> Result<Option<Release>, StoreError>;

    // ---- dependencies ---------------------------------------------------

    /// Fails with `Conflict` on a duplicate ordered pair.
    async fn insert_dependency(&self, dependency: &ServiceDependency) -> Result<(), StoreError>;
    /// Returns whether an edge was removed.
    async fn delete_dependency(
        &self,
        service: ServiceId,
        depends_on: ServiceId,
    ) -> Result<bool, StoreError>;
    /// Every edge between live services of the project.
    async fn list_dependencies(
        &self,
        project: ProjectId,
    ) -> Result<Vec<ServiceDependency>, StoreError>;

    // ---- groups ---------------------------------------------------------

    /// Persists a group and its deployments and takes a lease per
    /// deployment, all or nothing. A held lease fails with `LeaseHeld`.
    async fn create_group(
        &self,
        group: &DeploymentGroup,
        deployments: &[Deployment],
    ) -> Result<(), StoreError>;
    async fn get_group(&self, id: GroupId) -> Result<DeploymentGroup, StoreError>;
    /// Newest first.
    async fn list_groups(
        &self,
        project: ProjectId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<DeploymentGroup>, StoreError>;
    /// Ordered by `deploy_order`, then creation.
    async fn group_deployments(&self, id: GroupId) -> Result<Vec<Deployment>, StoreError>;
    /// Compare-and-set on `from`.
    async fn transition_group(
        &self,
        id: GroupId,
        from: GroupStatus,
        update: GroupUpdate,
    ) -> Result<DeploymentGroup, StoreError>;
    /// Groups compensating for `failed`.
    async fn rollback_groups_for(&self, failed: GroupId)
        -> Result<Vec<DeploymentGroup>, StoreError>;
    /// Groups that have not reached a terminal status, oldest first.
    async fn unfinished_groups(&self) -> Result<Vec<DeploymentGroup>, StoreError>;

    // ---- deployments ----------------------------------------------------

    async fn get_deployment(&self, id: DeploymentId) -> Result<Deployment, StoreError>;
    /// Compare-and-set on `from`. Reaching healthy or failed releases the
    /// lease and the worker claim in the same write.
    async fn transition_deployment(
        &self,
        id: DeploymentId,
        from: DeploymentStatus,
        update: DeploymentUpdate,
    ) -> Result<Deployment, StoreError>;
    /// Atomically moves a pending deployment to building under `worker`.
    /// Fails with `Conflict` when the deployment is no longer pending.
    async fn claim_deployment(
        &self,
        id: DeploymentId,
        worker: WorkerId,
        expires_at: DateTime<Utc>,
    ) -> Result<Deployment, StoreError>;
    /// Extends a claim. Fails with `Conflict` if `worker` no longer holds it.
    async fn renew_claim(
        &self,
        id: DeploymentId,
        worker: WorkerId,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    /// Records rollout progress without changing status.
    async fn record_progress(&self, id: DeploymentId, ready_replicas: u32)
        -> Result<(), StoreError>;
    async fn mark_dispatched(&self, id: DeploymentId, at: DateTime<Utc>) -> Result<(), StoreError>;
    /// Non-terminal deployments still holding a worker claim.
    async fn claimed_deployments(&self) -> Result<Vec<Deployment>, StoreError>;
    /// Claimed deployments whose claim expired before `now`.
    async fn expired_claims(&self, now: DateTime<Utc>) -> Result<Vec<Deployment>, StoreError>;
    /// Newest healthy deployment of the pair outside `exclude_group`,
    /// created before `before`.
    async fn latest_healthy_deployment(
        &self,
        service: ServiceId,
        environment: EnvId,
        exclude_group: GroupId,
        before: DateTime<Utc>,
    ) -> Result<Option<Deployment>, StoreError>;
}
