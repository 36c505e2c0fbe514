//! Persistence error types.

use railyard_id::{DeploymentId, EnvId, ServiceId};
use thiserror::Error;

/// Store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A uniqueness constraint or a compare-and-set lost.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Another non-terminal deployment owns the (service, environment) pair.
    #[error("service {service} in environment {environment} is leased by deployment {holder}")]
    LeaseHeld {
        service: ServiceId,
        environment: EnvId,
        holder: DeploymentId,
    },

    /// The requested status change does not move forward.
    #[error("invalid {entity} transition {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}. Run from repo root or services/engine.")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted value could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Query(err)
    }
}

impl From<railyard_id::IdError> for StoreError {
    fn from(err: railyard_id::IdError) -> Self {
        Self::Corrupt(err.to_string())
    }
}

impl From<crate::model::ParseEnumError> for StoreError {
    fn from(err: crate::model::ParseEnumError) -> Self {
        Self::Corrupt(err.to_string())
    }
}
