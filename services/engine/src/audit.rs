//! Audit trail of state transitions.
//!
//! Every committed status change produces one [`TransitionRecord`]. The sink
//! decides where it goes. A sink failure is logged and never undoes or
//! blocks the transition it describes.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use railyard_events::{
    event_types, ActorType, AggregateType, EventError, TransitionRecord, TransitionRecordBuilder,
};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{Deployment, DeploymentGroup, DeploymentStatus, GroupStatus};

/// Audit sink errors.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("invalid record: {0}")]
    Record(#[from] EventError),

    #[error("failed to persist record: {0}")]
    Store(#[from] sqlx::Error),
}

/// Destination for transition records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, record: &TransitionRecord) -> Result<(), AuditError>;
}

/// Who performed a transition.
#[derive(Debug, Clone)]
pub struct Actor {
    pub actor_type: ActorType,
    pub id: String,
}

impl Actor {
    pub fn system(id: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::System,
            id: id.into(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::User,
            id: id.into(),
        }
    }
}

/// Cloneable audit handle shared by every component.
#[derive(Clone)]
pub struct Audit {
    sink: Arc<dyn AuditSink>,
}

impl Audit {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Builds and writes a record, logging any failure.
    pub async fn emit(&self, builder: TransitionRecordBuilder) {
        let record = match builder.build() {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Dropping malformed audit record");
                return;
            }
        };
        if let Err(e) = self.sink.write(&record).await {
            warn!(
                error = %e,
                aggregate_id = %record.aggregate_id,
                event_type = %record.event_type,
                "Failed to write audit record"
            );
        }
    }

    /// Records a deployment transition. `from = None` marks creation.
    pub async fn deployment(
        &self,
        deployment: &Deployment,
        from: Option<DeploymentStatus>,
        actor: &Actor,
    ) {
        let event_type = match from {
            Some(_) => event_types::DEPLOYMENT_STATUS_CHANGED,
            None => event_types::DEPLOYMENT_CREATED,
        };
        let mut builder = TransitionRecord::builder()
            .aggregate(AggregateType::Deployment, deployment.id)
            .event_type(event_type)
            .actor(actor.actor_type, actor.id.clone())
            .transition(from, deployment.status)
            .maybe_group_id(deployment.group_id);
        if deployment.status == DeploymentStatus::Failed {
            if let Some(failure) = &deployment.failure {
                builder = builder
                    .reason(failure.reason)
                    .detail(failure.detail.clone());
            }
        }
        self.emit(builder).await;
    }

    /// Records a group transition. `from = None` marks creation.
    pub async fn group(&self, group: &DeploymentGroup, from: Option<GroupStatus>, actor: &Actor) {
        let event_type = match from {
            Some(_) => event_types::GROUP_STATUS_CHANGED,
            None => event_types::GROUP_CREATED,
        };
        let mut builder = TransitionRecord::builder()
            .aggregate(AggregateType::DeploymentGroup, group.id)
            .event_type(event_type)
            .actor(actor.actor_type, actor.id.clone())
            .transition(from, group.status)
            .group_id(group.id);
        if group.status == GroupStatus::Failed {
            if let Some(failure) = &group.failure {
                builder = builder
                    .reason(failure.reason)
                    .detail(failure.detail.clone());
            }
        }
        self.emit(builder).await;
    }
}

/// Writes records as structured log lines.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn write(&self, record: &TransitionRecord) -> Result<(), AuditError> {
        info!(
            target: "railyard::audit",
            event_type = %record.event_type,
            aggregate_type = %record.aggregate_type,
            aggregate_id = %record.aggregate_id,
            actor_type = %record.actor_type,
            actor_id = %record.actor_id,
            from = record.from_status.as_deref().unwrap_or("-"),
            to = %record.to_status,
            reason = record.reason.as_deref().unwrap_or("-"),
            group_id = record.group_id.map(|g| g.to_string()).unwrap_or_default(),
            "Transition"
        );
        Ok(())
    }
}

/// Appends records to the `audit_events` table.
#[derive(Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn write(&self, record: &TransitionRecord) -> Result<(), AuditError> {
        let payload = record.to_json()?;
        sqlx::query(
            r#"
            INSERT INTO audit_events (
                occurred_at, aggregate_type, aggregate_id, event_type, actor_type,
                actor_id, from_status, to_status, reason, detail, group_id,
                request_id, payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(record.occurred_at)
        .bind(record.aggregate_type.to_string())
        .bind(&record.aggregate_id)
        .bind(&record.event_type)
        .bind(record.actor_type.to_string())
        .bind(&record.actor_id)
        .bind(record.from_status.as_deref())
        .bind(&record.to_status)
        .bind(record.reason.as_deref())
        .bind(record.detail.as_deref())
        .bind(record.group_id.map(|g| g.to_string()))
        .bind(record.request_id.map(|r| r.to_string()))
        .bind(&payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<TransitionRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TransitionRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Records about one aggregate, oldest first.
    pub fn records_for(&self, aggregate_id: &str) -> Vec<TransitionRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.aggregate_id == aggregate_id)
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn write(&self, record: &TransitionRecord) -> Result<(), AuditError> {
        match self.records.lock() {
            Ok(mut records) => records.push(record.clone()),
            Err(poisoned) => poisoned.into_inner().push(record.clone()),
        }
        Ok(())
    }
}
