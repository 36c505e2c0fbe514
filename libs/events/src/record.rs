//! Transition record - the unit handed to the audit sink.

use chrono::{DateTime, Utc};
use railyard_id::{GroupId, RequestId};
use serde::{Deserialize, Serialize};

use crate::EventError;

/// Actor type for audit logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// A human user acting through an upstream surface.
    User,
    /// An automated trigger (webhook ingester, CI).
    Trigger,
    /// The engine itself (workers, orchestrator, rollback).
    #[default]
    System,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::Trigger => write!(f, "trigger"),
            ActorType::System => write!(f, "system"),
        }
    }
}

/// Aggregate type for record routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    Service,
    ServiceDependency,
    Release,
    #[default]
    Deployment,
    DeploymentGroup,
}

impl std::fmt::Display for AggregateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AggregateType::Service => "service",
            AggregateType::ServiceDependency => "service_dependency",
            AggregateType::Release => "release",
            AggregateType::Deployment => "deployment",
            AggregateType::DeploymentGroup => "deployment_group",
        };
        write!(f, "{}", s)
    }
}

/// One audited state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// When the transition committed.
    pub occurred_at: DateTime<Utc>,

    /// The type of aggregate that transitioned.
    pub aggregate_type: AggregateType,

    /// The ID of the aggregate instance.
    pub aggregate_id: String,

    /// The event type (e.g., "deployment.status_changed").
    pub event_type: String,

    /// Type of actor that caused the transition.
    pub actor_type: ActorType,

    /// Identifier of the actor (user id, worker id, "orchestrator").
    pub actor_id: String,

    /// Status before the transition. `None` for creations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_status: Option<String>,

    /// Status after the transition.
    pub to_status: String,

    /// Machine-readable failure reason, when the transition is a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// Deployment group the aggregate belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,

    /// Request correlation ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

impl TransitionRecord {
    /// Creates a new record builder.
    pub fn builder() -> TransitionRecordBuilder {
        TransitionRecordBuilder::new()
    }

    /// Encodes the record as a JSON value for storage.
    pub fn to_json(&self) -> Result<serde_json::Value, EventError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Returns true if this record marks a failure.
    pub fn is_failure(&self) -> bool {
        self.reason.is_some()
    }
}

/// Builder for constructing transition records.
#[derive(Debug, Default)]
pub struct TransitionRecordBuilder {
    occurred_at: Option<DateTime<Utc>>,
    aggregate_type: Option<AggregateType>,
    aggregate_id: Option<String>,
    event_type: Option<String>,
    actor_type: ActorType,
    actor_id: Option<String>,
    from_status: Option<String>,
    to_status: Option<String>,
    reason: Option<String>,
    detail: Option<String>,
    group_id: Option<GroupId>,
    request_id: Option<RequestId>,
}

impl TransitionRecordBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn occurred_at(mut self, ts: DateTime<Utc>) -> Self {
        self.occurred_at = Some(ts);
        self
    }

    pub fn aggregate(mut self, agg_type: AggregateType, agg_id: impl ToString) -> Self {
        self.aggregate_type = Some(agg_type);
        self.aggregate_id = Some(agg_id.to_string());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn actor(mut self, actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        self.actor_type = actor_type;
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Sets both sides of the transition.
    pub fn transition(mut self, from: Option<impl ToString>, to: impl ToString) -> Self {
        self.from_status = from.map(|s| s.to_string());
        self.to_status = Some(to.to_string());
        self
    }

    pub fn reason(mut self, reason: impl ToString) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn group_id(mut self, group_id: GroupId) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn maybe_group_id(mut self, group_id: Option<GroupId>) -> Self {
        self.group_id = group_id;
        self
    }

    pub fn request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Builds the record.
    ///
    /// Fails with [`EventError::MissingField`] when the aggregate, event
    /// type or target status were not set.
    pub fn build(self) -> Result<TransitionRecord, EventError> {
        Ok(TransitionRecord {
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            aggregate_type: self
                .aggregate_type
                .ok_or(EventError::MissingField("aggregate_type"))?,
            aggregate_id: self
                .aggregate_id
                .ok_or(EventError::MissingField("aggregate_id"))?,
            event_type: self
                .event_type
                .ok_or(EventError::MissingField("event_type"))?,
            actor_type: self.actor_type,
            actor_id: self.actor_id.unwrap_or_else(|| "engine".to_string()),
            from_status: self.from_status,
            to_status: self
                .to_status
                .ok_or(EventError::MissingField("to_status"))?,
            reason: self.reason,
            detail: self.detail,
            group_id: self.group_id,
            request_id: self.request_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_types;

    #[test]
    fn test_actor_type_serialization() {
        assert_eq!(serde_json::to_string(&ActorType::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&ActorType::Trigger).unwrap(),
            "\"trigger\""
        );
        assert_eq!(
            serde_json::to_string(&ActorType::System).unwrap(),
            "\"system\""
        );
    }

    #[test]
    fn test_aggregate_type_display() {
        assert_eq!(AggregateType::Deployment.to_string(), "deployment");
        assert_eq!(
            AggregateType::DeploymentGroup.to_string(),
            "deployment_group"
        );
        assert_eq!(
            AggregateType::ServiceDependency.to_string(),
            "service_dependency"
        );
    }

    #[test]
    fn test_transition_record_builder() {
        let group = GroupId::new();
        let record = TransitionRecord::builder()
            .aggregate(AggregateType::Deployment, "dep_01HV4Z2WQXKJNM8GPQY6VBKC3D")
            .event_type(event_types::DEPLOYMENT_STATUS_CHANGED)
            .actor(ActorType::System, "wrk_01HV4Z2WQXKJNM8GPQY6VBKC3E")
            .transition(Some("deploying"), "failed")
            .reason("CrashLoop")
            .detail("container api restarted 5 times")
            .group_id(group)
            .build()
            .unwrap();

        assert_eq!(record.event_type, "deployment.status_changed");
        assert_eq!(record.from_status.as_deref(), Some("deploying"));
        assert_eq!(record.to_status, "failed");
        assert_eq!(record.group_id, Some(group));
        assert!(record.is_failure());
    }

    #[test]
    fn test_builder_requires_target_status() {
        let err = TransitionRecord::builder()
            .aggregate(AggregateType::DeploymentGroup, "dgrp_x")
            .event_type(event_types::GROUP_CREATED)
            .build()
            .unwrap_err();
        assert!(matches!(err, EventError::MissingField("to_status")));
    }

    #[test]
    fn test_json_omits_empty_optionals() {
        let record = TransitionRecord::builder()
            .aggregate(AggregateType::DeploymentGroup, "dgrp_x")
            .event_type(event_types::GROUP_CREATED)
            .transition(None::<&str>, "pending")
            .build()
            .unwrap();
        let json = record.to_json().unwrap();
        assert!(json.get("from_status").is_none());
        assert!(json.get("reason").is_none());
        assert_eq!(json["to_status"], "pending");
        assert_eq!(json["actor_type"], "system");
    }
}
