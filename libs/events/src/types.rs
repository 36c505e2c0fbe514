//! Event type names.
//!
//! The engine emits one of these per audited transition. Names are stable
//! strings so downstream sinks can route on them.

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Service
    pub const SERVICE_REGISTERED: &str = "service.registered";
    pub const SERVICE_DELETED: &str = "service.deleted";

    // Service dependency
    pub const DEPENDENCY_ADDED: &str = "service_dependency.added";
    pub const DEPENDENCY_REMOVED: &str = "service_dependency.removed";

    // Release
    pub const RELEASE_RECORDED: &str = "release.recorded";
    pub const RELEASE_READY: &str = "release.ready";

    // Deployment
    pub const DEPLOYMENT_CREATED: &str = "deployment.created";
    pub const DEPLOYMENT_STATUS_CHANGED: &str = "deployment.status_changed";
    pub const DEPLOYMENT_NO_ROLLBACK_TARGET: &str = "deployment.no_rollback_target";

    // Deployment group
    pub const GROUP_CREATED: &str = "deployment_group.created";
    pub const GROUP_STATUS_CHANGED: &str = "deployment_group.status_changed";
    pub const GROUP_CANCEL_REQUESTED: &str = "deployment_group.cancel_requested";
    pub const GROUP_ROLLBACK_REQUESTED: &str = "deployment_group.rollback_requested";

    /// Every known event type, for validation by sinks.
    pub const ALL: &[&str] = &[
        SERVICE_REGISTERED,
        SERVICE_DELETED,
        DEPENDENCY_ADDED,
        DEPENDENCY_REMOVED,
        RELEASE_RECORDED,
        RELEASE_READY,
        DEPLOYMENT_CREATED,
        DEPLOYMENT_STATUS_CHANGED,
        DEPLOYMENT_NO_ROLLBACK_TARGET,
        GROUP_CREATED,
        GROUP_STATUS_CHANGED,
        GROUP_CANCEL_REQUESTED,
        GROUP_ROLLBACK_REQUESTED,
    ];
}

/// Checks that `event_type` is one the engine emits.
pub fn validate_event_type(event_type: &str) -> Result<(), crate::EventError> {
    if event_types::ALL.contains(&event_type) {
        Ok(())
    } else {
        Err(crate::EventError::UnknownEventType(event_type.to_string()))
    }
}
