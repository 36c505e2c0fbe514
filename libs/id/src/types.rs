//! Identifier definitions for every deployment-engine record.

use crate::define_id;

// =============================================================================
// Project topology
// =============================================================================

define_id!(
    /// A project groups services that deploy together.
    ProjectId,
    "prj"
);
define_id!(
    /// A target environment (staging, production, preview...).
    EnvId,
    "env"
);
define_id!(
    /// A deployable service inside a project.
    ServiceId,
    "svc"
);
define_id!(
    /// A directed dependency edge between two services.
    DependencyId,
    "sdep"
);

// =============================================================================
// Artifacts and rollouts
// =============================================================================

define_id!(
    /// An immutable build artifact record.
    ReleaseId,
    "rel"
);
define_id!(
    /// One attempt to run a release in an environment.
    DeploymentId,
    "dep"
);
define_id!(
    /// An atomic multi-service rollout.
    GroupId,
    "dgrp"
);

// =============================================================================
// Runtime
// =============================================================================

define_id!(
    /// A reconciler worker holding deployment claims.
    WorkerId,
    "wrk"
);
define_id!(
    /// Correlates the records produced by one intent.
    RequestId,
    "req"
);

// =============================================================================
// Tests
// =============================================================================
