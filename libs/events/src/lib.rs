//! # railyard-events
//!
//! Audit records emitted by the deployment engine.
//!
//! ## Design Principles
//!
//! - One record per status transition, written after the transition commits
//! - Records are immutable and never reference secrets
//! - Every record belongs to exactly one aggregate
//!
//! ## Transition Record
//!
//! A record carries:
//! - The aggregate (`aggregate_type`, `aggregate_id`)
//! - The transition (`from_status`, `to_status`, optional `reason` and `detail`)
//! - Audit context (`actor_type`, `actor_id`, `request_id`)
//! - Correlation (`group_id`) so a whole rollout can be replayed from the log
//!
//! ## Event Types
//!
//! - Service events (`service.*`, `service_dependency.*`)
//! - Release events (`release.*`)
//! - Deployment events (`deployment.*`)
//! - Group events (`deployment_group.*`)

mod error;
mod record;
mod types;

pub use error::EventError;
pub use record::*;
pub use types::*;
