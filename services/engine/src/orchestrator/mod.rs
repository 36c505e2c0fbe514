//! Group-level orchestration: sequencing a group's deployments and
//! compensating groups that failed.

mod group;
mod rollback;

pub use group::GroupOrchestrator;
pub use rollback::{RollbackOrchestrator, RollbackPlan, RollbackReport, RollbackTarget};
