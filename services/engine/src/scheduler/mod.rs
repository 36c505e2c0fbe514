//! Deployment scheduling: the pending-work queue, the reconciler pipeline
//! that drives one deployment to a terminal status, and the bounded worker
//! pool that runs it.
//!
//! The queue is constructed once by the engine and injected into the pool
//! and the orchestrators. Its dispatch marks are persisted, so the queue
//! can be rebuilt from the store after a restart.

mod queue;
mod reconciler;
mod worker;

pub use queue::{DeploymentEvent, WorkItem, WorkQueue};
pub use reconciler::Reconciler;
pub use worker::WorkerPool;
