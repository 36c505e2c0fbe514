//! railyard deployment engine.
//!
//! This crate primarily ships the `railyard-engine` binary, but the engine
//! itself is a library so it can be embedded and driven from integration
//! tests.

pub mod api;
pub mod audit;
pub mod cancel;
pub mod cluster;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod graph;
pub mod health;
pub mod manifest;
pub mod model;
pub mod orchestrator;
pub mod scheduler;
pub mod state;

pub use engine::{CreateGroupRequest, Engine};
pub use error::EngineError;
