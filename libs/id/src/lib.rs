//! # railyard-id
//!
//! Typed identifiers for every record the deployment engine persists.
//!
//! ## Format
//!
//! All identifiers use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `svc_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `dep_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `dgrp_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! The prefix keeps a deployment id from being passed where a group id is
//! expected, and the ULID body sorts by creation time. The engine relies on
//! that second property when it needs a stable tie-breaker.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
