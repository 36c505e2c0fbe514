//! Domain records and their status machines.
//!
//! Rows are plain data. Status enums own the transition rules; the store
//! enforces them with compare-and-set writes.

mod records;
mod status;
mod workload;

pub use records::*;
pub use status::*;
pub use workload::*;
