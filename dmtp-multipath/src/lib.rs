//! Multipath Deadline Routing
//!
//! This crate keeps per-path telemetry reported by the host and selects the
//! path for deadline data and for retransmissions of deadline packets.

pub mod path;
pub mod selector;

pub use path::{PathError, PathStats, PathStatus, PathTable, PathTelemetry};
pub use selector::{PathSelector, SelectionError};
