//! DMTP - Deadline-aware Multipath Transport
//!
//! Deadline-aware stream engine for a QUIC-style transport: EDF stream
//! scheduling, partial reliability with receiver gap skipping, a smart
//! retransmission gate, a scheduler fairness arbiter, deadline-aware
//! congestion adjustments and multipath selection.

pub use dmtp_multipath as multipath;
pub use dmtp_protocol as protocol;

pub mod connection;
pub mod events;
pub mod fairness;
pub mod gap;
pub mod recv;
pub mod retransmit;
pub mod scheduler;
pub mod streams;

// Re-export commonly used types
pub use connection::{
    Connection, ConnectionDeadlineContext, ConnectionError, ConnectionState, ConnectionStats,
    SharedConnection, StreamControl, Transmit, SCHEDULING_QUANTUM,
};
pub use events::{Outbox, StreamEvent};
pub use fairness::{FairnessArbiter, OverrideReason};
pub use protocol::{DeadlineConfig, DeadlineMode, DeadlineParameters, PathId, StreamId, Timestamp};
pub use retransmit::{should_skip_retransmit, RetransmitDecision};
pub use scheduler::{Candidate, EdfScheduler, Selection};
