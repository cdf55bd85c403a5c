//! Deadline-Aware Transport Protocol Core
//!
//! Leaf types and wire formats for deadline-aware streams: timestamps and
//! periodic gates, the shared byte range set, varint coding, the deadline
//! frames and transport parameter, per-stream deadline state, per-packet
//! deadline info, the congestion extension and configuration.

pub mod config;
pub mod congestion;
pub mod frame;
pub mod packet;
pub mod params;
pub mod ranges;
pub mod stream;
pub mod time;
pub mod varint;

pub use config::{
    CheckConfig, ConfigError, CongestionConfig, DeadlineConfig, FairnessConfig, LimitsConfig,
    MultipathConfig,
};
pub use congestion::{
    CongestionAdjustment, CongestionHost, HostSnapshot, PathUrgencyState, ProbeDirective,
    ProbePhase, UrgencyLevel,
};
pub use frame::{
    DeadlineControlFrame, DeadlineFrame, FrameError, StreamDataDroppedFrame, TransportErrorCode,
};
pub use packet::{PacketDeadlineInfo, PathId, SentPacket, StreamFrame};
pub use params::{DeadlineParameters, ParamsError};
pub use ranges::{ByteRange, RangeSet};
pub use stream::{ChunkDeadlineNode, DeadlineMode, SendQueue, StreamDeadlineState, StreamId, TakenData};
pub use time::{Interval, MonotonicClock, Timestamp};
pub use varint::VarIntError;
