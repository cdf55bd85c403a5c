//! Sent packet records
//!
//! Every packet the engine assembles is remembered until it is acknowledged
//! or declared lost, together with the deadline information needed to decide
//! whether a loss is worth repairing.

use crate::frame::DeadlineFrame;
use crate::stream::{DeadlineMode, StreamId};
use crate::time::Timestamp;
use bytes::Bytes;
use std::fmt;

/// Identifier of a validated network path
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PathId(u32);

impl PathId {
    /// The path the connection was established on
    pub const DEFAULT: PathId = PathId(0);

    #[inline]
    pub const fn new(id: u32) -> Self {
        PathId(id)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "path#{}", self.0)
    }
}

/// Deadline information attached to an in-flight packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketDeadlineInfo {
    /// The packet carries at least one byte with a deadline
    pub contains_deadline_data: bool,
    /// Minimum deadline over the referenced chunks, `INFINITE` if none
    pub earliest_deadline: Timestamp,
    /// Path the packet was sent on
    pub send_path: PathId,
    /// Every byte of stream data in the packet is under a hard deadline
    pub hard: bool,
}

impl PacketDeadlineInfo {
    /// Info for a packet without deadline data
    pub fn none(send_path: PathId) -> Self {
        PacketDeadlineInfo {
            contains_deadline_data: false,
            earliest_deadline: Timestamp::INFINITE,
            send_path,
            hard: false,
        }
    }

    /// Build the info from the deadlines of the data placed in a packet
    pub fn from_chunks(send_path: PathId, earliest_deadline: Timestamp, all_hard: bool) -> Self {
        if earliest_deadline.is_infinite() {
            return Self::none(send_path);
        }
        PacketDeadlineInfo {
            contains_deadline_data: true,
            earliest_deadline,
            send_path,
            hard: all_hard,
        }
    }

    /// Mode that governs a retransmission decision
    pub fn mode(&self) -> DeadlineMode {
        DeadlineMode::from_hard_flag(self.hard)
    }
}

/// Stream data carried by a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: StreamId,
    pub offset: u64,
    pub data: Bytes,
    pub fin: bool,
}

impl StreamFrame {
    /// Number of payload bytes
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset one past the last byte
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.len())
    }
}

/// Record of a packet awaiting acknowledgment
#[derive(Debug, Clone)]
pub struct SentPacket {
    /// Packet number
    pub packet_number: u64,
    /// Send time
    pub time_sent: Timestamp,
    /// Control frames carried
    pub control: Vec<DeadlineFrame>,
    /// Stream data carried, if any
    pub stream: Option<StreamFrame>,
    /// Deadline information for the loss path
    pub deadline_info: PacketDeadlineInfo,
}

impl SentPacket {
    /// Path the packet went out on
    pub fn path(&self) -> PathId {
        self.deadline_info.send_path
    }

    /// Bytes of stream payload
    pub fn stream_bytes(&self) -> u64 {
        self.stream.as_ref().map_or(0, StreamFrame::len)
    }
}
