//! Stream deadline state and chunked send queues
//!
//! `StreamDeadlineState` is created lazily the first time a stream gets a
//! deadline. `SendQueue` holds the stream's unsent data as a sequence of
//! chunks, each stamped with its own absolute deadline at enqueue time.

use crate::packet::{PacketDeadlineInfo, PathId};
use crate::ranges::{ByteRange, RangeSet};
use crate::time::Timestamp;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::time::Duration;

/// QUIC stream identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(u64);

impl StreamId {
    /// Create a stream id
    #[inline]
    pub const fn new(id: u64) -> Self {
        StreamId(id)
    }

    /// Raw value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for StreamId {
    fn from(id: u64) -> Self {
        StreamId(id)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deadline mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeadlineMode {
    /// Affects scheduling priority only
    #[default]
    Soft,
    /// Unsent data is dropped once the deadline passes
    Hard,
}

impl DeadlineMode {
    /// Map the host API's `is_hard` flag
    pub fn from_hard_flag(is_hard: bool) -> Self {
        if is_hard {
            DeadlineMode::Hard
        } else {
            DeadlineMode::Soft
        }
    }

    pub fn is_hard(self) -> bool {
        self == DeadlineMode::Hard
    }
}

/// Per-stream deadline configuration and drop bookkeeping
#[derive(Debug, Clone, Default)]
pub struct StreamDeadlineState {
    deadline_duration: Duration,
    /// `None` when only individual chunks carry deadlines
    absolute_deadline: Option<Timestamp>,
    deadline_type: DeadlineMode,
    enabled: bool,
    bytes_dropped: u64,
    deadlines_missed: u64,
    dropped_ranges: RangeSet,
    receiver_dropped_ranges: RangeSet,
}

impl StreamDeadlineState {
    /// Create an empty, disabled state
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure a stream-level deadline of `duration` from `now`
    pub fn configure(&mut self, duration: Duration, mode: DeadlineMode, now: Timestamp) {
        self.deadline_duration = duration;
        self.absolute_deadline = Some(Timestamp::deadline_after(now, duration));
        self.deadline_type = mode;
        self.enabled = true;
    }

    /// Enable per-chunk deadlines without a stream-level deadline
    ///
    /// Leaves an existing stream-level configuration untouched.
    pub fn enable_chunk_deadlines(&mut self, duration: Duration, mode: DeadlineMode) {
        if self.enabled {
            return;
        }
        self.deadline_duration = duration;
        self.absolute_deadline = None;
        self.deadline_type = mode;
        self.enabled = true;
    }

    /// Configured relative duration
    pub fn deadline_duration(&self) -> Duration {
        self.deadline_duration
    }

    /// Absolute stream-level deadline, if any
    pub fn absolute_deadline(&self) -> Option<Timestamp> {
        self.absolute_deadline
    }

    /// Deadline mode
    pub fn deadline_type(&self) -> DeadlineMode {
        self.deadline_type
    }

    /// Check if the deadline is still active
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Total bytes written off by this stream's sender
    pub fn bytes_dropped(&self) -> u64 {
        self.bytes_dropped
    }

    /// Number of stream-level hard deadlines missed
    pub fn deadlines_missed(&self) -> u64 {
        self.deadlines_missed
    }

    /// Ranges this endpoint has written off as a sender
    pub fn dropped_ranges(&self) -> &RangeSet {
        &self.dropped_ranges
    }

    /// Ranges the peer declared dropped
    pub fn receiver_dropped_ranges(&self) -> &RangeSet {
        &self.receiver_dropped_ranges
    }

    /// Check whether an enabled stream-level deadline has passed
    pub fn has_passed(&self, now: Timestamp) -> bool {
        self.enabled && self.absolute_deadline.map_or(false, |d| d.has_passed(now))
    }

    /// Check whether an enabled hard stream-level deadline has passed
    pub fn is_hard_expired(&self, now: Timestamp) -> bool {
        self.deadline_type.is_hard() && self.has_passed(now)
    }

    /// Enabled stream-level deadline and its mode
    pub fn active_deadline(&self) -> Option<(Timestamp, DeadlineMode)> {
        if !self.enabled {
            return None;
        }
        self.absolute_deadline.map(|d| (d, self.deadline_type))
    }

    /// Record sender-side dropped bytes, returning how many were new
    pub fn record_drop(&mut self, range: ByteRange) -> u64 {
        let added = self.dropped_ranges.insert_range(range);
        self.bytes_dropped += added;
        added
    }

    /// Record a miss of the stream-level deadline and disable it
    pub fn record_miss(&mut self) {
        self.deadlines_missed += 1;
        self.enabled = false;
    }

    /// Record a range the peer declared dropped
    pub fn record_peer_drop(&mut self, range: ByteRange) -> u64 {
        self.receiver_dropped_ranges.insert_range(range)
    }

    /// Disable the deadline without counting a miss
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Forget partial-reliability bookkeeping after the stream is aborted
    pub fn reset(&mut self) {
        self.enabled = false;
        self.dropped_ranges.clear();
        self.receiver_dropped_ranges.clear();
    }
}

/// One enqueued send unit with its own deadline
#[derive(Debug, Clone)]
pub struct ChunkDeadlineNode {
    /// Stream offset of the first byte
    pub offset: u64,
    /// Length of the chunk
    pub length: u64,
    /// Time the chunk was enqueued
    pub enqueue_time: Timestamp,
    /// `enqueue_time + duration`, or `Timestamp::INFINITE` for plain data
    pub chunk_deadline: Timestamp,
    /// Deadline mode of this chunk
    pub mode: DeadlineMode,
    data: Bytes,
    sent: u64,
}

impl ChunkDeadlineNode {
    /// Bytes not yet taken for transmission
    pub fn remaining(&self) -> u64 {
        self.length - self.sent
    }

    /// Offset of the next byte to send
    pub fn next_offset(&self) -> u64 {
        self.offset + self.sent
    }

    /// End of the chunk (exclusive)
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Check whether the chunk carries a deadline
    pub fn has_deadline(&self) -> bool {
        !self.chunk_deadline.is_infinite()
    }

    /// Check whether the chunk is a hard chunk past its deadline
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.mode.is_hard() && self.chunk_deadline.has_passed(now)
    }

    fn unsent_range(&self) -> ByteRange {
        ByteRange::new(self.next_offset(), self.end())
    }
}

/// Data taken from a send queue for one stream frame
#[derive(Debug, Clone)]
pub struct TakenData {
    /// Stream offset of `data`
    pub offset: u64,
    /// Payload bytes
    pub data: Bytes,
    /// Earliest chunk deadline in `data`, `INFINITE` if none
    pub earliest_deadline: Timestamp,
    /// Every contributing chunk that carries a deadline is hard
    pub deadline_chunks_hard: bool,
    /// Some bytes came from chunks queued without a deadline
    pub has_plain: bool,
}

impl TakenData {
    /// Whether every byte is under a hard chunk deadline
    pub fn all_hard(&self) -> bool {
        !self.has_plain && self.deadline_chunks_hard
    }

    /// Deadline info for a packet carrying this data
    ///
    /// Bytes queued without a chunk deadline fall under `stream_deadline`,
    /// the stream-level deadline and mode, when there is one.
    pub fn deadline_info(
        &self,
        send_path: PathId,
        stream_deadline: Option<(Timestamp, DeadlineMode)>,
    ) -> PacketDeadlineInfo {
        match stream_deadline {
            Some((deadline, mode)) if self.has_plain => PacketDeadlineInfo::from_chunks(
                send_path,
                self.earliest_deadline.min(deadline),
                self.deadline_chunks_hard && mode.is_hard(),
            ),
            _ => PacketDeadlineInfo::from_chunks(send_path, self.earliest_deadline, self.all_hard()),
        }
    }
}

/// Per-stream queue of unsent chunks
///
/// Chunks sit in enqueue order. A side index keyed by deadline answers
/// earliest-deadline queries without scanning the queue.
#[derive(Debug, Clone, Default)]
pub struct SendQueue {
    chunks: VecDeque<ChunkDeadlineNode>,
    deadlines: BTreeSet<(Timestamp, u64)>,
    write_offset: u64,
}

impl SendQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append data, returning the stream offset it was placed at
    pub fn push(
        &mut self,
        data: Bytes,
        enqueue_time: Timestamp,
        chunk_deadline: Timestamp,
        mode: DeadlineMode,
    ) -> u64 {
        let offset = self.write_offset;
        let length = data.len() as u64;
        if length == 0 {
            return offset;
        }

        if !chunk_deadline.is_infinite() {
            self.deadlines.insert((chunk_deadline, offset));
        }
        self.chunks.push_back(ChunkDeadlineNode {
            offset,
            length,
            enqueue_time,
            chunk_deadline,
            mode,
            data,
            sent: 0,
        });
        self.write_offset += length;
        offset
    }

    /// Offset of the next byte to send
    pub fn sent_offset(&self) -> u64 {
        self.chunks
            .front()
            .map_or(self.write_offset, ChunkDeadlineNode::next_offset)
    }

    /// Offset the next pushed byte will get
    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    /// Total unsent bytes
    pub fn unsent_bytes(&self) -> u64 {
        self.chunks.iter().map(ChunkDeadlineNode::remaining).sum()
    }

    /// Check if nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Queued chunks in enqueue order
    pub fn chunks(&self) -> impl Iterator<Item = &ChunkDeadlineNode> + '_ {
        self.chunks.iter()
    }

    /// Earliest deadline over all queued chunks
    pub fn earliest_deadline(&self) -> Option<Timestamp> {
        self.deadlines.first().map(|(deadline, _)| *deadline)
    }

    /// Check if every queued chunk is a hard chunk past its deadline
    pub fn all_expired(&self, now: Timestamp) -> bool {
        !self.chunks.is_empty() && self.chunks.iter().all(|c| c.is_expired(now))
    }

    /// Take up to `max_len` contiguous bytes from the front of the queue
    pub fn take(&mut self, max_len: usize) -> Option<TakenData> {
        let max_len = max_len as u64;
        let front = self.chunks.front()?;
        if max_len == 0 {
            return None;
        }

        let offset = front.next_offset();
        let mut parts: Vec<Bytes> = Vec::new();
        let mut taken = 0u64;
        let mut earliest_deadline = Timestamp::INFINITE;
        let mut deadline_chunks_hard = true;
        let mut has_plain = false;

        while taken < max_len {
            let Some(chunk) = self.chunks.front_mut() else {
                break;
            };
            if chunk.next_offset() != offset + taken {
                // A dropped chunk left a hole; the next frame starts after it
                break;
            }

            let n = chunk.remaining().min(max_len - taken);
            let start = chunk.sent as usize;
            parts.push(chunk.data.slice(start..start + n as usize));
            chunk.sent += n;
            taken += n;
            if chunk.has_deadline() {
                earliest_deadline = earliest_deadline.min(chunk.chunk_deadline);
                deadline_chunks_hard &= chunk.mode.is_hard();
            } else {
                has_plain = true;
            }

            if chunk.remaining() == 0 {
                if let Some(done) = self.chunks.pop_front() {
                    self.deadlines.remove(&(done.chunk_deadline, done.offset));
                }
            }
        }

        let data = if parts.len() == 1 {
            parts.pop().unwrap_or_default()
        } else {
            let mut buf = BytesMut::with_capacity(taken as usize);
            for part in &parts {
                buf.extend_from_slice(part);
            }
            buf.freeze()
        };

        Some(TakenData {
            offset,
            data,
            earliest_deadline,
            deadline_chunks_hard,
            has_plain,
        })
    }

    /// Remove hard chunks whose deadline passed, returning their unsent ranges
    pub fn drop_expired(&mut self, now: Timestamp) -> Vec<ByteRange> {
        let mut dropped = Vec::new();
        let deadlines = &mut self.deadlines;
        self.chunks.retain(|chunk| {
            if chunk.is_expired(now) {
                dropped.push(chunk.unsent_range());
                deadlines.remove(&(chunk.chunk_deadline, chunk.offset));
                false
            } else {
                true
            }
        });
        dropped
    }

    /// Remove everything, returning the unsent ranges in order
    pub fn drain_all(&mut self) -> Vec<ByteRange> {
        let ranges = self.chunks.iter().map(ChunkDeadlineNode::unsent_range).collect();
        self.chunks.clear();
        self.deadlines.clear();
        ranges
    }
}
