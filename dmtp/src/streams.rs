//! Per-stream send and receive records

use crate::recv::ReceiveStream;
use dmtp_protocol::packet::PathId;
use dmtp_protocol::stream::{SendQueue, StreamDeadlineState, StreamId};
use dmtp_protocol::time::Timestamp;
use std::collections::BTreeMap;

/// Everything the engine knows about one stream
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub id: StreamId,
    /// Unsent data
    pub send: SendQueue,
    /// Created the first time the stream gets a deadline
    pub deadline: Option<StreamDeadlineState>,
    /// Receive-side reassembly
    pub recv: ReceiveStream,
    /// Flow control limit on the send offset
    pub max_data: u64,
    /// Path this stream is pinned to, if any
    pub affinity: Option<PathId>,
    pub fin_requested: bool,
    pub fin_sent: bool,
    /// Application error code of a requested reset
    pub reset: Option<u64>,
    /// Send offset reached when the reset was requested
    pub reset_final_size: u64,
    pub reset_sent: bool,
    /// Application error code of a requested stop-sending
    pub stop_sending: Option<u64>,
    pub stop_sending_sent: bool,
    /// Scheduler turn this stream was last picked in
    pub last_turn: u64,
}

impl StreamRecord {
    pub fn new(id: StreamId) -> Self {
        StreamRecord {
            id,
            send: SendQueue::new(),
            deadline: None,
            recv: ReceiveStream::new(),
            max_data: u64::MAX,
            affinity: None,
            fin_requested: false,
            fin_sent: false,
            reset: None,
            reset_final_size: 0,
            reset_sent: false,
            stop_sending: None,
            stop_sending_sent: false,
            last_turn: 0,
        }
    }

    /// Deadline state, created on first use
    pub fn deadline_state(&mut self) -> &mut StreamDeadlineState {
        self.deadline.get_or_insert_with(StreamDeadlineState::new)
    }

    /// Check whether the stream has an enabled deadline
    pub fn is_deadline_active(&self) -> bool {
        self.deadline.as_ref().map_or(false, StreamDeadlineState::is_enabled)
    }

    /// Check whether the application may still write
    pub fn is_writable(&self) -> bool {
        !self.fin_requested && self.reset.is_none()
    }

    /// A reset or stop-sending is waiting to go out
    pub fn has_urgent_control(&self) -> bool {
        (self.reset.is_some() && !self.reset_sent)
            || (self.stop_sending.is_some() && !self.stop_sending_sent)
    }

    /// Bytes the stream may still send under flow control
    pub fn credit(&self) -> u64 {
        self.max_data.saturating_sub(self.send.sent_offset())
    }

    /// Only a FIN is left to send
    pub fn needs_fin(&self) -> bool {
        self.fin_requested && !self.fin_sent && self.send.is_empty()
    }

    /// Check whether the stream has anything the scheduler can serve
    pub fn is_ready(&self, now: Timestamp) -> bool {
        if self.reset.is_some() {
            return false;
        }
        let has_data = !self.send.is_empty() && !self.send.all_expired(now) && self.credit() > 0;
        has_data || self.needs_fin()
    }

    /// Deadline EDF orders this stream by
    ///
    /// The first queued chunk that has not expired decides when it carries a
    /// deadline; otherwise the stream-level deadline applies.
    pub fn effective_deadline(&self, now: Timestamp) -> Option<Timestamp> {
        let state = self.deadline.as_ref().filter(|d| d.is_enabled())?;
        let chunk_deadline = self
            .send
            .chunks()
            .find(|c| !c.is_expired(now))
            .filter(|c| c.has_deadline())
            .map(|c| c.chunk_deadline);
        chunk_deadline.or(state.absolute_deadline())
    }

    /// Earliest deadline still pending on unsent data, for urgency
    pub fn pending_deadline(&self) -> Option<Timestamp> {
        let state = self.deadline.as_ref().filter(|d| d.is_enabled())?;
        if self.send.is_empty() {
            return None;
        }
        match (state.absolute_deadline(), self.send.earliest_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Stream table with a capacity limit
#[derive(Debug, Clone)]
pub struct StreamMap {
    streams: BTreeMap<StreamId, StreamRecord>,
    max_streams: usize,
}

impl StreamMap {
    pub fn new(max_streams: usize) -> Self {
        StreamMap {
            streams: BTreeMap::new(),
            max_streams,
        }
    }

    pub fn max_streams(&self) -> usize {
        self.max_streams
    }

    /// Check if `id` exists or could be created
    pub fn can_open(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id) || self.streams.len() < self.max_streams
    }

    /// Get or create a stream, `None` when the table is full
    pub fn get_or_create(&mut self, id: StreamId) -> Option<&mut StreamRecord> {
        if !self.can_open(id) {
            return None;
        }
        Some(self.streams.entry(id).or_insert_with(|| StreamRecord::new(id)))
    }

    pub fn get(&self, id: StreamId) -> Option<&StreamRecord> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut StreamRecord> {
        self.streams.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamRecord> + '_ {
        self.streams.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StreamRecord> + '_ {
        self.streams.values_mut()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
