//! Partial reliability on the send side
//!
//! Drops data whose hard deadline has passed, records what was written off
//! and queues the dropped-range frames that let the receiver skip the gap.

use crate::events::{Outbox, StreamEvent};
use crate::streams::{StreamMap, StreamRecord};
use dmtp_protocol::ranges::ByteRange;
use dmtp_protocol::stream::StreamId;
use dmtp_protocol::time::{Interval, Timestamp};
use std::time::Duration;

/// Rate-limited hard deadline scanner
#[derive(Debug, Clone)]
pub struct GapEngine {
    gate: Interval,
}

impl GapEngine {
    /// Create an engine scanning at most once per `period`
    pub fn new(period: Duration) -> Self {
        GapEngine {
            gate: Interval::new(period),
        }
    }

    /// Run the scan if the period has elapsed
    pub fn poll(&mut self, streams: &mut StreamMap, now: Timestamp, outbox: &mut Outbox) -> Vec<StreamId> {
        if self.gate.poll(now) {
            check_deadlines(streams, now, outbox)
        } else {
            Vec::new()
        }
    }
}

/// Drop the unsent tail of every stream whose hard deadline has passed
///
/// Returns the streams that missed their deadline in this pass. A stream is
/// reported at most once because its deadline is disabled here. A passed
/// soft deadline is disabled without dropping anything.
pub fn check_deadlines(streams: &mut StreamMap, now: Timestamp, outbox: &mut Outbox) -> Vec<StreamId> {
    let mut missed = Vec::new();

    for stream in streams.iter_mut() {
        let Some(state) = stream.deadline.as_mut().filter(|s| s.has_passed(now)) else {
            continue;
        };
        if !state.deadline_type().is_hard() {
            state.disable();
            tracing::debug!(stream = %stream.id, "soft deadline passed");
            continue;
        }

        let dropped = drop_tail(stream, outbox);
        let state = stream.deadline_state();
        state.record_miss();

        if stream.reset.is_none() {
            stream.fin_requested = true;
        }

        tracing::info!(stream = %stream.id, bytes_dropped = dropped, "hard deadline missed");
        outbox.push_event(StreamEvent::DeadlineMissed {
            stream_id: stream.id,
            bytes_dropped: dropped,
        });
        missed.push(stream.id);
    }

    missed
}

fn drop_tail(stream: &mut StreamRecord, outbox: &mut Outbox) -> u64 {
    let id = stream.id;
    let ranges = stream.send.drain_all();
    let state = stream.deadline_state();

    let mut dropped = 0;
    for range in ranges {
        dropped += state.record_drop(range);
        outbox.discard(id, range);
    }
    dropped
}

/// Drop queued hard chunks whose own deadline has passed
///
/// This does not count as a missed stream deadline.
pub fn expire_chunks(stream: &mut StreamRecord, now: Timestamp, outbox: &mut Outbox) -> u64 {
    let ranges = stream.send.drop_expired(now);
    if ranges.is_empty() {
        return 0;
    }

    let id = stream.id;
    let state = stream.deadline_state();
    let mut dropped = 0;
    for range in ranges {
        tracing::debug!(stream = %id, %range, "chunk deadline expired");
        dropped += state.record_drop(range);
        outbox.discard(id, range);
    }
    dropped
}

/// Write off bytes of a lost packet the retransmission gate skipped
pub fn record_skipped(stream: &mut StreamRecord, range: ByteRange, outbox: &mut Outbox) -> u64 {
    let id = stream.id;
    let added = stream.deadline_state().record_drop(range);
    outbox.discard(id, range);
    added
}
