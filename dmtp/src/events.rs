//! Application-visible stream events

use bytes::Bytes;
use dmtp_protocol::frame::{DeadlineFrame, StreamDataDroppedFrame};
use dmtp_protocol::ranges::ByteRange;
use dmtp_protocol::stream::StreamId;
use std::collections::VecDeque;

/// Event delivered to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// In-order stream data
    Data {
        stream_id: StreamId,
        offset: u64,
        data: Bytes,
    },
    /// All data up to the final size has been delivered
    Fin { stream_id: StreamId, final_size: u64 },
    /// The peer reset the stream
    Reset { stream_id: StreamId, error_code: u64 },
    /// The peer asked us to stop sending
    StopSending { stream_id: StreamId, error_code: u64 },
    /// The peer dropped `[offset, offset + length)` and it will never arrive
    Gap {
        stream_id: StreamId,
        offset: u64,
        length: u64,
    },
    /// Local data `[offset, offset + length)` was written off
    DataDiscarded {
        stream_id: StreamId,
        offset: u64,
        length: u64,
    },
    /// A hard stream deadline passed with data still unsent
    DeadlineMissed { stream_id: StreamId, bytes_dropped: u64 },
}

impl StreamEvent {
    /// Stream the event belongs to
    pub fn stream_id(&self) -> StreamId {
        match self {
            StreamEvent::Data { stream_id, .. }
            | StreamEvent::Fin { stream_id, .. }
            | StreamEvent::Reset { stream_id, .. }
            | StreamEvent::StopSending { stream_id, .. }
            | StreamEvent::Gap { stream_id, .. }
            | StreamEvent::DataDiscarded { stream_id, .. }
            | StreamEvent::DeadlineMissed { stream_id, .. } => *stream_id,
        }
    }
}

/// Frames and events produced while processing, drained by the connection
#[derive(Debug, Default)]
pub struct Outbox {
    /// Control frames waiting for a packet
    pub control: VecDeque<DeadlineFrame>,
    /// Events waiting for the application
    pub events: VecDeque<StreamEvent>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a dropped-range frame and the matching local event
    pub fn discard(&mut self, stream_id: StreamId, range: ByteRange) {
        if range.is_empty() {
            return;
        }
        self.control.push_back(DeadlineFrame::StreamDataDropped(StreamDataDroppedFrame {
            stream_id,
            offset: range.start,
            length: range.len(),
        }));
        self.events.push_back(StreamEvent::DataDiscarded {
            stream_id,
            offset: range.start,
            length: range.len(),
        });
    }

    /// Queue an event
    pub fn push_event(&mut self, event: StreamEvent) {
        self.events.push_back(event);
    }

    /// Queue a control frame
    pub fn push_control(&mut self, frame: DeadlineFrame) {
        self.control.push_back(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discard_queues_frame_and_event() {
        let mut outbox = Outbox::new();
        outbox.discard(StreamId::new(4), ByteRange::new(100, 250));

        assert_eq!(
            outbox.control.pop_front(),
            Some(DeadlineFrame::StreamDataDropped(StreamDataDroppedFrame {
                stream_id: StreamId::new(4),
                offset: 100,
                length: 150,
            }))
        );
        assert_eq!(
            outbox.events.pop_front(),
            Some(StreamEvent::DataDiscarded {
                stream_id: StreamId::new(4),
                offset: 100,
                length: 150,
            })
        );
    }

    #[test]
    fn test_discard_empty_range_is_noop() {
        let mut outbox = Outbox::new();
        outbox.discard(StreamId::new(4), ByteRange::new(10, 10));
        assert!(outbox.control.is_empty());
        assert!(outbox.events.is_empty());
    }
}
