//! Receive-side reassembly with gap skipping
//!
//! Out-of-order data is buffered by offset. Delivery advances
//! `consumed_offset` over buffered data and over ranges the peer declared
//! dropped, emitting one gap event per contiguous dropped interval.

use crate::events::StreamEvent;
use bytes::Bytes;
use dmtp_protocol::ranges::RangeSet;
use dmtp_protocol::stream::StreamId;
use dmtp_protocol::varint::MAX_VARINT;
use std::collections::BTreeMap;
use thiserror::Error;

/// Reassembly errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("Data beyond final size {final_size}: end {end}")]
    BeyondFinalSize { final_size: u64, end: u64 },

    #[error("Final size changed from {previous} to {new}")]
    FinalSizeChanged { previous: u64, new: u64 },

    #[error("Data at offset {offset} with length {length} exceeds the maximum stream size")]
    OffsetOverflow { offset: u64, length: u64 },
}

/// Receive side of one stream
#[derive(Debug, Clone, Default)]
pub struct ReceiveStream {
    consumed_offset: u64,
    buffered: BTreeMap<u64, Bytes>,
    received: RangeSet,
    final_size: Option<u64>,
    fin_delivered: bool,
    gaps_delivered: u64,
}

impl ReceiveStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of the next byte the application will see
    pub fn consumed_offset(&self) -> u64 {
        self.consumed_offset
    }

    /// Final size once FIN is known
    pub fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    /// Ranges received so far
    pub fn received(&self) -> &RangeSet {
        &self.received
    }

    /// Bytes buffered out of order
    pub fn buffered_bytes(&self) -> u64 {
        self.buffered.values().map(|b| b.len() as u64).sum()
    }

    /// Number of gap events emitted
    pub fn gaps_delivered(&self) -> u64 {
        self.gaps_delivered
    }

    /// Check whether FIN has been delivered
    pub fn is_finished(&self) -> bool {
        self.fin_delivered
    }

    /// Accept a stream frame, buffering only bytes not seen before
    pub fn on_data(&mut self, offset: u64, data: Bytes, fin: bool) -> Result<(), ReassemblyError> {
        let length = data.len() as u64;
        let end = match offset.checked_add(length) {
            Some(end) if end <= MAX_VARINT => end,
            _ => return Err(ReassemblyError::OffsetOverflow { offset, length }),
        };

        if let Some(final_size) = self.final_size {
            if end > final_size {
                return Err(ReassemblyError::BeyondFinalSize { final_size, end });
            }
            if fin && end != final_size {
                return Err(ReassemblyError::FinalSizeChanged {
                    previous: final_size,
                    new: end,
                });
            }
        }
        if fin {
            let highest = self.received.last().map_or(0, |r| r.end);
            if highest > end {
                return Err(ReassemblyError::BeyondFinalSize {
                    final_size: end,
                    end: highest,
                });
            }
            self.final_size = Some(end);
        }

        let mut pos = offset.max(self.consumed_offset);
        while pos < end {
            if let Some(covered) = self.received.range_containing(pos) {
                pos = covered.end;
                continue;
            }
            let piece_end = self
                .received
                .next_from(pos)
                .map_or(end, |next| next.start.min(end));
            let start = (pos - offset) as usize;
            let stop = (piece_end - offset) as usize;
            self.buffered.insert(pos, data.slice(start..stop));
            pos = piece_end;
        }

        self.received.insert(offset, end);
        Ok(())
    }

    /// Deliver everything that is now contiguous
    ///
    /// `dropped` holds the ranges the peer declared dropped.
    pub fn deliver(&mut self, stream_id: StreamId, dropped: &RangeSet, events: &mut Vec<StreamEvent>) {
        loop {
            if let Some(data) = self.buffered.remove(&self.consumed_offset) {
                let offset = self.consumed_offset;
                self.consumed_offset += data.len() as u64;
                events.push(StreamEvent::Data {
                    stream_id,
                    offset,
                    data,
                });
                continue;
            }

            if let Some(gap) = dropped.range_containing(self.consumed_offset) {
                let offset = self.consumed_offset;
                let length = gap.end - offset;
                tracing::debug!(stream = %stream_id, offset, length, "skipping dropped range");
                events.push(StreamEvent::Gap {
                    stream_id,
                    offset,
                    length,
                });
                self.gaps_delivered += 1;
                self.consumed_offset = gap.end;
                self.trim_buffered();
                continue;
            }

            break;
        }

        if !self.fin_delivered && self.final_size == Some(self.consumed_offset) {
            self.fin_delivered = true;
            events.push(StreamEvent::Fin {
                stream_id,
                final_size: self.consumed_offset,
            });
        }
    }

    /// Drop buffered bytes below `consumed_offset`
    fn trim_buffered(&mut self) {
        let consumed = self.consumed_offset;
        let stale: Vec<u64> = self.buffered.range(..consumed).map(|(k, _)| *k).collect();
        for key in stale {
            if let Some(data) = self.buffered.remove(&key) {
                let end = key + data.len() as u64;
                if end > consumed {
                    self.buffered
                        .insert(consumed, data.slice((consumed - key) as usize..));
                }
            }
        }
    }
}
