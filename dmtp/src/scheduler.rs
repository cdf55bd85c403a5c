//! Earliest-deadline-first stream scheduler
//!
//! Chooses the stream that gets the next send opportunity. Streams with a
//! pending reset or stop-sending go first. Deadline-active streams are then
//! ordered by effective deadline with ties broken by lowest stream id, unless
//! the fairness arbiter forces a non-deadline turn. Non-deadline streams are
//! served round-robin by the turn they were last scheduled in.

use crate::fairness::{FairnessArbiter, OverrideReason};
use dmtp_protocol::stream::StreamId;
use dmtp_protocol::time::Timestamp;

/// A ready stream as seen by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub stream_id: StreamId,
    /// Effective deadline when the stream is deadline-active
    pub deadline: Option<Timestamp>,
    /// A reset or stop-sending is waiting to go out
    pub urgent: bool,
    /// Turn the stream was last scheduled in, 0 if never
    pub last_turn: u64,
}

impl Candidate {
    /// A ready stream without deadline
    pub fn plain(stream_id: StreamId, last_turn: u64) -> Self {
        Candidate {
            stream_id,
            deadline: None,
            urgent: false,
            last_turn,
        }
    }

    /// A ready deadline-active stream
    pub fn with_deadline(stream_id: StreamId, deadline: Timestamp) -> Self {
        Candidate {
            stream_id,
            deadline: Some(deadline),
            urgent: false,
            last_turn: 0,
        }
    }
}

/// Outcome of one scheduling decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Stream with pending reset or stop-sending
    Urgent(StreamId),
    /// Earliest-deadline stream
    Deadline(StreamId),
    /// Non-deadline stream, `forced` when fairness overrode EDF order
    NonDeadline {
        stream_id: StreamId,
        forced: Option<OverrideReason>,
    },
}

impl Selection {
    pub fn stream_id(&self) -> StreamId {
        match self {
            Selection::Urgent(id) | Selection::Deadline(id) => *id,
            Selection::NonDeadline { stream_id, .. } => *stream_id,
        }
    }

    /// Check if the pick counts as deadline traffic
    pub fn is_deadline(&self) -> bool {
        matches!(self, Selection::Deadline(_))
    }
}

/// EDF scheduler with round-robin fallback
#[derive(Debug, Clone, Default)]
pub struct EdfScheduler {
    turn: u64,
}

impl EdfScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a stream among `candidates`
    ///
    /// Passing no arbiter disables the fairness override.
    pub fn select(
        &self,
        candidates: &[Candidate],
        arbiter: Option<&mut FairnessArbiter>,
        now: Timestamp,
    ) -> Option<Selection> {
        if let Some(urgent) = candidates
            .iter()
            .filter(|c| c.urgent)
            .min_by_key(|c| c.stream_id)
        {
            return Some(Selection::Urgent(urgent.stream_id));
        }

        let earliest = candidates
            .iter()
            .filter_map(|c| c.deadline.map(|d| (d, c.stream_id)))
            .min();
        let next_plain = candidates
            .iter()
            .filter(|c| c.deadline.is_none())
            .min_by_key(|c| (c.last_turn, c.stream_id));

        match (earliest, next_plain) {
            (Some((deadline, stream_id)), Some(plain)) => {
                let forced = arbiter.and_then(|a| a.check_override(now));
                match forced {
                    Some(reason) => {
                        tracing::debug!(
                            stream = %plain.stream_id,
                            skipped = %stream_id,
                            ?reason,
                            "fairness override"
                        );
                        Some(Selection::NonDeadline {
                            stream_id: plain.stream_id,
                            forced: Some(reason),
                        })
                    }
                    None => {
                        tracing::trace!(stream = %stream_id, %deadline, "edf pick");
                        Some(Selection::Deadline(stream_id))
                    }
                }
            }
            (Some((_, stream_id)), None) => Some(Selection::Deadline(stream_id)),
            (None, Some(plain)) => Some(Selection::NonDeadline {
                stream_id: plain.stream_id,
                forced: None,
            }),
            (None, None) => None,
        }
    }

    /// Advance the turn counter, returning the turn just taken
    pub fn commit(&mut self) -> u64 {
        self.turn += 1;
        self.turn
    }

    /// Number of committed turns
    pub fn turns(&self) -> u64 {
        self.turn
    }
}
