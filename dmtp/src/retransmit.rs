//! Smart retransmission gate
//!
//! A lost packet is written off instead of repaired only when every byte of
//! stream data in it is under a hard deadline that has already passed.
//! Anything less certain is retransmitted.

use dmtp_protocol::packet::{PacketDeadlineInfo, PathId, StreamFrame};
use dmtp_protocol::stream::StreamId;
use dmtp_protocol::time::Timestamp;

/// Check whether a lost packet's stream data should not be resent
pub fn should_skip_retransmit(info: &PacketDeadlineInfo, now: Timestamp) -> bool {
    info.contains_deadline_data && info.hard && info.earliest_deadline.has_passed(now)
}

/// What happens to the stream data of a lost packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetransmitDecision {
    /// The packet carried no stream data; its control frames are requeued
    Nothing,
    /// The bytes are written off and a dropped-range frame is queued
    Skip {
        stream_id: StreamId,
        offset: u64,
        length: u64,
    },
    /// The frame is queued for the next transmission on `path`
    Resend { path: PathId, frame: StreamFrame },
}

impl RetransmitDecision {
    pub fn is_skip(&self) -> bool {
        matches!(self, RetransmitDecision::Skip { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    fn info(contains: bool, hard: bool, deadline_ms: u64) -> PacketDeadlineInfo {
        PacketDeadlineInfo {
            contains_deadline_data: contains,
            earliest_deadline: ms(deadline_ms),
            send_path: PathId::DEFAULT,
            hard,
        }
    }

    #[test]
    fn test_skip_truth_table() {
        // contains, hard, passed -> skip
        let cases = [
            (true, true, true, true),
            (true, true, false, false),
            (true, false, true, false),
            (true, false, false, false),
            (false, true, true, false),
            (false, false, true, false),
        ];
        for (contains, hard, passed, expected) in cases {
            let now = if passed { ms(100) } else { ms(10) };
            assert_eq!(
                should_skip_retransmit(&info(contains, hard, 50), now),
                expected,
                "contains={contains} hard={hard} passed={passed}"
            );
        }
    }

    #[test]
    fn test_deadline_boundary_counts_as_passed() {
        assert!(should_skip_retransmit(&info(true, true, 50), ms(50)));
    }

    #[test]
    fn test_no_deadline_info_retransmits() {
        let none = PacketDeadlineInfo::none(PathId::DEFAULT);
        assert!(!should_skip_retransmit(&none, Timestamp::from_micros(u64::MAX - 1)));
    }
}
