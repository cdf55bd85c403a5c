//! Property-based tests for the deadline engine
//!
//! These tests use proptest to check the range set, the pacing bounds, the
//! retransmission gate, EDF ordering and the long-run fairness share over
//! random inputs.

mod common;

use bytes::Bytes;
use common::{ms, negotiated};
use dmtp::scheduler::{Candidate, EdfScheduler, Selection};
use dmtp::should_skip_retransmit;
use dmtp_protocol::congestion::{PathUrgencyState, UrgencyLevel};
use dmtp_protocol::{
    CongestionConfig, DeadlineConfig, FairnessConfig, PacketDeadlineInfo, PathId, RangeSet, StreamId, Timestamp,
};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::time::Duration;

// Property test strategies

fn range_strategy() -> impl Strategy<Value = (u64, u64)> {
    (0u64..2_000, 0u64..300).prop_map(|(start, len)| (start, start + len))
}

fn urgency_strategy() -> impl Strategy<Value = UrgencyLevel> {
    prop_oneof![
        Just(UrgencyLevel::None),
        Just(UrgencyLevel::Low),
        Just(UrgencyLevel::Medium),
        Just(UrgencyLevel::High),
        Just(UrgencyLevel::Critical),
    ]
}

/// Time to deadline that classifies as `level`
fn remaining_for(level: UrgencyLevel) -> Option<Duration> {
    match level {
        UrgencyLevel::None => None,
        UrgencyLevel::Low => Some(Duration::from_millis(150)),
        UrgencyLevel::Medium => Some(Duration::from_millis(80)),
        UrgencyLevel::High => Some(Duration::from_millis(30)),
        UrgencyLevel::Critical => Some(Duration::from_millis(5)),
    }
}

fn pacing_for(level: UrgencyLevel, base: f64) -> f64 {
    let now = Timestamp::from_millis(1_000);
    let mut state = PathUrgencyState::new(CongestionConfig::default());
    let deadline = remaining_for(level).map(|d| Timestamp::deadline_after(now, d));
    state.update_urgency(deadline, now);
    state.pacing_gain(base, false)
}

proptest! {
    #[test]
    fn prop_range_set_matches_byte_model(ranges in prop::collection::vec(range_strategy(), 0..40)) {
        let mut set = RangeSet::new();
        let mut model = BTreeSet::new();

        for (start, end) in ranges {
            let before = model.len() as u64;
            model.extend(start..end);
            let added = set.insert(start, end);
            prop_assert_eq!(added, model.len() as u64 - before);
        }

        prop_assert_eq!(set.covered_bytes(), model.len() as u64);

        // Sorted, disjoint and never touching
        let spans: Vec<_> = set.iter().collect();
        for pair in spans.windows(2) {
            prop_assert!(pair[0].end < pair[1].start);
        }
        for span in &spans {
            prop_assert!(span.start < span.end);
        }
    }

    #[test]
    fn prop_skip_covered_lands_outside(ranges in prop::collection::vec(range_strategy(), 1..20), probe in 0u64..2_400) {
        let mut set = RangeSet::new();
        for (start, end) in ranges {
            set.insert(start, end);
        }
        let skipped = set.skip_covered(probe);
        prop_assert!(skipped >= probe);
        prop_assert!(!set.contains(skipped));
    }

    #[test]
    fn prop_pacing_monotonic_and_bounded(a in urgency_strategy(), b in urgency_strategy(), base in 0.5f64..3.0) {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let gain_low = pacing_for(low, base);
        let gain_high = pacing_for(high, base);

        prop_assert!(gain_low <= gain_high + 1e-9);
        let ceiling = base * CongestionConfig::default().pacing_gain_ceiling;
        prop_assert!(gain_high <= ceiling + 1e-9);
        prop_assert!(gain_low >= base - 1e-9);
    }

    #[test]
    fn prop_skip_only_when_hard_and_passed(
        contains in any::<bool>(),
        hard in any::<bool>(),
        deadline_ms in 0u64..1_000,
        now_ms in 0u64..1_000,
    ) {
        let info = PacketDeadlineInfo {
            contains_deadline_data: contains,
            earliest_deadline: Timestamp::from_millis(deadline_ms),
            send_path: PathId::DEFAULT,
            hard,
        };
        let expected = contains && hard && now_ms >= deadline_ms;
        prop_assert_eq!(should_skip_retransmit(&info, Timestamp::from_millis(now_ms)), expected);
    }

    #[test]
    fn prop_edf_picks_minimum(deadlines in prop::collection::vec(0u64..500, 1..16)) {
        let candidates: Vec<Candidate> = deadlines
            .iter()
            .enumerate()
            .map(|(i, d)| Candidate::with_deadline(StreamId::new(i as u64 * 4), Timestamp::from_millis(*d)))
            .collect();

        let picked = EdfScheduler::new()
            .select(&candidates, None, Timestamp::ZERO)
            .unwrap();
        let expected = candidates
            .iter()
            .min_by_key(|c| (c.deadline, c.stream_id))
            .unwrap()
            .stream_id;
        prop_assert_eq!(picked, Selection::Deadline(expected));
    }
}

const SATURATION_POLLS: u64 = 400;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_non_deadline_share_holds_under_saturation(share_pct in 5u64..60, packet in 400usize..1200) {
        let min_share = share_pct as f64 / 100.0;
        let config = DeadlineConfig {
            fairness: FairnessConfig {
                min_non_deadline_share: min_share,
                max_starvation_ms: 10_000,
                window_ms: 100,
            },
            ..DeadlineConfig::default()
        };
        let mut conn = negotiated(config);
        let backlog = Bytes::from(vec![0u8; SATURATION_POLLS as usize * packet]);
        conn.set_stream_deadline(StreamId::new(0), Duration::from_secs(60), false, ms(0))
            .unwrap();
        conn.add_data(StreamId::new(0), backlog.clone(), false, ms(0)).unwrap();
        conn.add_data(StreamId::new(4), backlog, false, ms(0)).unwrap();

        for step in 0..SATURATION_POLLS {
            prop_assert!(conn.poll_transmit(packet, ms(step)).is_some());
        }

        let stats = conn.stats();
        let total = stats.deadline_bytes_sent + stats.non_deadline_bytes_sent;
        let share = stats.non_deadline_bytes_sent as f64 / total as f64;
        prop_assert!(share >= min_share - 0.03, "share {} below minimum {}", share, min_share);
        // EDF still owns everything above the minimum
        prop_assert!(share <= min_share + 0.05, "share {} far above minimum {}", share, min_share);
    }
}
