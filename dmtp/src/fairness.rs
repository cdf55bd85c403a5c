//! Scheduler-level fairness arbiter
//!
//! Bounds how long ready non-deadline streams can be starved by EDF order.
//! Two triggers force a non-deadline pick for one turn: the last non-deadline
//! pick is older than `max_starvation`, or non-deadline traffic holds less
//! than `min_non_deadline_share` of the bytes sent in the current window.

use dmtp_protocol::config::FairnessConfig;
use dmtp_protocol::time::Timestamp;
use std::time::Duration;

/// Why the arbiter overrode EDF order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideReason {
    /// No non-deadline stream was scheduled for too long
    Starvation,
    /// Non-deadline share in the window fell below the minimum
    Share,
}

/// Fairness arbiter state
#[derive(Debug, Clone)]
pub struct FairnessArbiter {
    min_non_deadline_share: f64,
    max_starvation_time: Duration,
    window: Duration,
    deadline_bytes_sent: u64,
    non_deadline_bytes_sent: u64,
    window_start_time: Timestamp,
    last_non_deadline_scheduled: Timestamp,
}

impl FairnessArbiter {
    /// Create an arbiter; `now` counts as the last non-deadline turn
    pub fn new(config: &FairnessConfig, now: Timestamp) -> Self {
        FairnessArbiter {
            min_non_deadline_share: config.min_non_deadline_share,
            max_starvation_time: config.max_starvation(),
            window: config.window(),
            deadline_bytes_sent: 0,
            non_deadline_bytes_sent: 0,
            window_start_time: now,
            last_non_deadline_scheduled: now,
        }
    }

    /// Update parameters
    ///
    /// A share outside `[0, 1]` or a zero starvation time keeps the previous
    /// value of that parameter.
    pub fn configure(&mut self, min_non_deadline_share: f64, max_starvation_time: Duration) {
        if (0.0..=1.0).contains(&min_non_deadline_share) {
            self.min_non_deadline_share = min_non_deadline_share;
        }
        if !max_starvation_time.is_zero() {
            self.max_starvation_time = max_starvation_time;
        }
    }

    /// Check whether this decision must go to a non-deadline stream
    pub fn check_override(&mut self, now: Timestamp) -> Option<OverrideReason> {
        self.roll_window(now);

        let starving = now.saturating_duration_since(self.last_non_deadline_scheduled);
        if starving > self.max_starvation_time {
            return Some(OverrideReason::Starvation);
        }

        match self.non_deadline_share() {
            Some(share) if share < self.min_non_deadline_share => Some(OverrideReason::Share),
            _ => None,
        }
    }

    /// Charge a scheduling decision
    pub fn record(&mut self, deadline: bool, bytes: u64, now: Timestamp) {
        self.roll_window(now);
        if deadline {
            self.deadline_bytes_sent += bytes;
        } else {
            self.non_deadline_bytes_sent += bytes;
            self.last_non_deadline_scheduled = now;
        }
    }

    /// Non-deadline share of bytes in the current window
    pub fn non_deadline_share(&self) -> Option<f64> {
        let total = self.deadline_bytes_sent + self.non_deadline_bytes_sent;
        if total == 0 {
            None
        } else {
            Some(self.non_deadline_bytes_sent as f64 / total as f64)
        }
    }

    fn roll_window(&mut self, now: Timestamp) {
        if now >= self.window_start_time + self.window {
            self.deadline_bytes_sent = 0;
            self.non_deadline_bytes_sent = 0;
            self.window_start_time = now;
        }
    }

    pub fn min_non_deadline_share(&self) -> f64 {
        self.min_non_deadline_share
    }

    pub fn max_starvation_time(&self) -> Duration {
        self.max_starvation_time
    }

    pub fn deadline_bytes_sent(&self) -> u64 {
        self.deadline_bytes_sent
    }

    pub fn non_deadline_bytes_sent(&self) -> u64 {
        self.non_deadline_bytes_sent
    }

    pub fn window_start_time(&self) -> Timestamp {
        self.window_start_time
    }

    pub fn last_non_deadline_scheduled(&self) -> Timestamp {
        self.last_non_deadline_scheduled
    }
}
