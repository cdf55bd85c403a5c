//! Deadline-aware congestion extension
//!
//! Scales the pacing gain and congestion window chosen by the host's
//! controller according to how close the nearest deadline is. The host keeps
//! its own algorithm; this module only reads its current values through
//! [`CongestionHost`] and returns adjusted ones.

use crate::config::CongestionConfig;
use crate::time::Timestamp;
use std::fmt;
use std::time::Duration;

/// Coarse classification of deadline pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum UrgencyLevel {
    /// No deadline pressure
    #[default]
    None,
    /// More than 100ms to the deadline
    Low,
    /// 50-100ms to the deadline
    Medium,
    /// 20-50ms to the deadline
    High,
    /// 20ms or less, or already overdue
    Critical,
}

impl UrgencyLevel {
    /// Classify a time-to-deadline
    pub fn from_time_to_deadline(remaining: Duration) -> Self {
        match remaining.as_micros() {
            r if r > 100_000 => UrgencyLevel::Low,
            r if r > 50_000 => UrgencyLevel::Medium,
            r if r > 20_000 => UrgencyLevel::High,
            _ => UrgencyLevel::Critical,
        }
    }

    /// Classify the earliest pending deadline as seen from `now`
    pub fn classify(earliest: Option<Timestamp>, now: Timestamp) -> Self {
        match earliest {
            Some(deadline) if !deadline.is_infinite() => {
                Self::from_time_to_deadline(deadline.remaining_from(now))
            }
            _ => UrgencyLevel::None,
        }
    }

    /// Pacing multiplier before fairness scaling
    pub fn pacing_multiplier(self) -> f64 {
        match self {
            UrgencyLevel::None => 1.0,
            UrgencyLevel::Low => 1.1,
            UrgencyLevel::Medium => 1.25,
            UrgencyLevel::High => 1.5,
            UrgencyLevel::Critical => 2.0,
        }
    }

    /// Congestion window multiplier, only for high and critical urgency
    pub fn cwnd_multiplier(self) -> Option<f64> {
        match self {
            UrgencyLevel::High => Some(1.25),
            UrgencyLevel::Critical => Some(1.5),
            _ => None,
        }
    }
}

impl fmt::Display for UrgencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UrgencyLevel::None => "none",
            UrgencyLevel::Low => "low",
            UrgencyLevel::Medium => "medium",
            UrgencyLevel::High => "high",
            UrgencyLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Phase of the host's bandwidth probing cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbePhase {
    Startup,
    Drain,
    ProbeBwDown,
    ProbeBwCruise,
    ProbeBwRefill,
    ProbeBwUp,
    ProbeRtt,
}

/// Probe-phase hints for the host controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProbeDirective {
    /// Do not enter (or stay in) the probe-down phase
    pub skip_probe_down: bool,
    /// Leave the current probe phase as soon as possible
    pub quick_probe_exit: bool,
}

impl ProbeDirective {
    /// Check if the directive asks for any change
    pub fn is_active(&self) -> bool {
        self.skip_probe_down || self.quick_probe_exit
    }
}

/// Read-only view of the host congestion controller
pub trait CongestionHost {
    /// Current pacing gain before deadline adjustment
    fn pacing_gain(&self) -> f64;

    /// Current congestion window in bytes
    fn congestion_window(&self) -> u64;

    /// Bandwidth-delay product estimate in bytes
    fn bandwidth_delay_product(&self) -> u64;

    /// Current probe phase
    fn probe_phase(&self) -> ProbePhase;
}

/// Plain snapshot of controller values
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostSnapshot {
    pub pacing_gain: f64,
    pub congestion_window: u64,
    pub bandwidth_delay_product: u64,
    pub probe_phase: ProbePhase,
}

impl CongestionHost for HostSnapshot {
    fn pacing_gain(&self) -> f64 {
        self.pacing_gain
    }

    fn congestion_window(&self) -> u64 {
        self.congestion_window
    }

    fn bandwidth_delay_product(&self) -> u64 {
        self.bandwidth_delay_product
    }

    fn probe_phase(&self) -> ProbePhase {
        self.probe_phase
    }
}

/// Values the host controller should apply
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CongestionAdjustment {
    /// Urgency the adjustment was computed for
    pub urgency: UrgencyLevel,
    /// Pacing gain to use
    pub pacing_gain: f64,
    /// Congestion window to use, in bytes
    pub congestion_window: u64,
    /// Probe-phase hints
    pub probe: ProbeDirective,
}

/// Per-path urgency and boost state
#[derive(Debug, Clone)]
pub struct PathUrgencyState {
    config: CongestionConfig,
    urgency_level: UrgencyLevel,
    earliest_deadline: Option<Timestamp>,
    deadline_pacing_gain: f64,
    effective_pacing_gain: f64,
    deadline_cwnd_boost: u64,
    boost_end_time: Option<Timestamp>,
    deadline_bytes_sent: u64,
    total_bytes_sent: u64,
    window_start: Option<Timestamp>,
    skip_probe_down: bool,
    quick_probe_exit: bool,
    last_update_time: Option<Timestamp>,
}

impl PathUrgencyState {
    /// Create state with no urgency and unit gains
    pub fn new(config: CongestionConfig) -> Self {
        PathUrgencyState {
            config,
            urgency_level: UrgencyLevel::None,
            earliest_deadline: None,
            deadline_pacing_gain: 1.0,
            effective_pacing_gain: 1.0,
            deadline_cwnd_boost: 0,
            boost_end_time: None,
            deadline_bytes_sent: 0,
            total_bytes_sent: 0,
            window_start: None,
            skip_probe_down: false,
            quick_probe_exit: false,
            last_update_time: None,
        }
    }

    /// Record the earliest pending deadline found by the urgency scan
    ///
    /// Returns true if the urgency level changed.
    pub fn update_urgency(&mut self, earliest: Option<Timestamp>, now: Timestamp) -> bool {
        let level = UrgencyLevel::classify(earliest, now);
        let changed = level != self.urgency_level;
        if changed {
            tracing::debug!(from = %self.urgency_level, to = %level, "urgency level changed");
        }

        self.urgency_level = level;
        self.earliest_deadline = earliest.filter(|d| !d.is_infinite());
        self.last_update_time = Some(now);
        changed
    }

    /// Pacing gain to use given the host's base gain
    pub fn pacing_gain(&mut self, base_gain: f64, in_probe_up: bool) -> f64 {
        if self.urgency_level == UrgencyLevel::None || in_probe_up {
            self.deadline_pacing_gain = 1.0;
            self.effective_pacing_gain = base_gain;
            return base_gain;
        }

        let mut multiplier = self.urgency_level.pacing_multiplier();
        if let Some(share) = self.deadline_share() {
            let max_share = self.config.max_deadline_share;
            if share > max_share {
                multiplier = 1.0 + (multiplier - 1.0) * (max_share / share);
            }
        }

        let ceiling = base_gain * self.config.pacing_gain_ceiling;
        self.deadline_pacing_gain = multiplier;
        self.effective_pacing_gain = (base_gain * multiplier).min(ceiling);
        self.effective_pacing_gain
    }

    /// Congestion window to use given the host's window and BDP
    pub fn cwnd_adjustment(&mut self, base_cwnd: u64, bdp: u64, now: Timestamp) -> u64 {
        if self.boost_end_time.map_or(false, |end| end.has_passed(now)) {
            self.deadline_cwnd_boost = 0;
            self.boost_end_time = None;
        }

        let Some(factor) = self.urgency_level.cwnd_multiplier() else {
            return base_cwnd;
        };

        let cap = (bdp as f64 * self.config.cwnd_bdp_cap) as u64;
        let target = ((base_cwnd as f64 * factor) as u64).min(cap);
        if target > base_cwnd {
            self.deadline_cwnd_boost = target - base_cwnd;
            self.boost_end_time = Some(now + self.config.cwnd_boost_lifetime());
            target
        } else {
            base_cwnd
        }
    }

    /// Probe-phase hints for the current urgency
    pub fn probe_directive(&mut self, phase: ProbePhase) -> ProbeDirective {
        let mut directive = ProbeDirective::default();
        if self.urgency_level >= UrgencyLevel::High && phase == ProbePhase::ProbeBwDown {
            directive.skip_probe_down = true;
        }
        if self.urgency_level == UrgencyLevel::Critical {
            directive.quick_probe_exit = true;
        }

        self.skip_probe_down = directive.skip_probe_down;
        self.quick_probe_exit = directive.quick_probe_exit;
        directive
    }

    /// Compute all adjustments for the host's current values
    pub fn adjust<H: CongestionHost + ?Sized>(&mut self, host: &H, now: Timestamp) -> CongestionAdjustment {
        let phase = host.probe_phase();
        let pacing_gain = self.pacing_gain(host.pacing_gain(), phase == ProbePhase::ProbeBwUp);
        let congestion_window =
            self.cwnd_adjustment(host.congestion_window(), host.bandwidth_delay_product(), now);
        let probe = self.probe_directive(phase);

        CongestionAdjustment {
            urgency: self.urgency_level,
            pacing_gain,
            congestion_window,
            probe,
        }
    }

    /// Attribute sent bytes to the rolling fairness window
    pub fn record_sent(&mut self, bytes: u64, deadline_boosted: bool, now: Timestamp) {
        let window = self.config.fairness_window();
        let expired = self
            .window_start
            .map_or(true, |start| now >= start + window);
        if expired {
            self.deadline_bytes_sent = 0;
            self.total_bytes_sent = 0;
            self.window_start = Some(now);
        }

        self.total_bytes_sent += bytes;
        if deadline_boosted {
            self.deadline_bytes_sent += bytes;
        }
    }

    /// Deadline share of bytes sent in the current window
    pub fn deadline_share(&self) -> Option<f64> {
        if self.total_bytes_sent == 0 {
            None
        } else {
            Some(self.deadline_bytes_sent as f64 / self.total_bytes_sent as f64)
        }
    }

    /// Return every boost to baseline
    pub fn reset_boost(&mut self) {
        self.deadline_cwnd_boost = 0;
        self.boost_end_time = None;
        self.deadline_pacing_gain = 1.0;
        self.effective_pacing_gain = 1.0;
        self.skip_probe_down = false;
        self.quick_probe_exit = false;
    }

    pub fn urgency_level(&self) -> UrgencyLevel {
        self.urgency_level
    }

    pub fn earliest_deadline(&self) -> Option<Timestamp> {
        self.earliest_deadline
    }

    pub fn deadline_pacing_gain(&self) -> f64 {
        self.deadline_pacing_gain
    }

    pub fn effective_pacing_gain(&self) -> f64 {
        self.effective_pacing_gain
    }

    pub fn deadline_cwnd_boost(&self) -> u64 {
        self.deadline_cwnd_boost
    }

    pub fn boost_end_time(&self) -> Option<Timestamp> {
        self.boost_end_time
    }

    pub fn skip_probe_down(&self) -> bool {
        self.skip_probe_down
    }

    pub fn quick_probe_exit(&self) -> bool {
        self.quick_probe_exit
    }

    pub fn last_update_time(&self) -> Option<Timestamp> {
        self.last_update_time
    }
}

impl Default for PathUrgencyState {
    fn default() -> Self {
        Self::new(CongestionConfig::default())
    }
}
