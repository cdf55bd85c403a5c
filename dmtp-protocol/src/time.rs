//! Time utilities for deadline tracking
//!
//! All deadlines are absolute monotonic timestamps in microseconds. Nothing in
//! this crate reads the clock on its own: callers pass `now` into every
//! decision, which keeps the logic identical under real and simulated clocks.

use std::fmt;
use std::ops::{Add, Sub};
use std::time::{Duration, Instant};

/// Absolute monotonic timestamp in microseconds
///
/// The epoch is chosen by the host (connection start, simulator zero, ...).
/// `Timestamp::INFINITE` stands for "no deadline".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The epoch
    pub const ZERO: Timestamp = Timestamp(0);

    /// Sentinel for "never"
    pub const INFINITE: Timestamp = Timestamp(u64::MAX);

    /// Create a timestamp from microseconds since the epoch
    #[inline]
    pub const fn from_micros(micros: u64) -> Self {
        Timestamp(micros)
    }

    /// Create a timestamp from milliseconds since the epoch
    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Timestamp(millis.saturating_mul(1000))
    }

    /// Microseconds since the epoch
    #[inline]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Check for the "never" sentinel
    #[inline]
    pub const fn is_infinite(self) -> bool {
        self.0 == u64::MAX
    }

    /// Compute the absolute deadline `now + duration`
    ///
    /// This is the only place an absolute deadline is derived from a relative
    /// duration. The result saturates just below `INFINITE` so a finite
    /// duration never turns into "no deadline".
    pub fn deadline_after(now: Timestamp, duration: Duration) -> Timestamp {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        Timestamp(now.0.saturating_add(micros).min(u64::MAX - 1))
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future
    #[inline]
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }

    /// Time remaining until `self` as seen from `now`, zero once passed
    #[inline]
    pub fn remaining_from(self, now: Timestamp) -> Duration {
        self.saturating_duration_since(now)
    }

    /// Check whether this deadline has been reached at `now`
    #[inline]
    pub fn has_passed(self, now: Timestamp) -> bool {
        !self.is_infinite() && now >= self
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, duration: Duration) -> Timestamp {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_add(micros))
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    fn sub(self, other: Timestamp) -> Duration {
        self.saturating_duration_since(other)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            write!(f, "inf")
        } else {
            write!(f, "{}us", self.0)
        }
    }
}

/// Monotonic clock anchored at an epoch
///
/// Hosts running on real time use this to produce the `now` values they pass
/// in. Simulators just construct `Timestamp`s directly.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    /// Start a clock whose epoch is the current instant
    pub fn new() -> Self {
        MonotonicClock {
            epoch: Instant::now(),
        }
    }

    /// Create a clock from an existing epoch
    pub fn with_epoch(epoch: Instant) -> Self {
        MonotonicClock { epoch }
    }

    /// Current timestamp
    pub fn now(&self) -> Timestamp {
        self.at(Instant::now())
    }

    /// Convert an instant to a timestamp on this clock
    pub fn at(&self, instant: Instant) -> Timestamp {
        let micros = instant.saturating_duration_since(self.epoch).as_micros();
        Timestamp(u64::try_from(micros).unwrap_or(u64::MAX - 1))
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic gate for rate-limited scans
///
/// Fires at most once per `period`. The first poll always fires.
#[derive(Debug, Clone)]
pub struct Interval {
    period: Duration,
    next_due: Option<Timestamp>,
}

impl Interval {
    /// Create a new interval
    pub fn new(period: Duration) -> Self {
        Interval {
            period,
            next_due: None,
        }
    }

    /// Period of this gate
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Check whether the gate is open at `now` without consuming it
    pub fn is_due(&self, now: Timestamp) -> bool {
        match self.next_due {
            None => true,
            Some(due) => now >= due,
        }
    }

    /// Fire the gate if due, returning true if it fired
    pub fn poll(&mut self, now: Timestamp) -> bool {
        if self.is_due(now) {
            self.next_due = Some(now + self.period);
            true
        } else {
            false
        }
    }

    /// Force the next poll to fire
    pub fn reset(&mut self) {
        self.next_due = None;
    }

    /// Time until the gate opens again
    pub fn time_until_due(&self, now: Timestamp) -> Duration {
        match self.next_due {
            None => Duration::ZERO,
            Some(due) => due.remaining_from(now),
        }
    }
}
