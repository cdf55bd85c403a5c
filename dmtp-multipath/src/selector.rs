//! Deadline-aware path selection
//!
//! Picks the path for new deadline data and for retransmissions of deadline
//! packets. Paths whose one-way delay estimate cannot beat the deadline are
//! filtered out; survivors are scored by smoothed RTT, doubled when the path's
//! window is full. Lower scores win.

use crate::path::{PathTable, PathTelemetry};
use dmtp_protocol::config::MultipathConfig;
use dmtp_protocol::packet::{PacketDeadlineInfo, PathId};
use dmtp_protocol::time::Timestamp;
use std::time::Duration;
use thiserror::Error;

/// Path selection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("No usable path available")]
    NoUsablePath,
}

/// Multipath deadline selector
#[derive(Debug, Clone)]
pub struct PathSelector {
    enabled: bool,
    processing_margin: Duration,
    default_path: PathId,
}

impl PathSelector {
    /// Create a selector from configuration
    pub fn new(config: &MultipathConfig) -> Self {
        PathSelector {
            enabled: config.enabled,
            processing_margin: config.processing_margin(),
            default_path: PathId::DEFAULT,
        }
    }

    /// Enable or disable multipath routing of deadline data
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Path used when no deadline routing applies
    pub fn default_path(&self) -> PathId {
        self.default_path
    }

    pub fn set_default_path(&mut self, path: PathId) {
        self.default_path = path;
    }

    /// Estimated one-way delivery time on a path
    pub fn one_way_delay(&self, path: &PathTelemetry) -> Duration {
        path.smoothed_rtt / 2 + self.processing_margin
    }

    /// Check if data sent now on `path` can arrive before `deadline`
    pub fn can_meet_deadline(&self, path: &PathTelemetry, deadline: Timestamp, now: Timestamp) -> bool {
        if deadline.is_infinite() {
            return true;
        }
        self.one_way_delay(path) < deadline.remaining_from(now)
    }

    /// Score of a path in microseconds, lower is better
    pub fn score(path: &PathTelemetry) -> u64 {
        let rtt = u64::try_from(path.smoothed_rtt.as_micros()).unwrap_or(u64::MAX);
        if path.is_congested() {
            rtt.saturating_mul(2)
        } else {
            rtt
        }
    }

    /// Select the path for new data of a stream
    ///
    /// `deadline` is the stream's effective deadline, `None` when the stream
    /// has no active deadline.
    pub fn select_path_for_send(
        &self,
        paths: &PathTable,
        deadline: Option<Timestamp>,
        now: Timestamp,
    ) -> Result<PathId, SelectionError> {
        let deadline = match deadline {
            Some(deadline) if self.enabled && !deadline.is_infinite() => deadline,
            _ => return Ok(self.default_path),
        };

        let best = paths
            .iter()
            .filter(|p| p.is_usable() && p.rtt_initialized)
            .filter(|p| self.can_meet_deadline(p, deadline, now))
            .min_by_key(|p| (Self::score(p), p.id));

        match best {
            Some(path) => Ok(path.id),
            None => {
                let fallback = self.fallback(paths)?;
                tracing::debug!(
                    path = %fallback,
                    remaining_us = deadline.remaining_from(now).as_micros() as u64,
                    "no path can meet deadline, using lowest RTT"
                );
                Ok(fallback)
            }
        }
    }

    /// Select the path for retransmitting a lost packet
    pub fn select_path_for_retransmit(
        &self,
        paths: &PathTable,
        info: &PacketDeadlineInfo,
        now: Timestamp,
    ) -> Result<PathId, SelectionError> {
        if !self.enabled || !info.contains_deadline_data {
            if paths.is_usable(info.send_path) || paths.is_empty() {
                return Ok(info.send_path);
            }
            // Original path is gone or demoted
            return Ok(self.fallback(paths).unwrap_or(info.send_path));
        }

        let path = self.select_path_for_send(paths, Some(info.earliest_deadline), now)?;
        if path != info.send_path {
            tracing::debug!(from = %info.send_path, to = %path, "retransmission rerouted");
        }
        Ok(path)
    }

    /// Lowest-RTT usable path
    ///
    /// Paths without an RTT sample are used only when no usable path has
    /// one, lowest id first.
    pub fn fallback(&self, paths: &PathTable) -> Result<PathId, SelectionError> {
        let usable = || paths.iter().filter(|p| p.is_usable());
        usable()
            .filter(|p| p.rtt_initialized)
            .min_by_key(|p| (p.smoothed_rtt, p.id))
            .or_else(|| usable().min_by_key(|p| p.id))
            .map(|p| p.id)
            .ok_or(SelectionError::NoUsablePath)
    }
}

impl Default for PathSelector {
    fn default() -> Self {
        Self::new(&MultipathConfig::default())
    }
}
