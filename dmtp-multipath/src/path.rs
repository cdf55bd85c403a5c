//! Path telemetry table
//!
//! The host validates paths and reports their RTT and window. The table keeps
//! the latest report per path and tracks locally sent bytes in between, so
//! selection sees load the host has not reported yet.

use dmtp_protocol::packet::PathId;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Path table errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("Path not found: {0}")]
    NotFound(PathId),

    #[error("Path table is full (max {max} paths)")]
    TableFull { max: usize },
}

/// Path status as reported by path validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathStatus {
    /// Validated and usable
    #[default]
    Active,
    /// Still known but should not carry new data
    Demoted,
}

/// Latest telemetry for one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTelemetry {
    /// Path identifier
    pub id: PathId,
    /// Smoothed round-trip time
    pub smoothed_rtt: Duration,
    /// At least one RTT sample has been taken
    pub rtt_initialized: bool,
    /// Congestion window in bytes
    pub congestion_window: u64,
    /// Bytes sent and not yet acknowledged or lost
    pub bytes_in_transit: u64,
    /// Current status
    pub status: PathStatus,
}

impl PathTelemetry {
    /// Telemetry for a fresh path with no RTT sample
    pub fn new(id: PathId) -> Self {
        PathTelemetry {
            id,
            smoothed_rtt: Duration::ZERO,
            rtt_initialized: false,
            congestion_window: 0,
            bytes_in_transit: 0,
            status: PathStatus::Active,
        }
    }

    /// Telemetry for an active path with a measured RTT
    pub fn measured(id: PathId, smoothed_rtt: Duration, congestion_window: u64) -> Self {
        PathTelemetry {
            id,
            smoothed_rtt,
            rtt_initialized: true,
            congestion_window,
            bytes_in_transit: 0,
            status: PathStatus::Active,
        }
    }

    /// Set bytes in transit
    pub fn with_bytes_in_transit(mut self, bytes: u64) -> Self {
        self.bytes_in_transit = bytes;
        self
    }

    /// Mark demoted
    pub fn demoted(mut self) -> Self {
        self.status = PathStatus::Demoted;
        self
    }

    /// Check if the path may carry new data
    pub fn is_usable(&self) -> bool {
        self.status == PathStatus::Active
    }

    /// Check if the congestion window is full
    pub fn is_congested(&self) -> bool {
        self.bytes_in_transit >= self.congestion_window
    }
}

/// Per-path send counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_lost: u64,
    pub bytes_lost: u64,
}

#[derive(Debug, Clone)]
struct PathEntry {
    telemetry: PathTelemetry,
    stats: PathStats,
}

/// All known paths of a connection, ordered by id
#[derive(Debug, Clone)]
pub struct PathTable {
    paths: BTreeMap<PathId, PathEntry>,
    max_paths: usize,
}

impl PathTable {
    /// Create a table holding at most `max_paths` paths
    pub fn new(max_paths: usize) -> Self {
        PathTable {
            paths: BTreeMap::new(),
            max_paths,
        }
    }

    /// Create a default-sized table holding `initial`
    pub fn with_path(initial: PathTelemetry) -> Self {
        let mut table = Self::default();
        table.paths.insert(
            initial.id,
            PathEntry {
                telemetry: initial,
                stats: PathStats::default(),
            },
        );
        table
    }

    /// Insert or replace a path's telemetry
    pub fn update(&mut self, telemetry: PathTelemetry) -> Result<(), PathError> {
        if let Some(entry) = self.paths.get_mut(&telemetry.id) {
            entry.telemetry = telemetry;
            return Ok(());
        }

        if self.paths.len() >= self.max_paths {
            return Err(PathError::TableFull {
                max: self.max_paths,
            });
        }

        tracing::debug!(path = %telemetry.id, rtt_us = telemetry.smoothed_rtt.as_micros() as u64, "path added");
        self.paths.insert(
            telemetry.id,
            PathEntry {
                telemetry,
                stats: PathStats::default(),
            },
        );
        Ok(())
    }

    /// Remove a path
    pub fn remove(&mut self, id: PathId) -> Result<PathTelemetry, PathError> {
        self.paths
            .remove(&id)
            .map(|entry| entry.telemetry)
            .ok_or(PathError::NotFound(id))
    }

    /// Get a path's telemetry
    pub fn get(&self, id: PathId) -> Option<&PathTelemetry> {
        self.paths.get(&id).map(|entry| &entry.telemetry)
    }

    /// Get a path's counters
    pub fn stats(&self, id: PathId) -> Option<&PathStats> {
        self.paths.get(&id).map(|entry| &entry.stats)
    }

    /// Check if a path exists and is usable
    pub fn is_usable(&self, id: PathId) -> bool {
        self.get(id).map_or(false, PathTelemetry::is_usable)
    }

    /// Iterate telemetry in path id order
    pub fn iter(&self) -> impl Iterator<Item = &PathTelemetry> + '_ {
        self.paths.values().map(|entry| &entry.telemetry)
    }

    /// Number of paths
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Account a packet sent on a path
    pub fn record_sent(&mut self, id: PathId, bytes: u64) {
        if let Some(entry) = self.paths.get_mut(&id) {
            entry.telemetry.bytes_in_transit += bytes;
            entry.stats.packets_sent += 1;
            entry.stats.bytes_sent += bytes;
        }
    }

    /// Account an acknowledged packet
    pub fn record_acked(&mut self, id: PathId, bytes: u64) {
        if let Some(entry) = self.paths.get_mut(&id) {
            entry.telemetry.bytes_in_transit = entry.telemetry.bytes_in_transit.saturating_sub(bytes);
        }
    }

    /// Account a lost packet
    pub fn record_lost(&mut self, id: PathId, bytes: u64) {
        if let Some(entry) = self.paths.get_mut(&id) {
            entry.telemetry.bytes_in_transit = entry.telemetry.bytes_in_transit.saturating_sub(bytes);
            entry.stats.packets_lost += 1;
            entry.stats.bytes_lost += bytes;
        }
    }
}

impl Default for PathTable {
    fn default() -> Self {
        Self::new(16)
    }
}
