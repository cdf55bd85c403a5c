//! Configuration for the deadline extension
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Scheduler-level fairness settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FairnessConfig {
    /// Minimum share of bytes reserved for non-deadline streams (0.0 to 1.0)
    #[serde(default = "default_min_non_deadline_share")]
    pub min_non_deadline_share: f64,
    /// Longest a ready non-deadline stream may wait, in milliseconds
    #[serde(default = "default_max_starvation_ms")]
    pub max_starvation_ms: u64,
    /// Byte share measurement window, in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

fn default_min_non_deadline_share() -> f64 {
    0.2
}

fn default_max_starvation_ms() -> u64 {
    50
}

fn default_window_ms() -> u64 {
    100
}

impl Default for FairnessConfig {
    fn default() -> Self {
        FairnessConfig {
            min_non_deadline_share: default_min_non_deadline_share(),
            max_starvation_ms: default_max_starvation_ms(),
            window_ms: default_window_ms(),
        }
    }
}

impl FairnessConfig {
    pub fn max_starvation(&self) -> Duration {
        Duration::from_millis(self.max_starvation_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Rate limits of the periodic scans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckConfig {
    /// Period of the hard deadline scan, in milliseconds
    #[serde(default = "default_check_interval_ms")]
    pub deadline_check_interval_ms: u64,
    /// Period of the urgency recomputation, in milliseconds
    #[serde(default = "default_check_interval_ms")]
    pub urgency_check_interval_ms: u64,
}

fn default_check_interval_ms() -> u64 {
    10
}

impl Default for CheckConfig {
    fn default() -> Self {
        CheckConfig {
            deadline_check_interval_ms: default_check_interval_ms(),
            urgency_check_interval_ms: default_check_interval_ms(),
        }
    }
}

impl CheckConfig {
    pub fn deadline_check_interval(&self) -> Duration {
        Duration::from_millis(self.deadline_check_interval_ms)
    }

    pub fn urgency_check_interval(&self) -> Duration {
        Duration::from_millis(self.urgency_check_interval_ms)
    }
}

/// Congestion extension settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CongestionConfig {
    /// Deadline byte share above which the pacing boost is scaled down
    #[serde(default = "default_max_deadline_share")]
    pub max_deadline_share: f64,
    /// Cap on the effective pacing gain, as a multiple of the base gain
    #[serde(default = "default_pacing_gain_ceiling")]
    pub pacing_gain_ceiling: f64,
    /// Lifetime of a congestion window boost, in milliseconds
    #[serde(default = "default_cwnd_boost_lifetime_ms")]
    pub cwnd_boost_lifetime_ms: u64,
    /// Byte share measurement window, in milliseconds
    #[serde(default = "default_window_ms")]
    pub fairness_window_ms: u64,
    /// Cap on a boosted window, as a multiple of the BDP
    #[serde(default = "default_cwnd_bdp_cap")]
    pub cwnd_bdp_cap: f64,
}

fn default_max_deadline_share() -> f64 {
    0.6
}

fn default_pacing_gain_ceiling() -> f64 {
    2.0
}

fn default_cwnd_boost_lifetime_ms() -> u64 {
    50
}

fn default_cwnd_bdp_cap() -> f64 {
    1.5
}

impl Default for CongestionConfig {
    fn default() -> Self {
        CongestionConfig {
            max_deadline_share: default_max_deadline_share(),
            pacing_gain_ceiling: default_pacing_gain_ceiling(),
            cwnd_boost_lifetime_ms: default_cwnd_boost_lifetime_ms(),
            fairness_window_ms: default_window_ms(),
            cwnd_bdp_cap: default_cwnd_bdp_cap(),
        }
    }
}

impl CongestionConfig {
    pub fn cwnd_boost_lifetime(&self) -> Duration {
        Duration::from_millis(self.cwnd_boost_lifetime_ms)
    }

    pub fn fairness_window(&self) -> Duration {
        Duration::from_millis(self.fairness_window_ms)
    }
}

/// Multipath selection settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipathConfig {
    /// Route deadline data across paths
    #[serde(default)]
    pub enabled: bool,
    /// Margin added to the one-way delay estimate, in microseconds
    #[serde(default = "default_processing_margin_us")]
    pub processing_margin_us: u64,
}

fn default_processing_margin_us() -> u64 {
    1000
}

impl Default for MultipathConfig {
    fn default() -> Self {
        MultipathConfig {
            enabled: false,
            processing_margin_us: default_processing_margin_us(),
        }
    }
}

impl MultipathConfig {
    pub fn processing_margin(&self) -> Duration {
        Duration::from_micros(self.processing_margin_us)
    }
}

/// Resource limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of streams a connection tracks
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,
}

fn default_max_streams() -> usize {
    1024
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_streams: default_max_streams(),
        }
    }
}

/// Complete deadline extension configuration
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DeadlineConfig {
    #[serde(default)]
    pub fairness: FairnessConfig,
    #[serde(default)]
    pub check: CheckConfig,
    #[serde(default)]
    pub congestion: CongestionConfig,
    #[serde(default)]
    pub multipath: MultipathConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl DeadlineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: DeadlineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        let share = self.fairness.min_non_deadline_share;
        if !(0.0..=1.0).contains(&share) {
            return Err(ConfigError::Invalid(format!(
                "fairness.min_non_deadline_share must be within [0, 1], got {share}"
            )));
        }
        if self.fairness.max_starvation_ms == 0 {
            return Err(ConfigError::Invalid(
                "fairness.max_starvation_ms must be positive".to_string(),
            ));
        }
        if self.fairness.window_ms == 0 || self.congestion.fairness_window_ms == 0 {
            return Err(ConfigError::Invalid(
                "fairness windows must be positive".to_string(),
            ));
        }

        let max_share = self.congestion.max_deadline_share;
        if !(max_share > 0.0 && max_share <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "congestion.max_deadline_share must be within (0, 1], got {max_share}"
            )));
        }
        if !(self.congestion.pacing_gain_ceiling >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "congestion.pacing_gain_ceiling must be at least 1.0, got {}",
                self.congestion.pacing_gain_ceiling
            )));
        }
        if !(self.congestion.cwnd_bdp_cap >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "congestion.cwnd_bdp_cap must be at least 1.0, got {}",
                self.congestion.cwnd_bdp_cap
            )));
        }
        if self.limits.max_streams == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_streams must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = DeadlineConfig::from_toml_str("").unwrap();
        assert_eq!(config, DeadlineConfig::default());
        assert_eq!(config.fairness.min_non_deadline_share, 0.2);
        assert_eq!(config.fairness.max_starvation(), Duration::from_millis(50));
        assert_eq!(config.congestion.max_deadline_share, 0.6);
        assert_eq!(config.multipath.processing_margin(), Duration::from_micros(1000));
        assert!(!config.multipath.enabled);
    }

    #[test]
    fn test_partial_sections() {
        let config = DeadlineConfig::from_toml_str(
            r#"
            [fairness]
            min_non_deadline_share = 0.3

            [multipath]
            enabled = true
            "#,
        )
        .unwrap();

        assert_eq!(config.fairness.min_non_deadline_share, 0.3);
        assert_eq!(config.fairness.max_starvation_ms, 50);
        assert!(config.multipath.enabled);
        assert_eq!(config.multipath.processing_margin_us, 1000);
    }

    #[test]
    fn test_rejects_out_of_range_share() {
        let err = DeadlineConfig::from_toml_str("[fairness]\nmin_non_deadline_share = 1.5\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_low_pacing_ceiling() {
        let mut config = DeadlineConfig::default();
        config.congestion.pacing_gain_ceiling = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serialize_deserialize() {
        let mut config = DeadlineConfig::default();
        config.limits.max_streams = 16;
        let toml = toml::to_string(&config).unwrap();
        let parsed: DeadlineConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed, config);
    }
}
