//! # Stage: Configuration
//!
//! ## Responsibility
//! Load the service configuration from TOML, fill every omitted field with
//! its default, and reject values the detectors cannot work with.
//!
//! ## Lookup order
//! 1. `--config <path>` on the command line
//! 2. `wifi-heatmap.toml` in the working directory, if it exists
//! 3. built-in defaults
//!
//! Command-line flags such as `--db` and `--port` are applied on top by the
//! binary after loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};

use crate::error::{HeatmapError, Result};

/// File name looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "wifi-heatmap.toml";

/// Longest configurable window or retention period (ten years).
pub const MAX_WINDOW_DAYS: i64 = 3650;

/// Largest `hours` lookback accepted from the CLI or HTTP callers (30 days).
pub const MAX_QUERY_HOURS: i64 = 24 * 30;

/// Longest scheduler interval (one week).
pub const MAX_CHECK_INTERVAL_SECS: u64 = 7 * 24 * 3600;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Locations of the two SQLite databases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Observation database written by the collector.
    pub observations_path: PathBuf,
    /// Alert ledger database.
    pub alerts_path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            observations_path: PathBuf::from("data/wifi_data.db"),
            alerts_path: PathBuf::from("data/alerts.db"),
        }
    }
}

/// Detector thresholds, windows and retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Mean drop in dB between the previous and the current bucket that
    /// raises a degradation alert.
    pub degradation_threshold: f64,
    /// Width of each degradation bucket.
    pub degradation_window_minutes: i64,
    /// dBm level below which a reading counts as weak.
    pub weak_signal_threshold: f64,
    /// Trailing window inspected by the weak-signal detector.
    pub weak_signal_window_minutes: i64,
    /// Minutes without a sighting before a known network counts as gone.
    pub disappearance_minutes: i64,
    /// How far back a network must have been seen to count as known.
    pub disappearance_lookback_hours: i64,
    pub alert_retention_days: i64,
    pub dedup_window_hours: i64,
    pub cache_ttl_seconds: u64,
    /// Window used for statistics, heatmaps and channel recommendations.
    pub stats_window_hours: i64,
    /// Maximum rows returned by the `latest` endpoint.
    pub latest_limit: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            degradation_threshold: 10.0,
            degradation_window_minutes: 60,
            weak_signal_threshold: -80.0,
            weak_signal_window_minutes: 60,
            disappearance_minutes: 30,
            disappearance_lookback_hours: 24,
            alert_retention_days: 7,
            dedup_window_hours: 1,
            cache_ttl_seconds: 60,
            stats_window_hours: 168,
            latest_limit: 50,
        }
    }
}

impl AnalysisConfig {
    pub fn degradation_window(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.degradation_window_minutes)
    }

    pub fn weak_signal_window(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.weak_signal_window_minutes)
    }

    pub fn disappearance_after(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.disappearance_minutes)
    }

    pub fn disappearance_lookback(&self) -> ChronoDuration {
        ChronoDuration::hours(self.disappearance_lookback_hours)
    }

    pub fn retention(&self) -> ChronoDuration {
        ChronoDuration::days(self.alert_retention_days)
    }

    pub fn dedup_window(&self) -> ChronoDuration {
        ChronoDuration::hours(self.dedup_window_hours)
    }

    pub fn stats_window(&self) -> ChronoDuration {
        ChronoDuration::hours(self.stats_window_hours)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

/// HTTP listener and scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Seconds between scheduled check cycles. Zero disables the scheduler.
    pub check_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "0.0.0.0".to_string(),
            port: 5000,
            check_interval_secs: 300,
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Complete service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub analysis: AnalysisConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Resolve the configuration using the documented lookup order.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.exists() {
                    Self::from_file(fallback)
                } else {
                    Ok(Config::default())
                }
            }
        }
    }

    /// Reject values the detectors cannot operate with.
    pub fn validate(&self) -> Result<()> {
        let a = &self.analysis;
        let max_hours = MAX_WINDOW_DAYS * 24;
        let max_minutes = max_hours * 60;
        // Checked before any duration is built: chrono panics on out-of-range
        // values and timestamp arithmetic must stay representable.
        let windows = [
            ("degradation_window_minutes", a.degradation_window_minutes, max_minutes),
            ("weak_signal_window_minutes", a.weak_signal_window_minutes, max_minutes),
            ("disappearance_minutes", a.disappearance_minutes, max_minutes),
            ("disappearance_lookback_hours", a.disappearance_lookback_hours, max_hours),
            ("alert_retention_days", a.alert_retention_days, MAX_WINDOW_DAYS),
            ("dedup_window_hours", a.dedup_window_hours, max_hours),
            ("stats_window_hours", a.stats_window_hours, max_hours),
        ];
        for (name, value, max) in windows {
            if value <= 0 {
                return Err(HeatmapError::Config(format!("{name} must be positive, got {value}")));
            }
            if value > max {
                return Err(HeatmapError::Config(format!("{name} must be at most {max}, got {value}")));
            }
        }
        if self.server.check_interval_secs > MAX_CHECK_INTERVAL_SECS {
            return Err(HeatmapError::Config(format!(
                "check_interval_secs must be at most {MAX_CHECK_INTERVAL_SECS}, got {}",
                self.server.check_interval_secs
            )));
        }
        if !(a.degradation_threshold.is_finite() && a.degradation_threshold > 0.0) {
            return Err(HeatmapError::Config(format!(
                "degradation_threshold must be a positive dB value, got {}",
                a.degradation_threshold
            )));
        }
        if !(a.weak_signal_threshold.is_finite() && a.weak_signal_threshold < 0.0) {
            return Err(HeatmapError::Config(format!(
                "weak_signal_threshold is in dBm and must be negative, got {}",
                a.weak_signal_threshold
            )));
        }
        if a.cache_ttl_seconds == 0 {
            return Err(HeatmapError::Config("cache_ttl_seconds must be positive".into()));
        }
        if a.disappearance_lookback() <= a.disappearance_after() {
            return Err(HeatmapError::Config(
                "disappearance_lookback_hours must exceed disappearance_minutes".into(),
            ));
        }
        Ok(())
    }
}
