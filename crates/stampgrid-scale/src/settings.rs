//! Scale manager tunables.
//!
//! [`ScaleSettings`] is built once at startup and handed to each
//! [`ScaleManager`](crate::ScaleManager). [`ScaleConfig`] is its TOML
//! mirror: every field optional, durations as strings like `"30s"`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ScaleError, ScaleResult};

/// Thresholds, intervals, and capacity bounds for the scale manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleSettings {
    /// Upper bound on workers per site (≥ 1).
    pub max_workers: usize,
    /// Load factor at or above which a worker counts as busy.
    pub busy_worker_load_factor: i32,
    /// Busy fraction above which the manager adds a worker.
    pub max_busy_worker_ratio: f64,
    /// Load factor at or below which a worker counts as free.
    pub free_worker_load_factor: i32,
    /// Free fraction above which the manager removes a worker.
    pub max_free_worker_ratio: f64,
    /// Period of the reconciliation tick.
    pub worker_update_interval: Duration,
    /// Minimum gap between two self-pings (and row refreshes).
    pub worker_ping_interval: Duration,
    /// Minimum gap between two leadership evaluations.
    pub manager_check_interval: Duration,
    /// Minimum gap between two scale decisions.
    pub scale_check_interval: Duration,
    /// Minimum gap between two stale worker sweeps.
    pub stale_worker_check_interval: Duration,
    /// Row age after which a worker reads as stale.
    pub stale_worker_threshold: Duration,
    /// Quiet period that coalesces bursts of nudges into one tick.
    pub nudge_debounce: Duration,
}

impl Default for ScaleSettings {
    fn default() -> Self {
        Self {
            max_workers: 10,
            busy_worker_load_factor: 80,
            max_busy_worker_ratio: 0.8,
            free_worker_load_factor: 20,
            max_free_worker_ratio: 0.5,
            worker_update_interval: Duration::from_secs(10),
            worker_ping_interval: Duration::from_secs(60),
            manager_check_interval: Duration::ZERO,
            scale_check_interval: Duration::ZERO,
            stale_worker_check_interval: Duration::from_secs(120),
            stale_worker_threshold: Duration::from_secs(300),
            nudge_debounce: Duration::from_secs(1),
        }
    }
}

impl ScaleSettings {
    /// Build settings from a parsed config, filling defaults for absent
    /// fields, then validate.
    pub fn from_config(config: &ScaleConfig) -> ScaleResult<Self> {
        let defaults = Self::default();
        let settings = Self {
            max_workers: config.max_workers.unwrap_or(defaults.max_workers),
            busy_worker_load_factor: config
                .busy_worker_load_factor
                .unwrap_or(defaults.busy_worker_load_factor),
            max_busy_worker_ratio: config
                .max_busy_worker_ratio
                .unwrap_or(defaults.max_busy_worker_ratio),
            free_worker_load_factor: config
                .free_worker_load_factor
                .unwrap_or(defaults.free_worker_load_factor),
            max_free_worker_ratio: config
                .max_free_worker_ratio
                .unwrap_or(defaults.max_free_worker_ratio),
            worker_update_interval: duration_field(
                "worker_update_interval",
                &config.worker_update_interval,
                defaults.worker_update_interval,
            )?,
            worker_ping_interval: duration_field(
                "worker_ping_interval",
                &config.worker_ping_interval,
                defaults.worker_ping_interval,
            )?,
            manager_check_interval: duration_field(
                "manager_check_interval",
                &config.manager_check_interval,
                defaults.manager_check_interval,
            )?,
            scale_check_interval: duration_field(
                "scale_check_interval",
                &config.scale_check_interval,
                defaults.scale_check_interval,
            )?,
            stale_worker_check_interval: duration_field(
                "stale_worker_check_interval",
                &config.stale_worker_check_interval,
                defaults.stale_worker_check_interval,
            )?,
            stale_worker_threshold: duration_field(
                "stale_worker_threshold",
                &config.stale_worker_threshold,
                defaults.stale_worker_threshold,
            )?,
            nudge_debounce: duration_field(
                "nudge_debounce",
                &config.nudge_debounce,
                defaults.nudge_debounce,
            )?,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Check bounds and the relation between ping interval and staleness.
    pub fn validate(&self) -> ScaleResult<()> {
        if self.max_workers < 1 {
            return Err(ScaleError::Config("max_workers must be at least 1".to_string()));
        }
        for (name, ratio) in [
            ("max_busy_worker_ratio", self.max_busy_worker_ratio),
            ("max_free_worker_ratio", self.max_free_worker_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(ScaleError::Config(format!("{name} must be within 0..=1, got {ratio}")));
            }
        }
        for (name, load) in [
            ("busy_worker_load_factor", self.busy_worker_load_factor),
            ("free_worker_load_factor", self.free_worker_load_factor),
        ] {
            if !(0..=100).contains(&load) {
                return Err(ScaleError::Config(format!("{name} must be within 0..=100, got {load}")));
            }
        }
        if self.worker_update_interval.is_zero() {
            return Err(ScaleError::Config("worker_update_interval must be non-zero".to_string()));
        }
        // A live row is refreshed on the first tick after the ping window
        // closes, so it can age by up to ping + update interval.
        let max_live_age = self.worker_ping_interval + self.worker_update_interval;
        if self.stale_worker_threshold <= max_live_age {
            return Err(ScaleError::Config(format!(
                "stale_worker_threshold ({:?}) must exceed worker_ping_interval + worker_update_interval ({:?})",
                self.stale_worker_threshold, max_live_age
            )));
        }
        Ok(())
    }
}

/// TOML form of [`ScaleSettings`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScaleConfig {
    pub max_workers: Option<usize>,
    pub busy_worker_load_factor: Option<i32>,
    pub max_busy_worker_ratio: Option<f64>,
    pub free_worker_load_factor: Option<i32>,
    pub max_free_worker_ratio: Option<f64>,
    pub worker_update_interval: Option<String>,
    pub worker_ping_interval: Option<String>,
    pub manager_check_interval: Option<String>,
    pub scale_check_interval: Option<String>,
    pub stale_worker_check_interval: Option<String>,
    pub stale_worker_threshold: Option<String>,
    pub nudge_debounce: Option<String>,
}

impl ScaleConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ScaleConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

fn duration_field(name: &str, value: &Option<String>, default: Duration) -> ScaleResult<Duration> {
    match value {
        None => Ok(default),
        Some(raw) => parse_duration(raw)
            .ok_or_else(|| ScaleError::Config(format!("{name}: invalid duration {raw:?}"))),
    }
}

/// Parse a duration string like "500ms", "30s", "5m", "1h".
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.trim().parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ScaleSettings::default().validate().unwrap();
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration(" 45 "), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn config_overrides_defaults() {
        let config: ScaleConfig = toml::from_str(
            r#"
max_workers = 4
busy_worker_load_factor = 90
worker_ping_interval = "30s"
stale_worker_threshold = "2m"
"#,
        )
        .unwrap();

        let settings = ScaleSettings::from_config(&config).unwrap();
        assert_eq!(settings.max_workers, 4);
        assert_eq!(settings.busy_worker_load_factor, 90);
        assert_eq!(settings.worker_ping_interval, Duration::from_secs(30));
        assert_eq!(settings.stale_worker_threshold, Duration::from_secs(120));
        assert_eq!(settings.free_worker_load_factor, 20);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let zero_workers = ScaleConfig {
            max_workers: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            ScaleSettings::from_config(&zero_workers),
            Err(ScaleError::Config(_))
        ));

        let bad_ratio = ScaleConfig {
            max_busy_worker_ratio: Some(1.5),
            ..Default::default()
        };
        assert!(ScaleSettings::from_config(&bad_ratio).is_err());

        let bad_duration = ScaleConfig {
            worker_ping_interval: Some("fast".to_string()),
            ..Default::default()
        };
        assert!(ScaleSettings::from_config(&bad_duration).is_err());

        let stale_before_ping = ScaleConfig {
            worker_ping_interval: Some("5m".to_string()),
            stale_worker_threshold: Some("1m".to_string()),
            ..Default::default()
        };
        assert!(ScaleSettings::from_config(&stale_before_ping).is_err());
    }

    #[test]
    fn stale_threshold_must_cover_a_late_refresh() {
        let within_refresh_lag = ScaleConfig {
            worker_update_interval: Some("10s".to_string()),
            worker_ping_interval: Some("60s".to_string()),
            stale_worker_threshold: Some("65s".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            ScaleSettings::from_config(&within_refresh_lag),
            Err(ScaleError::Config(_))
        ));

        let clear_of_refresh_lag = ScaleConfig {
            stale_worker_threshold: Some("71s".to_string()),
            ..within_refresh_lag
        };
        assert!(ScaleSettings::from_config(&clear_of_refresh_lag).is_ok());
    }
}
