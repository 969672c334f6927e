//! stampd.toml configuration.
//!
//! ```toml
//! [site]
//! name = "contoso"
//! home_stamp = "stamp-home"
//! slave_stamps = ["stamp-a", "stamp-b"]
//! stamp_capacity = 4
//!
//! [scale]
//! max_workers = 6
//! worker_update_interval = "2s"
//! worker_ping_interval = "4s"
//!
//! [simulation]
//! home_workers = 1
//! slave_workers = 1
//! demand = 250
//! duration = "60s"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use stampgrid_scale::{ScaleConfig, ScaleSettings, parse_duration};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StampdConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub scale: ScaleConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteConfig {
    pub name: Option<String>,
    pub home_stamp: Option<String>,
    pub slave_stamps: Option<Vec<String>>,
    /// Workers each stamp can host.
    pub stamp_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub home_workers: Option<usize>,
    pub slave_workers: Option<usize>,
    /// Total load spread across the live workers.
    pub demand: Option<u32>,
    pub duration: Option<String>,
    pub data_dir: Option<PathBuf>,
}

impl StampdConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: StampdConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub site: Option<String>,
    pub home_workers: Option<usize>,
    pub slave_workers: Option<usize>,
    pub demand: Option<u32>,
    pub duration: Option<String>,
    pub data_dir: Option<PathBuf>,
}

/// Fully resolved simulation parameters.
#[derive(Debug, Clone)]
pub struct SimulationPlan {
    pub site: String,
    pub home_stamp: String,
    pub slave_stamps: Vec<String>,
    pub stamp_capacity: usize,
    pub home_workers: usize,
    pub slave_workers: usize,
    pub demand: u32,
    pub duration: Duration,
    pub data_dir: Option<PathBuf>,
    pub settings: ScaleSettings,
}

impl SimulationPlan {
    pub fn resolve(config: &StampdConfig, overrides: Overrides) -> anyhow::Result<Self> {
        let settings = ScaleSettings::from_config(&config.scale)?;

        let raw_duration = overrides
            .duration
            .or_else(|| config.simulation.duration.clone())
            .unwrap_or_else(|| "60s".to_string());
        let duration = parse_duration(&raw_duration)
            .with_context(|| format!("invalid simulation duration {raw_duration:?}"))?;

        let slave_stamps = config
            .site
            .slave_stamps
            .clone()
            .unwrap_or_else(|| vec!["stamp-slave".to_string()]);
        let slave_workers = overrides
            .slave_workers
            .or(config.simulation.slave_workers)
            .unwrap_or(0);
        if slave_workers > 0 && slave_stamps.is_empty() {
            anyhow::bail!("slave workers requested but no slave stamps are configured");
        }

        let stamp_capacity = config.site.stamp_capacity.unwrap_or(4);
        if stamp_capacity == 0 {
            anyhow::bail!("stamp_capacity must be at least 1");
        }

        Ok(Self {
            site: overrides
                .site
                .or_else(|| config.site.name.clone())
                .unwrap_or_else(|| "site".to_string()),
            home_stamp: config
                .site
                .home_stamp
                .clone()
                .unwrap_or_else(|| "stamp-home".to_string()),
            slave_stamps,
            stamp_capacity,
            home_workers: overrides
                .home_workers
                .or(config.simulation.home_workers)
                .unwrap_or(1),
            slave_workers,
            demand: overrides.demand.or(config.simulation.demand).unwrap_or(100),
            duration,
            data_dir: overrides.data_dir.or_else(|| config.simulation.data_dir.clone()),
            settings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_resolves_to_defaults() {
        let plan = SimulationPlan::resolve(&StampdConfig::default(), Overrides::default()).unwrap();

        assert_eq!(plan.site, "site");
        assert_eq!(plan.home_stamp, "stamp-home");
        assert_eq!(plan.home_workers, 1);
        assert_eq!(plan.slave_workers, 0);
        assert_eq!(plan.duration, Duration::from_secs(60));
        assert_eq!(plan.settings, ScaleSettings::default());
    }

    #[test]
    fn file_values_and_overrides() {
        let config: StampdConfig = toml::from_str(
            r#"
[site]
name = "contoso"
home_stamp = "home"
slave_stamps = ["a", "b"]
stamp_capacity = 2

[scale]
max_workers = 3
worker_update_interval = "2s"

[simulation]
home_workers = 2
demand = 300
duration = "5m"
"#,
        )
        .unwrap();

        let plan = SimulationPlan::resolve(
            &config,
            Overrides {
                demand: Some(50),
                slave_workers: Some(1),
                ..Overrides::default()
            },
        )
        .unwrap();

        assert_eq!(plan.site, "contoso");
        assert_eq!(plan.slave_stamps, ["a", "b"]);
        assert_eq!(plan.stamp_capacity, 2);
        assert_eq!(plan.home_workers, 2);
        assert_eq!(plan.slave_workers, 1);
        assert_eq!(plan.demand, 50);
        assert_eq!(plan.duration, Duration::from_secs(300));
        assert_eq!(plan.settings.max_workers, 3);
        assert_eq!(plan.settings.worker_update_interval, Duration::from_secs(2));
    }

    #[test]
    fn invalid_scale_section_is_rejected() {
        let config: StampdConfig = toml::from_str("[scale]\nmax_busy_worker_ratio = 2.0\n").unwrap();
        assert!(SimulationPlan::resolve(&config, Overrides::default()).is_err());
    }

    #[test]
    fn slave_workers_need_slave_stamps() {
        let config: StampdConfig = toml::from_str("[site]\nslave_stamps = []\n").unwrap();
        let result = SimulationPlan::resolve(
            &config,
            Overrides {
                slave_workers: Some(2),
                ..Overrides::default()
            },
        );
        assert!(result.is_err());
    }
}
