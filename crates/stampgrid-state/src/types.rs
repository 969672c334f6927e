//! Domain types for the worker table.
//!
//! A [`WorkerInfo`] is one worker's self-reported snapshot. Rows are
//! keyed by [`WorkerKey`] (site, stamp, worker) and serialized to JSON for
//! storage.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Load factor sentinel: the worker demands an immediate scale-out.
pub const LOAD_FACTOR_MAX: i32 = i32::MAX;

/// Load factor sentinel: the worker asks to be swapped out gracefully.
pub const LOAD_FACTOR_MIN: i32 = i32::MIN;

/// Identity of a worker row. Unique per table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerKey {
    pub site_name: String,
    pub stamp_name: String,
    pub worker_name: String,
}

impl WorkerKey {
    /// Composite table key `{site}/{stamp}:{worker}`.
    pub fn table_key(&self) -> String {
        format!("{}/{}:{}", self.site_name, self.stamp_name, self.worker_name)
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.site_name, self.stamp_name, self.worker_name)
    }
}

/// Snapshot of one worker's identity and load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerInfo {
    pub site_name: String,
    pub stamp_name: String,
    pub worker_name: String,
    /// Reported utilization, 0-100 outside the two sentinels.
    pub load_factor: i32,
    /// Set by the table on every successful write.
    pub last_modified_utc: DateTime<Utc>,
    /// Whether `stamp_name` is the site's home stamp.
    pub is_home_stamp: bool,
    /// Derived by the table on read; never persisted.
    #[serde(skip)]
    pub is_stale: bool,
    /// Handler-specific ping and diagnostic data.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl WorkerInfo {
    /// Create a worker snapshot. `is_home_stamp` is derived by comparing
    /// `stamp_name` with `home_stamp_name` (case-insensitive).
    pub fn new(site_name: &str, stamp_name: &str, worker_name: &str, home_stamp_name: &str) -> Self {
        Self {
            site_name: site_name.to_string(),
            stamp_name: stamp_name.to_string(),
            worker_name: worker_name.to_string(),
            load_factor: 0,
            last_modified_utc: Utc::now(),
            is_home_stamp: stamp_name.eq_ignore_ascii_case(home_stamp_name),
            is_stale: false,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_load_factor(mut self, load_factor: i32) -> Self {
        self.load_factor = load_factor;
        self
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn key(&self) -> WorkerKey {
        WorkerKey {
            site_name: self.site_name.clone(),
            stamp_name: self.stamp_name.clone(),
            worker_name: self.worker_name.clone(),
        }
    }

    /// Composite table key `{site}/{stamp}:{worker}`.
    pub fn table_key(&self) -> String {
        format!("{}/{}:{}", self.site_name, self.stamp_name, self.worker_name)
    }

    /// Identity comparison on (site, stamp, worker); load and timestamps
    /// are ignored.
    pub fn same_worker(&self, other: &WorkerInfo) -> bool {
        self.site_name == other.site_name
            && self.stamp_name == other.stamp_name
            && self.worker_name == other.worker_name
    }

    /// Human-readable `site/stamp:worker` for traces.
    pub fn display_name(&self) -> String {
        self.table_key()
    }

    /// Whether the row is older than `threshold` as of `now`.
    pub fn is_stale_at(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let age = now.signed_duration_since(self.last_modified_utc);
        match age.to_std() {
            Ok(age) => age > threshold,
            // Timestamps in the future are fresh.
            Err(_) => false,
        }
    }

    /// The worker reported the scale-out sentinel.
    pub fn demands_scale_out(&self) -> bool {
        self.load_factor == LOAD_FACTOR_MAX
    }

    /// The worker reported the retirement sentinel.
    pub fn requests_swap(&self) -> bool {
        self.load_factor == LOAD_FACTOR_MIN
    }
}

impl fmt::Display for WorkerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_stamp_is_derived_case_insensitively() {
        let home = WorkerInfo::new("site", "Stamp-Home", "w1", "stamp-home");
        let slave = WorkerInfo::new("site", "stamp-slave", "w1", "stamp-home");
        assert!(home.is_home_stamp);
        assert!(!slave.is_home_stamp);
    }

    #[test]
    fn same_worker_ignores_load_and_time() {
        let a = WorkerInfo::new("site", "home", "w1", "home").with_load_factor(10);
        let mut b = a.clone().with_load_factor(90);
        b.last_modified_utc = a.last_modified_utc - chrono::Duration::seconds(600);
        assert!(a.same_worker(&b));
        assert_ne!(a, b);

        let c = WorkerInfo::new("site", "slave", "w1", "home");
        assert!(!a.same_worker(&c));
    }

    #[test]
    fn staleness_is_measured_against_threshold() {
        let now = Utc::now();
        let mut worker = WorkerInfo::new("site", "home", "w1", "home");
        worker.last_modified_utc = now - chrono::Duration::seconds(120);

        assert!(worker.is_stale_at(now, Duration::from_secs(60)));
        assert!(!worker.is_stale_at(now, Duration::from_secs(300)));

        // Clock skew: a future timestamp never reads as stale.
        worker.last_modified_utc = now + chrono::Duration::seconds(30);
        assert!(!worker.is_stale_at(now, Duration::from_secs(0)));
    }

    #[test]
    fn sentinels_are_recognized() {
        let w = WorkerInfo::new("site", "home", "w1", "home");
        assert!(w.clone().with_load_factor(LOAD_FACTOR_MAX).demands_scale_out());
        assert!(w.clone().with_load_factor(LOAD_FACTOR_MIN).requests_swap());
        assert!(!w.with_load_factor(100).demands_scale_out());
    }

    #[test]
    fn stale_flag_is_not_persisted() {
        let mut worker = WorkerInfo::new("site", "home", "w1", "home").with_property("ip", "10.0.0.4");
        worker.is_stale = true;

        let json = serde_json::to_vec(&worker).unwrap();
        let back: WorkerInfo = serde_json::from_slice(&json).unwrap();

        assert!(!back.is_stale);
        assert_eq!(back.properties.get("ip").map(String::as_str), Some("10.0.0.4"));
        assert_eq!(back.key(), worker.key());
    }

    #[test]
    fn table_key_layout() {
        let w = WorkerInfo::new("site", "home", "10.0.0.1", "home");
        assert_eq!(w.table_key(), "site/home:10.0.0.1");
        assert_eq!(w.key().table_key(), w.table_key());
        assert_eq!(w.display_name(), "site/home:10.0.0.1");
    }
}
