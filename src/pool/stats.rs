//! Dynamic pool sizing from recent reservation demand.
//!
//! Each registration keeps an exponentially weighted average of reservations
//! per sample. The derived level replaces `minTenantPoolSize` as the pool
//! target. Growth applies at once; shrinking waits a few samples and then
//! steps down gradually.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::info;

use super::config::PoolStatsConfig;

/// Demand state of one registration.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStats {
    level: u32,
    average: f64,
    downsize_counter: u32,
    sampling_counter: u32,
    last_request_at: DateTime<Utc>,
}

impl PoolStats {
    fn new(config: &PoolStatsConfig, available: u32, now: DateTime<Utc>) -> Self {
        Self {
            level: available,
            average: available as f64 / config.time_factor,
            downsize_counter: 0,
            sampling_counter: 0,
            last_request_at: now,
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    #[cfg(test)]
    pub fn average(&self) -> f64 {
        self.average
    }

    /// Fold one sample of `requests` reservations into the average and level.
    fn apply(&mut self, config: &PoolStatsConfig, requests: u64, min: u32, max: u32) {
        let samples = self.sampling_counter.max(1) as f64;
        let average = config.weight * requests as f64 + (1.0 - config.weight) * self.average;
        let proposed = ((config.time_factor * average) / samples).floor().max(0.0) as u32;
        let proposed = proposed.clamp(min, max.max(min));

        if proposed < self.level {
            if self.downsize_counter >= config.downsize_delay {
                self.level -= config.downsize_limit.min(self.level - proposed);
                self.downsize_counter = 0;
            } else {
                self.downsize_counter += 1;
            }
        } else {
            self.level = proposed;
            self.downsize_counter = 0;
        }
        self.average = average;
    }
}

/// Pool stats for every registration this process scans.
#[derive(Debug)]
pub struct PoolStatsTracker {
    config: PoolStatsConfig,
    entries: Mutex<HashMap<String, PoolStats>>,
}

impl PoolStatsTracker {
    pub fn new(config: PoolStatsConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, PoolStats>) -> T) -> T {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut entries)
    }

    /// Count one scan. Returns the start of the demand window when a sample
    /// is due, or `None` while the registration is still between samples.
    ///
    /// The first scan of a registration seeds its level from the current
    /// `available` count and never samples.
    pub fn begin_scan(
        &self,
        registration_id: &str,
        available: u32,
        min: u32,
        max: u32,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let config = &self.config;
        self.with_entries(|entries| {
            match entries.get_mut(registration_id) {
                Some(stats) => {
                    stats.sampling_counter += 1;
                    if stats.sampling_counter < config.sampling_interval {
                        None
                    } else {
                        Some(stats.last_request_at)
                    }
                }
                None => {
                    let mut stats = PoolStats::new(config, available, now);
                    stats.level = stats.level.clamp(min, max.max(min));
                    entries.insert(registration_id.to_string(), stats);
                    None
                }
            }
        })
    }

    /// Apply a sample of `requests` reservations seen since the window
    /// start and return the new level.
    pub fn record_sample(
        &self,
        registration_id: &str,
        requests: u64,
        last_request_at: Option<DateTime<Utc>>,
        min: u32,
        max: u32,
    ) -> Option<u32> {
        let config = &self.config;
        self.with_entries(|entries| {
            let stats = entries.get_mut(registration_id)?;
            stats.apply(config, requests, min, max);
            stats.sampling_counter = 0;
            if let Some(last) = last_request_at {
                stats.last_request_at = last;
            }
            info!(
                registration = %registration_id,
                requests,
                average = stats.average,
                level = stats.level,
                "pool stats sampled"
            );
            Some(stats.level)
        })
    }

    pub fn level(&self, registration_id: &str) -> Option<u32> {
        self.with_entries(|entries| entries.get(registration_id).map(PoolStats::level))
    }

    #[cfg(test)]
    pub fn get(&self, registration_id: &str) -> Option<PoolStats> {
        self.with_entries(|entries| entries.get(registration_id).cloned())
    }

    pub fn forget(&self, registration_id: &str) {
        self.with_entries(|entries| {
            entries.remove(registration_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::testing::ManualClock;

    fn tracker() -> PoolStatsTracker {
        PoolStatsTracker::new(PoolStatsConfig {
            enabled: true,
            ..PoolStatsConfig::default()
        })
    }

    #[test]
    fn test_first_scan_seeds_without_sampling() {
        let clock = ManualClock::new();
        let stats = tracker();

        assert_eq!(stats.begin_scan("reg", 4, 1, 10, clock.now()), None);
        assert_eq!(stats.level("reg"), Some(4));
        assert_eq!(stats.get("reg").unwrap().average(), 4.0 / 5.0);

        // Interval 1: every later scan samples from the last request time.
        assert_eq!(stats.begin_scan("reg", 4, 1, 10, clock.now()), Some(clock.now()));
    }

    #[test]
    fn test_growth_is_immediate_and_clamped() {
        let clock = ManualClock::new();
        let stats = tracker();
        stats.begin_scan("reg", 0, 1, 10, clock.now());
        assert_eq!(stats.level("reg"), Some(1));

        stats.begin_scan("reg", 0, 1, 10, clock.now());
        // 0.4 * 3 + 0.6 * 0 = 1.2; floor(5 * 1.2) = 6
        assert_eq!(stats.record_sample("reg", 3, None, 1, 10), Some(6));

        stats.begin_scan("reg", 0, 1, 10, clock.now());
        assert_eq!(stats.record_sample("reg", 50, None, 1, 10), Some(10));
    }

    #[test]
    fn test_shrink_waits_then_steps() {
        let clock = ManualClock::new();
        let stats = tracker();
        stats.begin_scan("reg", 10, 0, 10, clock.now());
        assert_eq!(stats.level("reg"), Some(10));

        let mut levels = Vec::new();
        for _ in 0..5 {
            stats.begin_scan("reg", 10, 0, 10, clock.now());
            levels.push(stats.record_sample("reg", 0, None, 0, 10).unwrap());
        }
        // Three quiet samples are tolerated, then the level drops by at most two.
        assert_eq!(levels, vec![10, 10, 10, 8, 8]);
    }

    #[test]
    fn test_window_moves_to_last_request() {
        let clock = ManualClock::new();
        let stats = tracker();
        stats.begin_scan("reg", 1, 0, 5, clock.now());

        clock.advance(chrono::Duration::minutes(1));
        let since = stats.begin_scan("reg", 1, 0, 5, clock.now()).unwrap();
        assert!(since < clock.now());
        stats.record_sample("reg", 1, Some(clock.now()), 0, 5);

        assert_eq!(stats.begin_scan("reg", 1, 0, 5, clock.now()), Some(clock.now()));

        stats.forget("reg");
        assert_eq!(stats.level("reg"), None);
    }
}
