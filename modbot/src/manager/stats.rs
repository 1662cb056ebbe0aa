//! Processing counters and rolling rates for one community.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::rules::RunResult;

/// Samples kept per rolling rate.
pub const RATE_WINDOW_SAMPLES: usize = 10;

/// Interval between rate samples.
pub const STATS_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Per-second rate of a monotonic counter over the last few samples.
#[derive(Debug, Default)]
struct RollingRate {
    samples: VecDeque<(Instant, u64)>,
}

impl RollingRate {
    fn sample(&mut self, at: Instant, value: u64) {
        self.samples.push_back((at, value));
        while self.samples.len() > RATE_WINDOW_SAMPLES {
            self.samples.pop_front();
        }
    }

    fn per_second(&self) -> f64 {
        let (Some(&(first_at, first)), Some(&(last_at, last))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let elapsed = last_at.saturating_duration_since(first_at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        last.saturating_sub(first) as f64 / elapsed
    }
}

/// Snapshot for status reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub items_processed: u64,
    pub items_failed: u64,
    pub rules_run: u64,
    pub rules_cached: u64,
    pub checks_triggered: u64,
    pub actions_executed: u64,
    pub api_calls: u64,
    /// Items evaluated per second.
    pub events_rate: f64,
    /// Rules actually invoked per second.
    pub rules_rate: f64,
}

#[derive(Debug, Default)]
pub struct ManagerStats {
    items_processed: AtomicU64,
    items_failed: AtomicU64,
    rules_run: AtomicU64,
    rules_cached: AtomicU64,
    checks_triggered: AtomicU64,
    actions_executed: AtomicU64,
    api_calls: AtomicU64,
    events_rate: Mutex<RollingRate>,
    rules_rate: Mutex<RollingRate>,
}

impl ManagerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_result(&self, result: &RunResult) {
        self.items_processed.fetch_add(1, Ordering::Relaxed);
        if result.is_failed() {
            self.items_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.rules_run
            .fetch_add(result.rules_run as u64, Ordering::Relaxed);
        self.rules_cached
            .fetch_add(result.rules_cached as u64, Ordering::Relaxed);
        self.checks_triggered
            .fetch_add(result.triggered_checks() as u64, Ordering::Relaxed);
        let actions = result.actions_executed() as u64;
        self.actions_executed.fetch_add(actions, Ordering::Relaxed);
        self.api_calls.fetch_add(actions, Ordering::Relaxed);
    }

    pub fn record_api_calls(&self, count: u64) {
        self.api_calls.fetch_add(count, Ordering::Relaxed);
    }

    /// Take one rate sample of the event and rule counters.
    pub fn sample(&self, at: Instant) {
        self.events_rate
            .lock()
            .sample(at, self.items_processed.load(Ordering::Relaxed));
        self.rules_rate
            .lock()
            .sample(at, self.rules_run.load(Ordering::Relaxed));
    }

    pub fn events_rate(&self) -> f64 {
        self.events_rate.lock().per_second()
    }

    pub fn rules_rate(&self) -> f64 {
        self.rules_rate.lock().per_second()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            items_processed: self.items_processed.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            rules_run: self.rules_run.load(Ordering::Relaxed),
            rules_cached: self.rules_cached.load(Ordering::Relaxed),
            checks_triggered: self.checks_triggered.load(Ordering::Relaxed),
            actions_executed: self.actions_executed.load(Ordering::Relaxed),
            api_calls: self.api_calls.load(Ordering::Relaxed),
            events_rate: self.events_rate(),
            rules_rate: self.rules_rate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Provenance;
    use chrono::Utc;
    use platform_api::{Item, ItemKind};

    fn result(rules_run: usize, rules_cached: usize) -> RunResult {
        let item = Item::new("t3_a", ItemKind::Submission, "rust", "alice", Utc::now());
        let mut result = RunResult::new(&item, Provenance::User, false);
        result.rules_run = rules_run;
        result.rules_cached = rules_cached;
        result
    }

    #[test]
    fn test_counters() {
        let stats = ManagerStats::new();
        stats.record_result(&result(3, 1));
        stats.record_result(&RunResult::failed(
            &Item::new("t3_b", ItemKind::Submission, "rust", "bob", Utc::now()),
            Provenance::User,
            "boom",
        ));
        stats.record_api_calls(2);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.items_processed, 2);
        assert_eq!(snapshot.items_failed, 1);
        assert_eq!(snapshot.rules_run, 3);
        assert_eq!(snapshot.rules_cached, 1);
        assert_eq!(snapshot.api_calls, 2);
    }

    #[test]
    fn test_rolling_rates() {
        let stats = ManagerStats::new();
        let start = Instant::now();
        assert_eq!(stats.events_rate(), 0.0);

        for step in 0..15u64 {
            for _ in 0..2 {
                stats.record_result(&result(1, 0));
            }
            stats.sample(start + Duration::from_secs(step * 5));
        }

        // 2 items and 2 rules per 5s sample
        assert!((stats.events_rate() - 0.4).abs() < 1e-9);
        assert!((stats.rules_rate() - 0.4).abs() < 1e-9);
    }
}
