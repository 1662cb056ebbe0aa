//! Rolling view of the shared API budget.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Number of consecutive deltas kept in the window.
pub const WINDOW_DELTAS: usize = 8;

/// Expected spacing of readings; rates are per second of this spacing.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// Snapshot of the tracker for status reads and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetSnapshot {
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
    /// Requests per second.
    pub consumption_rate: f64,
    pub estimated_depletion_secs: Option<f64>,
}

/// Consumption rate and time-to-depletion from periodic budget readings.
///
/// The window holds up to `WINDOW_DELTAS + 1` readings. A reading higher
/// than its predecessor means the budget was reset, and starts a new window.
#[derive(Debug, Clone)]
pub struct RateBudgetTracker {
    readings: VecDeque<u32>,
    sample_interval: Duration,
    reset_at: Option<DateTime<Utc>>,
}

impl Default for RateBudgetTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_INTERVAL)
    }
}

impl RateBudgetTracker {
    pub fn new(sample_interval: Duration) -> Self {
        Self {
            readings: VecDeque::with_capacity(WINDOW_DELTAS + 1),
            sample_interval,
            reset_at: None,
        }
    }

    pub fn record(&mut self, remaining: u32, reset_at: Option<DateTime<Utc>>) {
        if self.readings.back().is_some_and(|&prev| remaining > prev) {
            self.readings.clear();
        }
        self.readings.push_back(remaining);
        while self.readings.len() > WINDOW_DELTAS + 1 {
            self.readings.pop_front();
        }
        self.reset_at = reset_at;
    }

    pub fn remaining(&self) -> Option<u32> {
        self.readings.back().copied()
    }

    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        self.reset_at
    }

    /// Mean consumption per second over the window.
    pub fn consumption_rate(&self) -> f64 {
        if self.readings.len() < 2 {
            return 0.0;
        }
        let total: u64 = self
            .readings
            .iter()
            .zip(self.readings.iter().skip(1))
            .map(|(prev, curr)| u64::from(prev.saturating_sub(*curr)))
            .sum();
        let deltas = (self.readings.len() - 1) as f64;
        let mean = total as f64 / deltas;
        mean / self.sample_interval.as_secs_f64()
    }

    /// Time until the budget runs out at the current rate.
    pub fn estimated_depletion(&self) -> Option<Duration> {
        let rate = self.consumption_rate();
        if rate <= 0.0 {
            return None;
        }
        let remaining = f64::from(self.remaining()?);
        Some(Duration::from_secs_f64(remaining / rate))
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            remaining: self.remaining(),
            reset_at: self.reset_at,
            consumption_rate: self.consumption_rate(),
            estimated_depletion_secs: self.estimated_depletion().map(|d| d.as_secs_f64()),
        }
    }

    pub fn clear(&mut self) {
        self.readings.clear();
    }
}
