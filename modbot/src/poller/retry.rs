//! Retry decisions for failed polls.
//!
//! Transient failures back off exponentially: `2^attempt` seconds plus up to
//! one second of jitter, until `max_attempts` consecutive failures, after
//! which the source is given up on. Rate-limit failures wait a fixed
//! cooldown and never count toward the cap.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use platform_api::ApiError;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default consecutive transient failures tolerated per source.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default wait after a rate-limit response.
pub const DEFAULT_RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(30);

/// Maximum exponent to prevent overflow.
const MAX_EXPONENT: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_rate_limit_cooldown_secs")]
    pub rate_limit_cooldown_secs: u64,
    #[serde(default = "default_true")]
    pub use_jitter: bool,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_rate_limit_cooldown_secs() -> u64 {
    DEFAULT_RATE_LIMIT_COOLDOWN.as_secs()
}

fn default_true() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            rate_limit_cooldown_secs: default_rate_limit_cooldown_secs(),
            use_jitter: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after this delay.
    Retry(Duration),
    /// Stop polling this source.
    GiveUp,
}

/// Tracks consecutive failures per source key.
#[derive(Debug, Default)]
pub struct RetryHandler {
    config: RetryConfig,
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decide what to do after `error` from `key`.
    pub fn handle(&self, key: &str, error: &ApiError) -> RetryDecision {
        if error.is_rate_limit() {
            let cooldown = Duration::from_secs(self.config.rate_limit_cooldown_secs);
            let delay = match error {
                ApiError::RateLimited {
                    retry_after: Some(after),
                } => cooldown.max(*after),
                _ => cooldown,
            };
            debug!(source = key, delay_secs = delay.as_secs(), "Rate limited, cooling down");
            return RetryDecision::Retry(delay);
        }

        if !error.is_transient() {
            warn!(source = key, error = %error, "Non-retryable error");
            self.attempts.lock().remove(key);
            return RetryDecision::GiveUp;
        }

        let attempt = {
            let mut attempts = self.attempts.lock();
            let count = attempts.entry(key.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if attempt > self.config.max_attempts {
            warn!(
                source = key,
                attempts = attempt - 1,
                "Retry attempts exhausted, giving up"
            );
            self.attempts.lock().remove(key);
            return RetryDecision::GiveUp;
        }

        let delay = self.delay_for_attempt(attempt);
        debug!(
            source = key,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Retrying after transient error"
        );
        RetryDecision::Retry(delay)
    }

    /// Reset the failure count after a successful poll.
    pub fn record_success(&self, key: &str) {
        self.attempts.lock().remove(key);
    }

    pub fn attempts(&self, key: &str) -> u32 {
        self.attempts.lock().get(key).copied().unwrap_or(0)
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(MAX_EXPONENT);
        let base = Duration::from_secs(1u64 << exponent);
        if self.config.use_jitter {
            base + Duration::from_secs_f64(rand::random::<f64>())
        } else {
            base
        }
    }
}
