//! Process-wide defaults every community configuration starts from.

use serde::{Deserialize, Serialize};

use crate::nanny::NannyConfig;
use crate::poller::RetryConfig;
use crate::queue::DEFAULT_CONCURRENCY;
use crate::rules::DEFAULT_MAX_GOTO_DEPTH;

pub const DEFAULT_POLL_LIMIT: usize = 50;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Base configuration layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalDefaults {
    #[serde(default = "default_queue_concurrency")]
    pub queue_concurrency: usize,
    #[serde(default = "default_poll_limit")]
    pub poll_limit: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_goto_depth")]
    pub max_goto_depth: u32,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub nanny: NannyConfig,
}

fn default_queue_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_poll_limit() -> usize {
    DEFAULT_POLL_LIMIT
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_max_goto_depth() -> u32 {
    DEFAULT_MAX_GOTO_DEPTH
}

impl Default for GlobalDefaults {
    fn default() -> Self {
        Self {
            queue_concurrency: default_queue_concurrency(),
            poll_limit: default_poll_limit(),
            poll_interval_secs: default_poll_interval_secs(),
            max_goto_depth: default_max_goto_depth(),
            dry_run: false,
            retry: RetryConfig::default(),
            nanny: NannyConfig::default(),
        }
    }
}
