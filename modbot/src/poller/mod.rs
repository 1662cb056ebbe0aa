//! Content-stream polling.

pub mod retry;
pub mod state;
pub mod stream_poller;

pub use retry::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_RATE_LIMIT_COOLDOWN, RetryConfig, RetryDecision, RetryHandler,
};
pub use state::{PageClassification, PollState};
pub use stream_poller::{INTERVAL_JITTER, PollerEvent, StreamPoller, TickOutcome};
