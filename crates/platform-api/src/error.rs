use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// Server-side failure (5xx) that is expected to clear up on its own.
    #[error("transient api error (status {status}): {message}")]
    Transient { status: u16, message: String },
    #[error("request timed out")]
    Timeout,
    /// The shared budget is exhausted until the platform resets it.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },
    #[error("item not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("other: {0}")]
    Other(String),
}

impl ApiError {
    /// Whether the request may succeed if simply retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout)
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn transient(status: u16, message: impl Into<String>) -> Self {
        Self::Transient {
            status,
            message: message.into(),
        }
    }
}
