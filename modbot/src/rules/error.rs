use platform_api::ApiError;
use thiserror::Error;

/// Errors raised while evaluating one item.
#[derive(Error, Debug, Clone)]
pub enum EvaluationError {
    /// A rule implementation failed; only this item is affected.
    #[error("Rule {rule} failed: {message}")]
    Rule { rule: String, message: String },

    #[error("Failed to refresh item: {0}")]
    Refresh(#[source] ApiError),

    #[error("Goto target {target} visited more than {max_depth} times")]
    LoopDepthExceeded { target: String, max_depth: u32 },

    #[error("Unknown goto target: {0}")]
    UnknownTarget(String),

    /// Unrecoverable for the whole community; the manager halts.
    #[error("Serious error: {0}")]
    Serious(String),
}

impl EvaluationError {
    pub fn rule(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rule {
            rule: rule.into(),
            message: message.into(),
        }
    }

    pub fn serious(message: impl Into<String>) -> Self {
        Self::Serious(message.into())
    }

    pub fn is_serious(&self) -> bool {
        matches!(self, Self::Serious(_))
    }
}
