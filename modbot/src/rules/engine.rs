//! Rule algorithm seam.

use async_trait::async_trait;
use platform_api::Item;
use serde::{Deserialize, Serialize};

use super::error::EvaluationError;
use super::types::Rule;

/// Result of invoking one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub triggered: bool,
    /// Free-form explanation produced by the rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RuleOutcome {
    pub fn triggered() -> Self {
        Self {
            triggered: true,
            detail: None,
        }
    }

    pub fn passed() -> Self {
        Self {
            triggered: false,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Executes the algorithm behind a rule kind.
#[async_trait]
pub trait RuleEngine: Send + Sync {
    async fn run_rule(&self, rule: &Rule, item: &Item) -> Result<RuleOutcome, EvaluationError>;
}
