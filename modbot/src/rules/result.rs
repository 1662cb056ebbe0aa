//! Evaluation result records handed to the result sink.

use chrono::{DateTime, Utc};
use platform_api::{Item, ItemKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::engine::RuleOutcome;
use crate::domain::Provenance;

/// One rule's contribution to a check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule: String,
    pub kind: String,
    pub triggered: bool,
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RuleResult {
    pub fn from_outcome(label: &str, kind: &str, outcome: &RuleOutcome, cached: bool) -> Self {
        Self {
            rule: label.to_string(),
            kind: kind.to_string(),
            triggered: outcome.triggered,
            cached,
            detail: outcome.detail.clone(),
        }
    }
}

/// An action the check executed (or would have, in dry run).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub kind: String,
    pub dry_run: bool,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    pub triggered: bool,
    pub rule_results: Vec<RuleResult>,
    pub actions: Vec<ActionRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub name: String,
    pub triggered: bool,
    pub checks: Vec<CheckOutcome>,
}

/// Complete record of one item's evaluation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub id: String,
    pub community: String,
    pub item_id: String,
    pub item_kind: ItemKind,
    pub provenance: Provenance,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub runs: Vec<RunOutcome>,
    pub rules_run: usize,
    pub rules_cached: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunResult {
    pub fn new(item: &Item, provenance: Provenance, dry_run: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            community: item.community.clone(),
            item_id: item.id.clone(),
            item_kind: item.kind,
            provenance,
            dry_run,
            started_at: Utc::now(),
            duration_ms: 0,
            runs: Vec::new(),
            rules_run: 0,
            rules_cached: 0,
            error: None,
        }
    }

    /// A result for an evaluation that failed before or during evaluation.
    pub fn failed(item: &Item, provenance: Provenance, error: impl std::fmt::Display) -> Self {
        let mut result = Self::new(item, provenance, false);
        result.error = Some(error.to_string());
        result
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn triggered_checks(&self) -> usize {
        self.runs
            .iter()
            .flat_map(|r| &r.checks)
            .filter(|c| c.triggered)
            .count()
    }

    pub fn actions_executed(&self) -> usize {
        self.runs
            .iter()
            .flat_map(|r| &r.checks)
            .flat_map(|c| &c.actions)
            .filter(|a| a.success && !a.dry_run)
            .count()
    }
}
