//! Per-item rule result cache.

use std::collections::HashMap;

use super::engine::RuleOutcome;
use super::types::Rule;

/// Results of rules already invoked during one item's evaluation pass.
///
/// Rules are keyed by kind plus their configuration; `serde_json` object
/// keys are ordered, so two structurally equal configs render identically.
#[derive(Debug, Default)]
pub struct RuleResultCache {
    entries: HashMap<String, RuleOutcome>,
    rules_run: usize,
    rules_cached: usize,
}

impl RuleResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(rule: &Rule) -> String {
        format!("{}:{}", rule.kind, rule.config)
    }

    /// Look up an equal rule. A hit counts as cached.
    pub fn lookup(&mut self, rule: &Rule) -> Option<RuleOutcome> {
        let hit = self.entries.get(&Self::key(rule)).cloned();
        if hit.is_some() {
            self.rules_cached += 1;
        }
        hit
    }

    /// Record a freshly invoked rule.
    pub fn record(&mut self, rule: &Rule, outcome: RuleOutcome) {
        self.rules_run += 1;
        self.entries.insert(Self::key(rule), outcome);
    }

    pub fn rules_run(&self) -> usize {
        self.rules_run
    }

    pub fn rules_cached(&self) -> usize {
        self.rules_cached
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
