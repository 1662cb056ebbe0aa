//! Run / Check / Rule definitions.
//!
//! These are the loaded, validated forms. Post behaviors and dispatch
//! parameters are parsed during deserialization so evaluation never
//! re-parses strings.

use std::time::Duration;

use platform_api::{ActionRequest, ItemKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::behavior::{GotoTarget, PostBehavior};
use crate::queue::{CancelPolicy, TardyTolerance};

/// How member results are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Condition {
    #[default]
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

/// A single moderation predicate. The algorithm behind `kind` is provided
/// by a [`RuleEngine`](super::RuleEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: Value,
}

impl Rule {
    pub fn new(kind: impl Into<String>, config: Value) -> Self {
        Self {
            kind: kind.into(),
            name: None,
            config,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Label used in results and logs.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.kind)
    }
}

/// An AND/OR group of rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub condition: Condition,
    pub rules: Vec<Rule>,
}

/// Member of a Check's rule list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleNode {
    Set(RuleSet),
    Rule(Rule),
}

/// Re-dispatch parameters of a `dispatch` action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchAction {
    pub delay: Duration,
    pub identifier: Option<String>,
    pub cancel_if_queued: CancelPolicy,
    pub tardy_tolerance: TardyTolerance,
    pub start_at: Option<GotoTarget>,
}

/// An action executed when a Check triggers.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Handled by the core: schedule the item for delayed re-processing.
    Dispatch(DispatchAction),
    /// Forwarded to the platform client.
    Api(ActionRequest),
}

impl Action {
    pub fn kind(&self) -> &str {
        match self {
            Self::Dispatch(_) => "dispatch",
            Self::Api(request) => &request.kind,
        }
    }
}

#[derive(Deserialize)]
struct RawAction {
    kind: String,
    #[serde(flatten)]
    params: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawDispatch {
    #[serde(default)]
    delay: u64,
    #[serde(default)]
    identifier: Option<String>,
    #[serde(default, rename = "cancelIfQueued", alias = "cancel_if_queued")]
    cancel_if_queued: CancelPolicy,
    #[serde(default, rename = "tardyTolerant", alias = "tardy_tolerant")]
    tardy_tolerance: TardyTolerance,
    #[serde(default, alias = "start_at", alias = "startAt")]
    goto: Option<GotoTarget>,
}

impl TryFrom<RawAction> for Action {
    type Error = serde_json::Error;

    fn try_from(raw: RawAction) -> Result<Self, Self::Error> {
        if raw.kind.eq_ignore_ascii_case("dispatch") {
            let dispatch: RawDispatch = serde_json::from_value(Value::Object(raw.params))?;
            return Ok(Self::Dispatch(DispatchAction {
                delay: Duration::from_secs(dispatch.delay),
                identifier: dispatch.identifier,
                cancel_if_queued: dispatch.cancel_if_queued,
                tardy_tolerance: dispatch.tardy_tolerance,
                start_at: dispatch.goto,
            }));
        }
        Ok(Self::Api(ActionRequest::new(raw.kind, Value::Object(raw.params))))
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawAction::deserialize(deserializer)?;
        Action::try_from(raw).map_err(serde::de::Error::custom)
    }
}

fn default_check_post_trigger() -> PostBehavior {
    PostBehavior::NextRun
}

/// Evaluates rules and, on trigger, executes actions.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Check {
    pub name: String,
    /// Only evaluate for items of this kind.
    #[serde(default)]
    pub kind: Option<ItemKind>,
    #[serde(default)]
    pub condition: Condition,
    #[serde(default)]
    pub rules: Vec<RuleNode>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default = "default_check_post_trigger")]
    pub post_trigger: PostBehavior,
    #[serde(default)]
    pub post_fail: PostBehavior,
    #[serde(default)]
    pub dry_run: Option<bool>,
}

impl Check {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: None,
            condition: Condition::And,
            rules: Vec::new(),
            actions: Vec::new(),
            post_trigger: default_check_post_trigger(),
            post_fail: PostBehavior::Next,
            dry_run: None,
        }
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(RuleNode::Rule(rule));
        self
    }

    pub fn with_rule_set(mut self, set: RuleSet) -> Self {
        self.rules.push(RuleNode::Set(set));
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_kind(mut self, kind: ItemKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_post_trigger(mut self, behavior: PostBehavior) -> Self {
        self.post_trigger = behavior;
        self
    }

    pub fn with_post_fail(mut self, behavior: PostBehavior) -> Self {
        self.post_fail = behavior;
        self
    }

    pub fn applies_to(&self, kind: ItemKind) -> bool {
        self.kind.is_none_or(|k| k == kind)
    }
}

/// A named, ordered group of Checks.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub name: String,
    #[serde(default)]
    pub checks: Vec<Check>,
    #[serde(default)]
    pub post_trigger: PostBehavior,
    #[serde(default)]
    pub post_fail: PostBehavior,
}

impl Run {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            checks: Vec::new(),
            post_trigger: PostBehavior::Next,
            post_fail: PostBehavior::Next,
        }
    }

    pub fn with_check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    pub fn with_post_trigger(mut self, behavior: PostBehavior) -> Self {
        self.post_trigger = behavior;
        self
    }

    pub fn with_post_fail(mut self, behavior: PostBehavior) -> Self {
        self.post_fail = behavior;
        self
    }

    pub fn check_index(&self, name: &str) -> Option<usize> {
        self.checks.iter().position(|c| c.name == name)
    }

    /// Every goto target named by this run or its checks.
    pub fn goto_targets(&self) -> impl Iterator<Item = &GotoTarget> {
        let own = [&self.post_trigger, &self.post_fail]
            .into_iter()
            .filter_map(PostBehavior::goto_target);
        let checks = self.checks.iter().flat_map(|check| {
            [&check.post_trigger, &check.post_fail]
                .into_iter()
                .filter_map(PostBehavior::goto_target)
                .chain(check.actions.iter().filter_map(|action| match action {
                    Action::Dispatch(d) => d.start_at.as_ref(),
                    Action::Api(_) => None,
                }))
        });
        own.chain(checks)
    }
}

/// Find the (run, check) indices a target points at.
pub fn resolve_target(runs: &[Run], target: &GotoTarget) -> Option<(usize, usize)> {
    let run_idx = runs.iter().position(|r| r.name == target.run)?;
    let check_idx = match &target.check {
        Some(check) => runs[run_idx].check_index(check)?,
        None => 0,
    };
    Some((run_idx, check_idx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_check_defaults() {
        let check: Check = serde_json::from_value(json!({
            "name": "links",
            "rules": [{ "kind": "regex", "config": { "pattern": "http" } }]
        }))
        .unwrap();
        assert_eq!(check.post_trigger, PostBehavior::NextRun);
        assert_eq!(check.post_fail, PostBehavior::Next);
        assert_eq!(check.condition, Condition::And);
        assert!(check.applies_to(ItemKind::Comment));
    }

    #[test]
    fn test_rule_node_untagged() {
        let nodes: Vec<RuleNode> = serde_json::from_value(json!([
            { "kind": "author", "config": { "age": 3 } },
            { "condition": "OR", "rules": [{ "kind": "a" }, { "kind": "b" }] }
        ]))
        .unwrap();
        assert!(matches!(nodes[0], RuleNode::Rule(_)));
        match &nodes[1] {
            RuleNode::Set(set) => {
                assert_eq!(set.condition, Condition::Or);
                assert_eq!(set.rules.len(), 2);
            }
            other => panic!("expected set, got {:?}", other),
        }
    }

    #[test]
    fn test_dispatch_action_parsing() {
        let action: Action = serde_json::from_value(json!({
            "kind": "dispatch",
            "delay": 600,
            "identifier": "recheck",
            "cancelIfQueued": ["poll"],
            "tardyTolerant": 120,
            "goto": "spam.links"
        }))
        .unwrap();
        let Action::Dispatch(dispatch) = action else {
            panic!("expected dispatch");
        };
        assert_eq!(dispatch.delay, Duration::from_secs(600));
        assert_eq!(dispatch.identifier.as_deref(), Some("recheck"));
        assert_eq!(
            dispatch.cancel_if_queued,
            CancelPolicy::Sources(vec!["poll".to_string()])
        );
        assert_eq!(
            dispatch.tardy_tolerance,
            TardyTolerance::Max(Duration::from_secs(120))
        );
        assert_eq!(dispatch.start_at, Some(GotoTarget::check("spam", "links")));
    }

    #[test]
    fn test_api_action_keeps_params() {
        let action: Action = serde_json::from_value(json!({
            "kind": "remove",
            "spam": true
        }))
        .unwrap();
        assert_eq!(action.kind(), "remove");
        let Action::Api(request) = action else {
            panic!("expected api action");
        };
        assert_eq!(request.params, json!({ "spam": true }));
    }

    #[test]
    fn test_resolve_target() {
        let runs = vec![
            Run::new("first").with_check(Check::new("a")),
            Run::new("second")
                .with_check(Check::new("b"))
                .with_check(Check::new("c")),
        ];
        assert_eq!(resolve_target(&runs, &GotoTarget::run("second")), Some((1, 0)));
        assert_eq!(
            resolve_target(&runs, &GotoTarget::check("second", "c")),
            Some((1, 1))
        );
        assert_eq!(resolve_target(&runs, &GotoTarget::check("first", "z")), None);
    }
}
