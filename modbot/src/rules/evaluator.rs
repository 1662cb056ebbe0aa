//! Run/Check evaluation with goto control flow and rule-result caching.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use platform_api::{ApiClient, Item};
use tracing::{debug, info, warn};

use super::behavior::{GotoTarget, PostBehavior};
use super::cache::RuleResultCache;
use super::engine::RuleEngine;
use super::error::EvaluationError;
use super::result::{ActionRecord, CheckOutcome, RuleResult, RunOutcome, RunResult};
use super::types::{Action, Check, Condition, Rule, RuleNode, RuleSet, Run, resolve_target};
use crate::domain::Provenance;
use crate::queue::{DelayedDispatchStore, DelayedEntry};

/// Default number of times one goto target may be jumped to per item.
pub const DEFAULT_MAX_GOTO_DEPTH: u32 = 1;

/// Per-request evaluation parameters.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub provenance: Provenance,
    /// Overrides both the check-level and global dry-run flags.
    pub dry_run: Option<bool>,
    pub start_at: Option<GotoTarget>,
}

impl EvaluationContext {
    pub fn new(provenance: Provenance) -> Self {
        Self {
            provenance,
            dry_run: None,
            start_at: None,
        }
    }
}

/// Outcome of one item's pass. `result` is always populated, including the
/// runs completed before a failure.
#[derive(Debug)]
pub struct Evaluation {
    pub result: RunResult,
    pub error: Option<EvaluationError>,
}

impl Evaluation {
    pub fn into_result(self) -> Result<RunResult, EvaluationError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result),
        }
    }
}

enum Flow {
    Continue,
    Stop,
    Jump(GotoTarget),
}

/// Evaluates items against an ordered list of Runs.
pub struct RunEvaluator {
    runs: Arc<Vec<Run>>,
    engine: Arc<dyn RuleEngine>,
    client: Arc<dyn ApiClient>,
    delayed: Arc<DelayedDispatchStore>,
    max_goto_depth: u32,
    dry_run: bool,
}

impl RunEvaluator {
    pub fn new(
        runs: Arc<Vec<Run>>,
        engine: Arc<dyn RuleEngine>,
        client: Arc<dyn ApiClient>,
        delayed: Arc<DelayedDispatchStore>,
    ) -> Self {
        Self {
            runs,
            engine,
            client,
            delayed,
            max_goto_depth: DEFAULT_MAX_GOTO_DEPTH,
            dry_run: false,
        }
    }

    pub fn with_max_goto_depth(mut self, depth: u32) -> Self {
        self.max_goto_depth = depth;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    pub async fn evaluate(&self, item: &Item, ctx: EvaluationContext) -> Evaluation {
        let started = Instant::now();
        let dry_run = ctx.dry_run.unwrap_or(self.dry_run);
        let mut result = RunResult::new(item, ctx.provenance.clone(), dry_run);
        let mut cache = RuleResultCache::new();

        let error = self
            .evaluate_runs(item, &ctx, &mut cache, &mut result)
            .await
            .err();

        result.rules_run = cache.rules_run();
        result.rules_cached = cache.rules_cached();
        result.duration_ms = started.elapsed().as_millis() as u64;
        if let Some(err) = &error {
            result.error = Some(err.to_string());
        }

        debug!(
            item_id = %item.id,
            runs = result.runs.len(),
            rules_run = result.rules_run,
            rules_cached = result.rules_cached,
            "Evaluation finished"
        );

        Evaluation { result, error }
    }

    async fn evaluate_runs(
        &self,
        item: &Item,
        ctx: &EvaluationContext,
        cache: &mut RuleResultCache,
        result: &mut RunResult,
    ) -> Result<(), EvaluationError> {
        let (mut run_idx, mut check_idx) = match &ctx.start_at {
            Some(target) => resolve_target(&self.runs, target)
                .ok_or_else(|| EvaluationError::UnknownTarget(target.to_string()))?,
            None => (0, 0),
        };
        let mut visits: HashMap<GotoTarget, u32> = HashMap::new();

        while let Some(run) = self.runs.get(run_idx) {
            let (outcome, flow) = self.evaluate_run(run, check_idx, item, ctx, cache).await?;
            let run_triggered = outcome.triggered;
            result.runs.push(outcome);

            let flow = match flow {
                Flow::Continue => {
                    let behavior = if run_triggered {
                        &run.post_trigger
                    } else {
                        &run.post_fail
                    };
                    match behavior {
                        PostBehavior::Next | PostBehavior::NextRun => Flow::Continue,
                        PostBehavior::Stop => Flow::Stop,
                        PostBehavior::Goto(target) => Flow::Jump(target.clone()),
                    }
                }
                other => other,
            };

            match flow {
                Flow::Continue => {
                    run_idx += 1;
                    check_idx = 0;
                }
                Flow::Stop => {
                    debug!(item_id = %item.id, run = %run.name, "Evaluation stopped");
                    break;
                }
                Flow::Jump(target) => {
                    let count = visits.entry(target.clone()).or_insert(0);
                    *count += 1;
                    if *count > self.max_goto_depth {
                        warn!(
                            item_id = %item.id,
                            target = %target,
                            max_depth = self.max_goto_depth,
                            "Goto loop depth exceeded"
                        );
                        return Err(EvaluationError::LoopDepthExceeded {
                            target: target.to_string(),
                            max_depth: self.max_goto_depth,
                        });
                    }
                    (run_idx, check_idx) = resolve_target(&self.runs, &target)
                        .ok_or_else(|| EvaluationError::UnknownTarget(target.to_string()))?;
                    debug!(item_id = %item.id, target = %target, "Goto");
                }
            }
        }

        Ok(())
    }

    async fn evaluate_run(
        &self,
        run: &Run,
        start_check: usize,
        item: &Item,
        ctx: &EvaluationContext,
        cache: &mut RuleResultCache,
    ) -> Result<(RunOutcome, Flow), EvaluationError> {
        let mut outcome = RunOutcome {
            name: run.name.clone(),
            triggered: false,
            checks: Vec::new(),
        };
        let mut flow = Flow::Continue;

        for check in run.checks.iter().skip(start_check) {
            if !check.applies_to(item.kind) {
                continue;
            }

            let check_outcome = self.evaluate_check(run, check, item, ctx, cache).await?;
            let triggered = check_outcome.triggered;
            outcome.checks.push(check_outcome);

            let behavior = if triggered {
                &check.post_trigger
            } else {
                &check.post_fail
            };
            match behavior {
                PostBehavior::Next => {}
                PostBehavior::NextRun => break,
                PostBehavior::Stop => {
                    flow = Flow::Stop;
                    break;
                }
                PostBehavior::Goto(target) => {
                    flow = Flow::Jump(target.clone());
                    break;
                }
            }
        }

        outcome.triggered = outcome.checks.iter().any(|c| c.triggered);
        Ok((outcome, flow))
    }

    async fn evaluate_check(
        &self,
        run: &Run,
        check: &Check,
        item: &Item,
        ctx: &EvaluationContext,
        cache: &mut RuleResultCache,
    ) -> Result<CheckOutcome, EvaluationError> {
        let mut rule_results = Vec::new();
        let mut triggered = check.condition == Condition::And;

        for node in &check.rules {
            let node_triggered = match node {
                RuleNode::Rule(rule) => {
                    self.evaluate_rule(rule, item, cache, &mut rule_results)
                        .await?
                }
                RuleNode::Set(set) => {
                    self.evaluate_set(set, item, cache, &mut rule_results)
                        .await?
                }
            };
            match check.condition {
                Condition::And if !node_triggered => {
                    triggered = false;
                    break;
                }
                Condition::Or if node_triggered => {
                    triggered = true;
                    break;
                }
                _ => {}
            }
        }

        let mut actions = Vec::new();
        if triggered {
            let dry_run = ctx
                .dry_run
                .or(check.dry_run)
                .unwrap_or(self.dry_run);
            let source = format!("{}.{}", run.name, check.name);
            info!(item_id = %item.id, check = %source, dry_run, "Check triggered");
            for action in &check.actions {
                actions.push(self.execute_action(action, item, &source, dry_run).await);
            }
        }

        Ok(CheckOutcome {
            name: check.name.clone(),
            triggered,
            rule_results,
            actions,
        })
    }

    async fn evaluate_set(
        &self,
        set: &RuleSet,
        item: &Item,
        cache: &mut RuleResultCache,
        results: &mut Vec<RuleResult>,
    ) -> Result<bool, EvaluationError> {
        for rule in &set.rules {
            let triggered = self.evaluate_rule(rule, item, cache, results).await?;
            match set.condition {
                Condition::And if !triggered => return Ok(false),
                Condition::Or if triggered => return Ok(true),
                _ => {}
            }
        }
        Ok(set.condition == Condition::And)
    }

    async fn evaluate_rule(
        &self,
        rule: &Rule,
        item: &Item,
        cache: &mut RuleResultCache,
        results: &mut Vec<RuleResult>,
    ) -> Result<bool, EvaluationError> {
        if let Some(outcome) = cache.lookup(rule) {
            results.push(RuleResult::from_outcome(rule.label(), &rule.kind, &outcome, true));
            return Ok(outcome.triggered);
        }

        let outcome = self.engine.run_rule(rule, item).await?;
        results.push(RuleResult::from_outcome(rule.label(), &rule.kind, &outcome, false));
        let triggered = outcome.triggered;
        cache.record(rule, outcome);
        Ok(triggered)
    }

    async fn execute_action(
        &self,
        action: &Action,
        item: &Item,
        source: &str,
        dry_run: bool,
    ) -> ActionRecord {
        let mut record = ActionRecord {
            kind: action.kind().to_string(),
            dry_run,
            success: true,
            error: None,
        };
        if dry_run {
            debug!(item_id = %item.id, action = %record.kind, "Dry run, action not performed");
            return record;
        }

        match action {
            Action::Dispatch(dispatch) => {
                let entry = DelayedEntry::from_dispatch(item.clone(), dispatch, source);
                debug!(
                    item_id = %item.id,
                    delay_secs = dispatch.delay.as_secs(),
                    "Scheduling delayed dispatch"
                );
                self.delayed.add(entry);
            }
            Action::Api(request) => {
                if let Err(e) = self.client.perform_action(item, request).await {
                    warn!(item_id = %item.id, action = %request.kind, error = %e, "Action failed");
                    record.success = false;
                    record.error = Some(e.to_string());
                }
            }
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use platform_api::testing::MockClient;
    use platform_api::{ActionRequest, ItemKind};
    use serde_json::json;
    use std::time::Duration;

    use crate::queue::{CancelPolicy, TardyTolerance};
    use crate::rules::{DispatchAction, RuleOutcome};

    /// Triggers for rules whose config has `"trigger": true`.
    #[derive(Default)]
    struct ConfigEngine {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RuleEngine for ConfigEngine {
        async fn run_rule(
            &self,
            rule: &Rule,
            _item: &Item,
        ) -> Result<RuleOutcome, EvaluationError> {
            self.calls.lock().push(rule.label().to_string());
            if rule.config.get("fail").is_some() {
                return Err(EvaluationError::rule(rule.label(), "boom"));
            }
            let triggered = rule.config.get("trigger") == Some(&json!(true));
            Ok(RuleOutcome {
                triggered,
                detail: None,
            })
        }
    }

    fn item() -> Item {
        Item::new("t3_x", ItemKind::Submission, "rust", "alice", Utc::now())
    }

    fn rule(name: &str, trigger: bool) -> Rule {
        Rule::new("flag", json!({ "trigger": trigger, "n": name })).with_name(name)
    }

    struct Harness {
        engine: Arc<ConfigEngine>,
        client: Arc<MockClient>,
        delayed: Arc<DelayedDispatchStore>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                engine: Arc::new(ConfigEngine::default()),
                client: Arc::new(MockClient::new()),
                delayed: Arc::new(DelayedDispatchStore::new()),
            }
        }

        fn evaluator(&self, runs: Vec<Run>) -> RunEvaluator {
            RunEvaluator::new(
                Arc::new(runs),
                self.engine.clone(),
                self.client.clone(),
                self.delayed.clone(),
            )
        }
    }

    #[tokio::test]
    async fn test_sequential_runs_and_actions() {
        let h = Harness::new();
        let runs = vec![
            Run::new("spam").with_check(
                Check::new("links")
                    .with_rule(rule("has_link", true))
                    .with_action(Action::Api(ActionRequest::new("remove", json!({})))),
            ),
            Run::new("quality").with_check(Check::new("short").with_rule(rule("short", false))),
        ];
        let evaluation = h
            .evaluator(runs)
            .evaluate(&item(), EvaluationContext::new(Provenance::User))
            .await;
        let result = evaluation.into_result().unwrap();

        assert_eq!(result.runs.len(), 2);
        assert!(result.runs[0].triggered);
        assert!(!result.runs[1].triggered);
        assert_eq!(result.actions_executed(), 1);
        assert_eq!(h.client.actions()[0].1.kind, "remove");
    }

    #[tokio::test]
    async fn test_goto_loop_depth_exceeded() {
        let h = Harness::new();
        let runs = vec![
            Run::new("A")
                .with_check(Check::new("c").with_rule(rule("r", false)))
                .with_post_fail(PostBehavior::Goto(GotoTarget::run("A"))),
        ];
        let evaluation = h
            .evaluator(runs)
            .evaluate(&item(), EvaluationContext::new(Provenance::User))
            .await;

        assert!(matches!(
            evaluation.error,
            Some(EvaluationError::LoopDepthExceeded { max_depth: 1, .. })
        ));
        // default depth 1: A runs twice, the next jump aborts
        assert_eq!(evaluation.result.runs.len(), 2);
        assert!(evaluation.result.is_failed());
    }

    #[tokio::test]
    async fn test_goto_depth_configurable() {
        let h = Harness::new();
        let runs = vec![
            Run::new("A")
                .with_check(Check::new("c").with_rule(rule("r", false)))
                .with_post_fail(PostBehavior::Goto(GotoTarget::run("A"))),
        ];
        let evaluation = h
            .evaluator(runs)
            .with_max_goto_depth(3)
            .evaluate(&item(), EvaluationContext::new(Provenance::User))
            .await;
        assert_eq!(evaluation.result.runs.len(), 4);
        assert!(evaluation.error.is_some());
    }

    #[tokio::test]
    async fn test_rule_cache_across_checks() {
        let h = Harness::new();
        let runs = vec![
            Run::new("one").with_check(Check::new("a").with_rule(rule("shared", false))),
            Run::new("two").with_check(Check::new("b").with_rule(rule("shared", false))),
        ];
        let result = h
            .evaluator(runs)
            .evaluate(&item(), EvaluationContext::new(Provenance::User))
            .await
            .into_result()
            .unwrap();

        assert_eq!(h.engine.calls.lock().len(), 1);
        assert_eq!(result.rules_run, 1);
        assert_eq!(result.rules_cached, 1);
        assert!(result.runs[1].checks[0].rule_results[0].cached);
    }

    #[tokio::test]
    async fn test_and_or_short_circuit() {
        let h = Harness::new();
        let runs = vec![Run::new("r").with_check(
            Check::new("c")
                .with_condition(Condition::Or)
                .with_rule(rule("first", true))
                .with_rule(rule("second", true)),
        )];
        let result = h
            .evaluator(runs)
            .evaluate(&item(), EvaluationContext::new(Provenance::User))
            .await
            .into_result()
            .unwrap();
        assert!(result.runs[0].triggered);
        assert_eq!(*h.engine.calls.lock(), vec!["first".to_string()]);

        let h = Harness::new();
        let runs = vec![Run::new("r").with_check(Check::new("c").with_rule_set(RuleSet {
            condition: Condition::And,
            rules: vec![rule("no", false), rule("never", true)],
        }))];
        let result = h
            .evaluator(runs)
            .evaluate(&item(), EvaluationContext::new(Provenance::User))
            .await
            .into_result()
            .unwrap();
        assert!(!result.runs[0].triggered);
        assert_eq!(*h.engine.calls.lock(), vec!["no".to_string()]);
    }

    #[tokio::test]
    async fn test_kind_filter_and_stop() {
        let h = Harness::new();
        let runs = vec![
            Run::new("first")
                .with_check(
                    Check::new("comments_only")
                        .with_kind(ItemKind::Comment)
                        .with_rule(rule("c", true)),
                )
                .with_check(
                    Check::new("halt")
                        .with_rule(rule("h", true))
                        .with_post_trigger(PostBehavior::Stop),
                ),
            Run::new("never").with_check(Check::new("n").with_rule(rule("n", true))),
        ];
        let result = h
            .evaluator(runs)
            .evaluate(&item(), EvaluationContext::new(Provenance::User))
            .await
            .into_result()
            .unwrap();
        assert_eq!(result.runs.len(), 1);
        assert_eq!(result.runs[0].checks.len(), 1);
        assert_eq!(result.runs[0].checks[0].name, "halt");
    }

    #[tokio::test]
    async fn test_dry_run_records_without_performing() {
        let h = Harness::new();
        let runs = vec![Run::new("r").with_check(
            Check::new("c")
                .with_rule(rule("x", true))
                .with_action(Action::Api(ActionRequest::new("ban", json!({})))),
        )];
        let mut ctx = EvaluationContext::new(Provenance::User);
        ctx.dry_run = Some(true);
        let result = h
            .evaluator(runs)
            .evaluate(&item(), ctx)
            .await
            .into_result()
            .unwrap();
        assert!(result.dry_run);
        assert_eq!(result.runs[0].checks[0].actions.len(), 1);
        assert!(result.runs[0].checks[0].actions[0].dry_run);
        assert!(h.client.actions().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_action_adds_delayed_entry() {
        let h = Harness::new();
        let runs = vec![Run::new("r").with_check(
            Check::new("c")
                .with_rule(rule("x", true))
                .with_action(Action::Dispatch(DispatchAction {
                    delay: Duration::from_secs(60),
                    identifier: Some("recheck".to_string()),
                    cancel_if_queued: CancelPolicy::Always,
                    tardy_tolerance: TardyTolerance::Always,
                    start_at: Some(GotoTarget::run("r")),
                })),
        )];
        h.evaluator(runs)
            .evaluate(&item(), EvaluationContext::new(Provenance::User))
            .await
            .into_result()
            .unwrap();

        let entries = h.delayed.list();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source, "r.c");
        assert_eq!(entries[0].identifier.as_deref(), Some("recheck"));
    }

    #[tokio::test]
    async fn test_start_at_and_rule_error() {
        let h = Harness::new();
        let runs = vec![
            Run::new("first").with_check(
                Check::new("broken").with_rule(Rule::new("flag", json!({ "fail": true }))),
            ),
            Run::new("second")
                .with_check(Check::new("skip").with_rule(rule("skip", true)))
                .with_check(Check::new("target").with_rule(rule("target", false))),
        ];
        let evaluator = h.evaluator(runs);

        let mut ctx = EvaluationContext::new(Provenance::dispatch(None));
        ctx.start_at = Some(GotoTarget::check("second", "target"));
        let result = evaluator.evaluate(&item(), ctx).await.into_result().unwrap();
        assert_eq!(result.runs.len(), 1);
        assert_eq!(result.runs[0].checks[0].name, "target");

        let evaluation = evaluator
            .evaluate(&item(), EvaluationContext::new(Provenance::User))
            .await;
        assert!(matches!(evaluation.error, Some(EvaluationError::Rule { .. })));
    }

    #[tokio::test]
    async fn test_failed_action_is_recorded() {
        let h = Harness::new();
        h.client
            .fail_actions_with(platform_api::ApiError::Forbidden("not a mod".into()));
        let runs = vec![Run::new("r").with_check(
            Check::new("c")
                .with_rule(rule("x", true))
                .with_action(Action::Api(ActionRequest::new("remove", json!({})))),
        )];
        let result = h
            .evaluator(runs)
            .evaluate(&item(), EvaluationContext::new(Provenance::User))
            .await
            .into_result()
            .unwrap();
        let action = &result.runs[0].checks[0].actions[0];
        assert!(!action.success);
        assert!(action.error.is_some());
        assert_eq!(result.actions_executed(), 0);
    }
}
