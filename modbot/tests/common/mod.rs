//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use modbot::config::{GlobalDefaults, MemoryConfigSource};
use modbot::manager::{Manager, ManagerContext};
use modbot::notification::NotificationHub;
use modbot::rules::{EvaluationError, Rule, RuleEngine, RuleOutcome, RunResult};
use modbot::sink::ResultSink;
use parking_lot::Mutex;
use platform_api::testing::MockClient;
use platform_api::{Item, ItemKind};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Triggers rules configured with `"trigger": true` and counts invocations.
#[derive(Default)]
pub struct FlagEngine {
    pub calls: Mutex<usize>,
}

#[async_trait]
impl RuleEngine for FlagEngine {
    async fn run_rule(&self, rule: &Rule, _item: &Item) -> Result<RuleOutcome, EvaluationError> {
        *self.calls.lock() += 1;
        Ok(RuleOutcome {
            triggered: rule.config.get("trigger") == Some(&json!(true)),
            detail: None,
        })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    results: Mutex<Vec<RunResult>>,
}

impl RecordingSink {
    pub fn results(&self) -> Vec<RunResult> {
        self.results.lock().clone()
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn save(&self, result: RunResult) -> modbot::Result<()> {
        self.results.lock().push(result);
        Ok(())
    }
}

/// One community wired to in-memory collaborators.
pub struct Fixture {
    pub client: Arc<MockClient>,
    pub engine: Arc<FlagEngine>,
    pub sink: Arc<RecordingSink>,
    pub source: Arc<MemoryConfigSource>,
    pub hub: Arc<NotificationHub>,
    pub token: CancellationToken,
}

impl Fixture {
    pub fn new(community: &str, raw: &str) -> Self {
        Self {
            client: Arc::new(MockClient::new()),
            engine: Arc::new(FlagEngine::default()),
            sink: Arc::new(RecordingSink::default()),
            source: Arc::new(MemoryConfigSource::new().with_document(community, raw)),
            hub: Arc::new(NotificationHub::new()),
            token: CancellationToken::new(),
        }
    }

    pub fn manager(&self, community: &str) -> Arc<Manager> {
        let ctx = ManagerContext {
            client: self.client.clone(),
            engine: self.engine.clone(),
            sink: self.sink.clone(),
            hub: self.hub.clone(),
            config_source: self.source.clone(),
            global: Arc::new(GlobalDefaults::default()),
        };
        Manager::new(community, ctx, &self.token)
    }
}

pub fn item(id: &str) -> Item {
    Item::new(id, ItemKind::Submission, "rust", "alice", Utc::now()).with_reports(1)
}

/// Poll until `condition` holds, advancing the (paused) clock in small steps.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}
