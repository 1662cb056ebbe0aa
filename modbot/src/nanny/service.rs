//! Admission control driven by the shared API budget.
//!
//! The nanny samples the client's remaining budget, derives a consumption
//! rate, and degrades managed communities in two steps: soft mode slows the
//! heaviest consumers down with a per-item delay, hard mode pauses event
//! polling everywhere. Hard mode is held until neither limit is breached.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use platform_api::ApiClient;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::budget::{BudgetSnapshot, RateBudgetTracker};
use crate::domain::{CausedBy, RunState, StateEntry};
use crate::notification::{NotificationEvent, NotificationHub};

const NANNY_REASON: &str = "API budget nanny";

/// Current degradation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NannyMode {
    #[default]
    None,
    Soft,
    Hard,
}

impl NannyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Soft => "soft",
            Self::Hard => "hard",
        }
    }
}

impl std::fmt::Display for NannyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Threshold for one degradation level.
///
/// Deserializes from a bare number (remaining budget) or from
/// `{"depletion_secs": N}` (estimated time until the budget runs out).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NannyLimit {
    Remaining(u32),
    Depletion {
        #[serde(rename = "depletion_secs", with = "duration_secs")]
        within: Duration,
    },
}

impl NannyLimit {
    pub fn depletion(within: Duration) -> Self {
        Self::Depletion { within }
    }

    pub fn is_breached(&self, remaining: u32, depletion: Option<Duration>) -> bool {
        match self {
            Self::Remaining(limit) => remaining <= *limit,
            Self::Depletion { within } => depletion.is_some_and(|d| d <= *within),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Configuration for the admission nanny.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NannyConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_hard_limit")]
    pub hard_limit: Option<NannyLimit>,
    #[serde(default = "default_soft_limit")]
    pub soft_limit: Option<NannyLimit>,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_decision_interval_ms")]
    pub decision_interval_ms: u64,
    /// Per-item delay applied to offenders in soft mode.
    #[serde(default = "default_soft_delay_ms")]
    pub soft_delay_ms: u64,
    /// Requests per second above which a community counts as an offender.
    #[serde(default = "default_offender_rate")]
    pub offender_rate: f64,
    #[serde(default = "default_fallback_offender_rate")]
    pub fallback_offender_rate: f64,
    /// Probe for a fresh reading when the reset is this close.
    #[serde(default = "default_reset_probe_window_ms")]
    pub reset_probe_window_ms: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_hard_limit() -> Option<NannyLimit> {
    Some(NannyLimit::Remaining(50))
}

fn default_soft_limit() -> Option<NannyLimit> {
    Some(NannyLimit::Remaining(250))
}

fn default_tick_interval_ms() -> u64 {
    5_000
}

fn default_decision_interval_ms() -> u64 {
    10_000
}

fn default_soft_delay_ms() -> u64 {
    1_500
}

fn default_offender_rate() -> f64 {
    0.5
}

fn default_fallback_offender_rate() -> f64 {
    0.25
}

fn default_reset_probe_window_ms() -> u64 {
    10_000
}

impl Default for NannyConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            hard_limit: default_hard_limit(),
            soft_limit: default_soft_limit(),
            tick_interval_ms: default_tick_interval_ms(),
            decision_interval_ms: default_decision_interval_ms(),
            soft_delay_ms: default_soft_delay_ms(),
            offender_rate: default_offender_rate(),
            fallback_offender_rate: default_fallback_offender_rate(),
            reset_probe_window_ms: default_reset_probe_window_ms(),
        }
    }
}

impl NannyConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn decision_interval(&self) -> Duration {
        Duration::from_millis(self.decision_interval_ms)
    }

    pub fn soft_delay(&self) -> Duration {
        Duration::from_millis(self.soft_delay_ms)
    }
}

/// The nanny's view of a community it can slow down or pause.
#[async_trait]
pub trait ManagedCommunity: Send + Sync {
    fn name(&self) -> &str;

    fn events_state(&self) -> StateEntry;

    async fn pause_events(&self, caused_by: CausedBy, reason: &str);

    async fn resume_events(&self, caused_by: CausedBy, reason: &str);

    fn set_item_delay(&self, delay: Option<Duration>);

    /// Events plus unique rules per second.
    fn consumption_rate(&self) -> f64;
}

/// Outcome of one decision.
#[derive(Debug, Clone, PartialEq)]
pub struct NannyDecision {
    pub mode: NannyMode,
    pub previous: NannyMode,
    pub budget: BudgetSnapshot,
}

impl NannyDecision {
    pub fn changed(&self) -> bool {
        self.mode != self.previous
    }
}

pub struct AdmissionNanny {
    config: NannyConfig,
    client: Arc<dyn ApiClient>,
    hub: Arc<NotificationHub>,
    communities: RwLock<Vec<Arc<dyn ManagedCommunity>>>,
    tracker: Mutex<RateBudgetTracker>,
    mode: Mutex<NannyMode>,
    /// Communities whose events the nanny paused itself.
    paused_by_nanny: Mutex<HashSet<String>>,
}

impl AdmissionNanny {
    pub fn new(config: NannyConfig, client: Arc<dyn ApiClient>, hub: Arc<NotificationHub>) -> Self {
        let tracker = RateBudgetTracker::new(config.decision_interval());
        Self {
            config,
            client,
            hub,
            communities: RwLock::new(Vec::new()),
            tracker: Mutex::new(tracker),
            mode: Mutex::new(NannyMode::None),
            paused_by_nanny: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &NannyConfig {
        &self.config
    }

    pub fn mode(&self) -> NannyMode {
        *self.mode.lock()
    }

    pub fn budget(&self) -> BudgetSnapshot {
        self.tracker.lock().snapshot()
    }

    pub fn register(&self, community: Arc<dyn ManagedCommunity>) {
        let mut communities = self.communities.write();
        communities.retain(|c| c.name() != community.name());
        communities.push(community);
    }

    pub fn unregister(&self, name: &str) {
        self.communities.write().retain(|c| c.name() != name);
        self.paused_by_nanny.lock().remove(name);
    }

    fn snapshot_communities(&self) -> Vec<Arc<dyn ManagedCommunity>> {
        self.communities.read().clone()
    }

    /// Take a budget reading and apply the resulting mode transition.
    /// Returns `None` when the client has no budget reading yet.
    pub async fn check_and_update(&self) -> Option<NannyDecision> {
        if !self.config.enabled {
            return None;
        }

        let remaining = self.read_budget().await?;
        let reset_at = self.client.ratelimit_expiration();

        let (budget, depletion) = {
            let mut tracker = self.tracker.lock();
            tracker.record(remaining, reset_at);
            (tracker.snapshot(), tracker.estimated_depletion())
        };

        let hard = self
            .config
            .hard_limit
            .is_some_and(|limit| limit.is_breached(remaining, depletion));
        let soft = self
            .config
            .soft_limit
            .is_some_and(|limit| limit.is_breached(remaining, depletion));

        let previous = self.mode();
        debug!(
            remaining,
            rate = budget.consumption_rate,
            depletion_secs = ?budget.estimated_depletion_secs,
            mode = %previous,
            "Nanny decision"
        );

        let next = match previous {
            _ if hard => NannyMode::Hard,
            NannyMode::Hard if soft => NannyMode::Hard,
            _ if soft => NannyMode::Soft,
            _ => NannyMode::None,
        };

        if next != previous {
            let affected = match next {
                NannyMode::Hard => self.enter_hard(previous).await,
                NannyMode::Soft => self.enter_soft(),
                NannyMode::None => self.recover().await,
            };
            *self.mode.lock() = next;
            self.hub.publish(NotificationEvent::NannyModeChanged {
                from: previous,
                to: next,
                remaining: budget.remaining,
                depletion_secs: budget.estimated_depletion_secs,
                communities: affected,
                timestamp: Utc::now(),
            });
        }

        Some(NannyDecision {
            mode: next,
            previous,
            budget,
        })
    }

    async fn read_budget(&self) -> Option<u32> {
        let window = chrono::Duration::milliseconds(self.config.reset_probe_window_ms as i64);
        let near_reset = self
            .client
            .ratelimit_expiration()
            .is_some_and(|reset| reset - Utc::now() <= window);

        if near_reset {
            debug!("Budget reset is close, probing for a fresh reading");
            if let Err(e) = self.client.probe().await {
                warn!(error = %e, "Budget probe failed");
            }
        }
        self.client.ratelimit_remaining()
    }

    async fn enter_hard(&self, previous: NannyMode) -> Vec<String> {
        let communities = self.snapshot_communities();
        if previous == NannyMode::Soft {
            for community in &communities {
                community.set_item_delay(None);
            }
        }

        let running: Vec<_> = communities
            .iter()
            .filter(|c| c.events_state().state == RunState::Running)
            .collect();
        join_all(
            running
                .iter()
                .map(|c| c.pause_events(CausedBy::System, NANNY_REASON)),
        )
        .await;
        let paused: Vec<String> = running.iter().map(|c| c.name().to_string()).collect();
        self.paused_by_nanny.lock().extend(paused.iter().cloned());

        warn!(communities = ?paused, "Hard limit reached, event polling paused");
        paused
    }

    fn enter_soft(&self) -> Vec<String> {
        let communities = self.snapshot_communities();
        let mut offenders = self.offenders(&communities, self.config.offender_rate);
        if offenders.is_empty() {
            offenders = self.offenders(&communities, self.config.fallback_offender_rate);
        }
        if offenders.is_empty() {
            offenders = communities;
        }

        let delay = self.config.soft_delay();
        for community in &offenders {
            community.set_item_delay(Some(delay));
        }

        let names: Vec<String> = offenders.iter().map(|c| c.name().to_string()).collect();
        warn!(communities = ?names, delay_ms = self.config.soft_delay_ms, "Soft limit reached, slowing down");
        names
    }

    fn offenders(
        &self,
        communities: &[Arc<dyn ManagedCommunity>],
        threshold: f64,
    ) -> Vec<Arc<dyn ManagedCommunity>> {
        communities
            .iter()
            .filter(|c| c.consumption_rate() > threshold)
            .cloned()
            .collect()
    }

    async fn recover(&self) -> Vec<String> {
        let communities = self.snapshot_communities();
        for community in &communities {
            community.set_item_delay(None);
        }

        let paused: HashSet<String> = std::mem::take(&mut *self.paused_by_nanny.lock());
        let mut resumed = Vec::new();
        for community in communities.iter().filter(|c| paused.contains(c.name())) {
            let state = community.events_state();
            // A user pause (or any later change) wins over the nanny's.
            if state.state == RunState::Paused && state.caused_by == CausedBy::System {
                community.resume_events(CausedBy::System, NANNY_REASON).await;
                resumed.push(community.name().to_string());
            }
        }

        info!(communities = ?resumed, "API budget recovered");
        resumed
    }

    /// Start the sampling loop.
    pub fn start_monitoring(self: Arc<Self>, cancellation_token: CancellationToken) {
        if !self.config.enabled {
            debug!("Admission nanny disabled, not starting monitoring");
            return;
        }

        let tick = self.config.tick_interval();
        let decision_every = self.config.decision_interval();

        tokio::spawn(async move {
            info!("Admission nanny monitoring started");
            let mut last_decision: Option<Instant> = None;

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("Admission nanny shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(tick) => {
                        let due = last_decision.is_none_or(|at| at.elapsed() >= decision_every);
                        if due {
                            last_decision = Some(Instant::now());
                            self.check_and_update().await;
                        }
                    }
                }
            }

            info!("Admission nanny monitoring stopped");
        });
    }
}
