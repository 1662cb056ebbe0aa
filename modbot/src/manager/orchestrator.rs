//! Per-community coordinator.
//!
//! A [`Manager`] owns everything one community needs: its pollers, the
//! firehose/queue pair, the delayed dispatch store, the evaluator built from
//! the loaded configuration, and the {manager, events, queue} running
//! states. Control operations are serialized; status reads are lock-free
//! snapshots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use platform_api::{ApiClient, Item};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::stats::{ManagerStats, STATS_SAMPLE_INTERVAL};
use super::status::{ManagerStatus, SourceStatus};
use crate::config::{ConfigSource, GlobalDefaults, ResolvedConfig, content_hash};
use crate::domain::{
    CausedBy, Facet, Provenance, QueuedWork, RunState, RunningStates, StateEntry, Transition,
    WorkOptions,
};
use crate::nanny::ManagedCommunity;
use crate::notification::{NotificationEvent, NotificationHub};
use crate::poller::{PollerEvent, RetryHandler, StreamPoller};
use crate::queue::{
    DedupFirehose, DelayedDispatchStore, DelayedEntry, InFlightRegistry, PushOutcome, WorkHandler,
    WorkerQueue, WorkerQueueConfig,
};
use crate::rules::{Evaluation, EvaluationContext, EvaluationError, RuleEngine, RunEvaluator, RunResult};
use crate::sink::ResultSink;
use crate::{Error, Result};

/// Default poller event channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

const SERIOUS_SIGNAL_CAPACITY: usize = 32;

const CONFIG_CHANGED: &str = "configuration changed";

/// Dispatch identifier of entries deferred by a source's age floor.
pub const DELAY_UNTIL_IDENTIFIER: &str = "delay_until";

/// Collaborators shared by every manager.
#[derive(Clone)]
pub struct ManagerContext {
    pub client: Arc<dyn ApiClient>,
    pub engine: Arc<dyn RuleEngine>,
    pub sink: Arc<dyn ResultSink>,
    pub hub: Arc<NotificationHub>,
    pub config_source: Arc<dyn ConfigSource>,
    pub global: Arc<GlobalDefaults>,
}

/// Everything derived from one loaded configuration.
struct Pipeline {
    config: Arc<ResolvedConfig>,
    evaluator: Arc<RunEvaluator>,
    registry: Arc<InFlightRegistry>,
    queue: Arc<WorkerQueue>,
    firehose: Arc<DedupFirehose>,
    retry: Arc<RetryHandler>,
}

struct SeriousFailure {
    item_id: String,
    error: EvaluationError,
}

pub struct Manager {
    name: String,
    ctx: ManagerContext,
    weak_self: Weak<Manager>,
    delayed: Arc<DelayedDispatchStore>,
    pipeline: RwLock<Option<Arc<Pipeline>>>,
    pollers: Mutex<Vec<Arc<StreamPoller>>>,
    states: Mutex<RunningStates>,
    valid_config: AtomicBool,
    item_delay: Mutex<Option<Duration>>,
    stats: ManagerStats,
    poller_tx: mpsc::Sender<PollerEvent>,
    serious_tx: mpsc::Sender<SeriousFailure>,
    sweep_token: Mutex<Option<CancellationToken>>,
    control: tokio::sync::Mutex<()>,
    cancellation_token: CancellationToken,
}

impl Manager {
    /// Create a manager and spawn its supervisor. No configuration is
    /// loaded until [`Manager::reload`] or [`Manager::start`].
    pub fn new(
        name: impl Into<String>,
        ctx: ManagerContext,
        parent_token: &CancellationToken,
    ) -> Arc<Self> {
        let (poller_tx, poller_rx) = mpsc::channel(DEFAULT_EVENT_CAPACITY);
        let (serious_tx, serious_rx) = mpsc::channel(SERIOUS_SIGNAL_CAPACITY);

        let manager = Arc::new_cyclic(|weak_self| Self {
            name: name.into(),
            ctx,
            weak_self: weak_self.clone(),
            delayed: Arc::new(DelayedDispatchStore::new()),
            pipeline: RwLock::new(None),
            pollers: Mutex::new(Vec::new()),
            states: Mutex::new(RunningStates::stopped()),
            valid_config: AtomicBool::new(false),
            item_delay: Mutex::new(None),
            stats: ManagerStats::new(),
            poller_tx,
            serious_tx,
            sweep_token: Mutex::new(None),
            control: tokio::sync::Mutex::new(()),
            cancellation_token: parent_token.child_token(),
        });
        manager.spawn_supervisor(poller_rx, serious_rx);
        manager
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn states(&self) -> RunningStates {
        *self.states.lock()
    }

    pub fn has_valid_config(&self) -> bool {
        self.valid_config.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> Option<Arc<ResolvedConfig>> {
        self.current_pipeline().map(|p| p.config.clone())
    }

    pub fn delayed(&self) -> &Arc<DelayedDispatchStore> {
        &self.delayed
    }

    pub fn stats(&self) -> &ManagerStats {
        &self.stats
    }

    fn current_pipeline(&self) -> Option<Arc<Pipeline>> {
        self.pipeline.read().clone()
    }

    fn require_pipeline(&self) -> Result<Arc<Pipeline>> {
        if !self.has_valid_config() {
            return Err(Error::config(format!(
                "{} has no valid configuration loaded",
                self.name
            )));
        }
        self.current_pipeline()
            .ok_or_else(|| Error::config(format!("{} has no configuration loaded", self.name)))
    }

    fn state_of(&self, facet: Facet) -> StateEntry {
        *self.states.lock().get(facet)
    }

    fn set_state(
        &self,
        facet: Facet,
        state: RunState,
        caused_by: CausedBy,
        reason: Option<&str>,
    ) -> Transition {
        let transition = self
            .states
            .lock()
            .get_mut(facet)
            .transition(state, caused_by);
        if transition.should_notify() {
            info!(
                community = %self.name,
                facet = %facet,
                state = %state,
                caused_by = %caused_by,
                reason = reason.unwrap_or_default(),
                "Running state changed"
            );
            self.ctx.hub.publish(NotificationEvent::state_changed(
                &self.name, facet, state, caused_by, reason,
            ));
        }
        transition
    }

    // ---- supervisor ----

    fn spawn_supervisor(
        &self,
        mut poller_rx: mpsc::Receiver<PollerEvent>,
        mut serious_rx: mpsc::Receiver<SeriousFailure>,
    ) {
        let weak = self.weak_self.clone();
        let token = self.cancellation_token.clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            debug!(community = %name, "Supervisor started");
            let mut stats_tick = tokio::time::interval(STATS_SAMPLE_INTERVAL);
            stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    Some(event) = poller_rx.recv() => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.on_poller_event(event);
                    }
                    Some(failure) = serious_rx.recv() => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.halt(failure).await;
                    }
                    _ = stats_tick.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.stats.sample(Instant::now());
                    }
                }
            }
            debug!(community = %name, "Supervisor stopped");
        });
    }

    fn on_poller_event(&self, event: PollerEvent) {
        match event {
            PollerEvent::Item { source, item, .. } => self.admit_polled(&source, item),
            PollerEvent::Listing {
                source,
                new_items,
                pages,
                ..
            } => {
                self.stats.record_api_calls(pages as u64);
                if new_items > 0 {
                    debug!(community = %self.name, source = %source, new_items, "Poll found new items");
                }
            }
            PollerEvent::Error {
                source,
                error,
                fatal,
                ..
            } => {
                self.ctx.hub.publish(NotificationEvent::PollingError {
                    community: self.name.clone(),
                    source: source.clone(),
                    error: error.to_string(),
                    fatal,
                    timestamp: Utc::now(),
                });
                if fatal {
                    let any_running = self.pollers.lock().iter().any(|p| p.is_running());
                    if !any_running && self.state_of(Facet::Events).state == RunState::Running {
                        warn!(community = %self.name, "No polling source left running");
                        self.set_state(
                            Facet::Events,
                            RunState::Stopped,
                            CausedBy::System,
                            Some("all polling sources failed"),
                        );
                    }
                }
            }
        }
    }

    /// Route a freshly polled item into the firehose, or defer it when the
    /// source has an age floor the item has not reached yet.
    fn admit_polled(&self, source: &str, item: Item) {
        let Some(pipeline) = self.current_pipeline() else {
            debug!(community = %self.name, item_id = %item.id, "No pipeline, dropping polled item");
            return;
        };

        let floor = pipeline
            .config
            .sources
            .iter()
            .find(|s| s.name == source)
            .and_then(|s| s.delay_until);
        if let Some(floor) = floor {
            let age = item.age(Utc::now()).to_std().unwrap_or_default();
            if age < floor {
                let remaining = floor - age;
                debug!(
                    community = %self.name,
                    item_id = %item.id,
                    delay_secs = remaining.as_secs(),
                    "Item younger than age floor, deferring"
                );
                self.delayed.add(
                    DelayedEntry::new(item, remaining, format!("poll:{source}"))
                        .with_identifier(DELAY_UNTIL_IDENTIFIER),
                );
                return;
            }
        }

        pipeline
            .firehose
            .push(QueuedWork::new(item, Provenance::poll(source)));
    }

    async fn halt(&self, failure: SeriousFailure) {
        error!(
            community = %self.name,
            item_id = %failure.item_id,
            error = %failure.error,
            "Serious error, halting community"
        );
        if let Err(e) = self.stop(CausedBy::System).await {
            warn!(community = %self.name, error = %e, "Failed to stop after serious error");
        }
        self.ctx.hub.publish(NotificationEvent::SeriousError {
            community: self.name.clone(),
            item_id: failure.item_id,
            error: failure.error.to_string(),
            timestamp: Utc::now(),
        });
    }

    // ---- pipeline ----

    fn build_pipeline(&self, config: ResolvedConfig, previous: Option<&Pipeline>) -> Pipeline {
        let evaluator = RunEvaluator::new(
            config.runs.clone(),
            self.ctx.engine.clone(),
            self.ctx.client.clone(),
            self.delayed.clone(),
        )
        .with_max_goto_depth(config.max_goto_depth)
        .with_dry_run(config.dry_run);

        let (registry, queue, firehose) = match previous {
            Some(prev) if prev.config.queue_concurrency == config.queue_concurrency => (
                prev.registry.clone(),
                prev.queue.clone(),
                prev.firehose.clone(),
            ),
            _ => {
                let registry = Arc::new(InFlightRegistry::new());
                let queue = Arc::new(WorkerQueue::new(
                    self.name.clone(),
                    WorkerQueueConfig {
                        concurrency: config.queue_concurrency,
                        ..Default::default()
                    },
                    registry.clone(),
                ));
                let firehose = Arc::new(DedupFirehose::new(
                    registry.clone(),
                    queue.clone(),
                    self.delayed.clone(),
                ));
                (registry, queue, firehose)
            }
        };

        Pipeline {
            retry: Arc::new(RetryHandler::new(config.retry.clone())),
            config: Arc::new(config),
            evaluator: Arc::new(evaluator),
            registry,
            queue,
            firehose,
        }
    }

    fn launch_queue(&self, pipeline: &Pipeline) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        pipeline.queue.set_item_delay(*self.item_delay.lock());
        pipeline.queue.start(this);

        let token = self.cancellation_token.child_token();
        self.delayed
            .start_sweep(pipeline.firehose.clone(), token.clone());
        if let Some(previous) = self.sweep_token.lock().replace(token) {
            previous.cancel();
        }
    }

    async fn halt_queue(&self, pipeline: &Pipeline) {
        if let Some(token) = self.sweep_token.lock().take() {
            token.cancel();
        }
        let dropped = pipeline.queue.len();
        if dropped > 0 {
            info!(community = %self.name, dropped, "Dropping queued items");
        }
        pipeline.queue.stop().await;
    }

    fn launch_pollers(&self, pipeline: &Pipeline) {
        let mut pollers = self.pollers.lock();
        for poller in pollers.drain(..) {
            poller.stop("restarting");
        }
        for source in &pipeline.config.sources {
            let poller = Arc::new(StreamPoller::new(
                self.name.clone(),
                source.clone(),
                self.ctx.client.clone(),
                pipeline.retry.clone(),
                self.poller_tx.clone(),
            ));
            poller.start();
            pollers.push(poller);
        }
    }

    fn halt_pollers(&self, reason: &str) {
        for poller in self.pollers.lock().drain(..) {
            poller.stop(reason);
        }
    }

    // ---- queue control ----

    pub async fn start_queue(&self, caused_by: CausedBy) -> Result<()> {
        let _guard = self.control.lock().await;
        self.start_queue_inner(caused_by, None).await
    }

    pub async fn stop_queue(&self, caused_by: CausedBy) -> Result<()> {
        let _guard = self.control.lock().await;
        self.stop_queue_inner(caused_by, None).await
    }

    /// Pause dequeuing, then wait for in-flight items outside the control lock.
    pub async fn pause_queue(&self, caused_by: CausedBy) -> Result<()> {
        let draining = {
            let _guard = self.control.lock().await;
            self.pause_queue_inner(caused_by, None)?
        };
        if let Some(pipeline) = draining {
            pipeline.queue.wait_idle().await;
            debug!(community = %self.name, "Queue drained after pause");
        }
        Ok(())
    }

    pub async fn resume_queue(&self, caused_by: CausedBy) -> Result<()> {
        let _guard = self.control.lock().await;
        self.start_queue_inner(caused_by, None).await
    }

    async fn start_queue_inner(&self, caused_by: CausedBy, reason: Option<&str>) -> Result<()> {
        let pipeline = self.require_pipeline()?;
        match self.state_of(Facet::Queue).state {
            RunState::Running => {}
            RunState::Paused => pipeline.queue.resume(),
            RunState::Stopped => self.launch_queue(&pipeline),
        }
        self.set_state(Facet::Queue, RunState::Running, caused_by, reason);
        Ok(())
    }

    async fn stop_queue_inner(&self, caused_by: CausedBy, reason: Option<&str>) -> Result<()> {
        if self.state_of(Facet::Queue).state != RunState::Stopped
            && let Some(pipeline) = self.current_pipeline()
        {
            self.halt_queue(&pipeline).await;
        }
        self.set_state(Facet::Queue, RunState::Stopped, caused_by, reason);
        Ok(())
    }

    /// Returns the pipeline whose queue still has items in flight.
    fn pause_queue_inner(
        &self,
        caused_by: CausedBy,
        reason: Option<&str>,
    ) -> Result<Option<Arc<Pipeline>>> {
        let draining = match self.state_of(Facet::Queue).state {
            RunState::Stopped => {
                return Err(Error::InvalidStateTransition {
                    from: RunState::Stopped.to_string(),
                    to: RunState::Paused.to_string(),
                });
            }
            RunState::Running => self.current_pipeline().inspect(|p| p.queue.begin_pause()),
            RunState::Paused => None,
        };
        self.set_state(Facet::Queue, RunState::Paused, caused_by, reason);
        Ok(draining)
    }

    // ---- events control ----

    pub async fn start_events(&self, caused_by: CausedBy) -> Result<()> {
        let _guard = self.control.lock().await;
        self.start_events_inner(caused_by, None)
    }

    pub async fn stop_events(&self, caused_by: CausedBy) -> Result<()> {
        let _guard = self.control.lock().await;
        self.stop_events_inner(caused_by, None);
        Ok(())
    }

    pub async fn pause_events(&self, caused_by: CausedBy) -> Result<()> {
        let _guard = self.control.lock().await;
        self.pause_events_inner(caused_by, None)
    }

    pub async fn resume_events(&self, caused_by: CausedBy) -> Result<()> {
        let _guard = self.control.lock().await;
        self.start_events_inner(caused_by, None)
    }

    fn start_events_inner(&self, caused_by: CausedBy, reason: Option<&str>) -> Result<()> {
        let pipeline = self.require_pipeline()?;
        if !pipeline.config.has_sources() {
            return Err(Error::config(format!(
                "{} has no polling sources configured",
                self.name
            )));
        }
        if self.state_of(Facet::Events).state != RunState::Running {
            self.launch_pollers(&pipeline);
        }
        self.set_state(Facet::Events, RunState::Running, caused_by, reason);
        Ok(())
    }

    fn stop_events_inner(&self, caused_by: CausedBy, reason: Option<&str>) {
        self.halt_pollers(reason.unwrap_or("events stopped"));
        self.set_state(Facet::Events, RunState::Stopped, caused_by, reason);
    }

    fn pause_events_inner(&self, caused_by: CausedBy, reason: Option<&str>) -> Result<()> {
        match self.state_of(Facet::Events).state {
            RunState::Stopped => {
                return Err(Error::InvalidStateTransition {
                    from: RunState::Stopped.to_string(),
                    to: RunState::Paused.to_string(),
                });
            }
            RunState::Running => self.halt_pollers(reason.unwrap_or("events paused")),
            RunState::Paused => {}
        }
        self.set_state(Facet::Events, RunState::Paused, caused_by, reason);
        Ok(())
    }

    // ---- whole-manager control ----

    /// Load configuration if needed, then start the queue and (when sources
    /// are configured) event polling.
    pub async fn start(&self, caused_by: CausedBy) -> Result<()> {
        let _guard = self.control.lock().await;
        if self.current_pipeline().is_none() || !self.has_valid_config() {
            self.reload_inner(caused_by, false).await?;
        }

        self.start_queue_inner(caused_by, None).await?;
        match self.start_events_inner(caused_by, None) {
            Ok(()) => {}
            Err(Error::Configuration(msg)) => {
                warn!(community = %self.name, "Events not started: {}", msg);
            }
            Err(e) => return Err(e),
        }
        self.set_state(Facet::Manager, RunState::Running, caused_by, None);
        Ok(())
    }

    pub async fn stop(&self, caused_by: CausedBy) -> Result<()> {
        let _guard = self.control.lock().await;
        self.stop_events_inner(caused_by, None);
        self.stop_queue_inner(caused_by, None).await?;
        self.set_state(Facet::Manager, RunState::Stopped, caused_by, None);
        Ok(())
    }

    /// Stop everything and end the supervisor.
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop(CausedBy::System).await {
            warn!(community = %self.name, error = %e, "Error while shutting down");
        }
        self.delayed.clear();
        self.cancellation_token.cancel();
    }

    // ---- configuration ----

    /// Re-fetch and apply the configuration. Returns whether it changed.
    pub async fn reload(&self, caused_by: CausedBy, force: bool) -> Result<bool> {
        let _guard = self.control.lock().await;
        self.reload_inner(caused_by, force).await
    }

    async fn reload_inner(&self, caused_by: CausedBy, force: bool) -> Result<bool> {
        let raw = self.ctx.config_source.fetch(&self.name).await?;
        let hash = content_hash(&raw);
        let current = self.current_pipeline();

        if !force
            && self.has_valid_config()
            && current.as_ref().is_some_and(|p| p.config.hash == hash)
        {
            debug!(community = %self.name, "Configuration unchanged");
            return Ok(false);
        }

        let config = match ResolvedConfig::from_raw(&self.ctx.global, &self.name, &raw) {
            Ok(config) => config,
            Err(e) => {
                self.valid_config.store(false, Ordering::SeqCst);
                warn!(community = %self.name, error = %e, "Configuration invalid");
                self.ctx.hub.publish(NotificationEvent::ConfigInvalid {
                    community: self.name.clone(),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                return Err(e);
            }
        };

        let changed = current.as_ref().is_none_or(|p| p.config.hash != config.hash);
        let pipeline = Arc::new(self.build_pipeline(config, current.as_deref()));
        let states = self.states();

        let queue_replaced = current
            .as_ref()
            .is_some_and(|p| !Arc::ptr_eq(&p.queue, &pipeline.queue));
        let sources_changed = current
            .as_ref()
            .is_none_or(|p| p.config.sources != pipeline.config.sources);

        let restart_queue =
            changed && current.is_some() && states.queue.state == RunState::Running;
        let rebuild_events =
            states.events.state == RunState::Running && (changed || sources_changed);

        if let Some(previous) = &current
            && states.queue.state != RunState::Stopped
            && (queue_replaced || restart_queue)
        {
            self.halt_queue(previous).await;
        }

        *self.pipeline.write() = Some(pipeline.clone());
        self.valid_config.store(true, Ordering::SeqCst);

        match states.queue.state {
            RunState::Running if restart_queue => {
                self.set_state(Facet::Queue, RunState::Stopped, caused_by, Some(CONFIG_CHANGED));
                self.launch_queue(&pipeline);
                self.set_state(Facet::Queue, RunState::Running, caused_by, Some(CONFIG_CHANGED));
            }
            RunState::Running if current.is_none() => self.launch_queue(&pipeline),
            RunState::Paused if queue_replaced || current.is_none() => {
                self.launch_queue(&pipeline);
                pipeline.queue.begin_pause();
            }
            _ => {}
        }

        if rebuild_events {
            if pipeline.config.has_sources() {
                self.stop_events_inner(caused_by, Some(CONFIG_CHANGED));
                if let Err(e) = self.start_events_inner(caused_by, Some(CONFIG_CHANGED)) {
                    warn!(community = %self.name, error = %e, "Events not restarted after reload");
                }
            } else {
                self.stop_events_inner(CausedBy::System, Some("no polling sources configured"));
            }
        }

        info!(
            community = %self.name,
            changed,
            runs = pipeline.config.run_count(),
            sources = pipeline.config.sources.len(),
            "Configuration loaded"
        );
        self.ctx.hub.publish(NotificationEvent::ConfigReloaded {
            community: self.name.clone(),
            changed,
            caused_by,
            timestamp: Utc::now(),
        });
        Ok(changed)
    }

    // ---- manual injection and status ----

    /// Inject one item, bypassing polling.
    pub fn run_now(&self, item: Item, dry_run: Option<bool>) -> Result<PushOutcome> {
        let pipeline = self.require_pipeline()?;
        info!(community = %self.name, item_id = %item.id, ?dry_run, "Manual run requested");
        let work = QueuedWork::new(item, Provenance::User).with_options(WorkOptions {
            force: true,
            dry_run,
            ..Default::default()
        });
        Ok(pipeline.firehose.push(work))
    }

    pub fn status(&self) -> ManagerStatus {
        let pipeline = self.current_pipeline();
        let pollers = self.pollers.lock().clone();
        let sources = pipeline
            .as_ref()
            .map(|p| {
                p.config
                    .sources
                    .iter()
                    .map(|source| SourceStatus {
                        name: source.name.clone(),
                        description: source.describe(),
                        running: pollers
                            .iter()
                            .any(|poller| poller.source().name == source.name && poller.is_running()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        ManagerStatus {
            community: self.name.clone(),
            states: self.states(),
            valid_config: self.has_valid_config(),
            config_hash: pipeline.as_ref().map(|p| p.config.hash.clone()),
            queue_len: pipeline.as_ref().map_or(0, |p| p.queue.len()),
            running: pipeline.as_ref().map_or(0, |p| p.queue.running()),
            concurrency: pipeline.as_ref().map_or(0, |p| p.queue.concurrency()),
            delayed: self.delayed.len(),
            sources,
            item_delay_ms: self.item_delay.lock().map(|d| d.as_millis() as u64),
            stats: self.stats.snapshot(),
        }
    }

    fn finish(&self, result: RunResult) {
        self.stats.record_result(&result);
        let sink = self.ctx.sink.clone();
        let community = self.name.clone();
        tokio::spawn(async move {
            let item_id = result.item_id.clone();
            if let Err(e) = sink.save(result).await {
                warn!(community = %community, item_id = %item_id, error = %e, "Failed to save run result");
            }
        });
    }
}

#[async_trait]
impl WorkHandler for Manager {
    async fn handle(&self, work: QueuedWork, should_refresh: bool) -> Result<()> {
        let pipeline = self.require_pipeline()?;
        let QueuedWork {
            item,
            options,
            provenance,
        } = work;

        let item = if should_refresh {
            self.stats.record_api_calls(1);
            match self.ctx.client.refresh_item(&item).await {
                Ok(fresh) => fresh,
                Err(e) => {
                    let error = EvaluationError::Refresh(e);
                    warn!(community = %self.name, item_id = %item.id, error = %error, "Refresh failed");
                    self.finish(RunResult::failed(&item, provenance, &error));
                    return Ok(());
                }
            }
        } else {
            item
        };

        if item.removed && !options.force {
            debug!(community = %self.name, item_id = %item.id, "Item already removed, skipping");
            return Ok(());
        }

        let ctx = EvaluationContext {
            provenance,
            dry_run: options.dry_run,
            start_at: options.start_at,
        };
        let Evaluation { result, error } = pipeline.evaluator.evaluate(&item, ctx).await;
        self.finish(result);

        match error {
            None => Ok(()),
            Some(error) if error.is_serious() => {
                if self
                    .serious_tx
                    .try_send(SeriousFailure {
                        item_id: item.id.clone(),
                        error: error.clone(),
                    })
                    .is_err()
                {
                    warn!(community = %self.name, "Halt already pending");
                }
                Err(error.into())
            }
            Some(error) => {
                warn!(community = %self.name, item_id = %item.id, error = %error, "Evaluation failed");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ManagedCommunity for Manager {
    fn name(&self) -> &str {
        &self.name
    }

    fn events_state(&self) -> StateEntry {
        self.state_of(Facet::Events)
    }

    async fn pause_events(&self, caused_by: CausedBy, reason: &str) {
        let _guard = self.control.lock().await;
        if let Err(e) = self.pause_events_inner(caused_by, Some(reason)) {
            warn!(community = %self.name, error = %e, "Could not pause events");
        }
    }

    async fn resume_events(&self, caused_by: CausedBy, reason: &str) {
        let _guard = self.control.lock().await;
        if let Err(e) = self.start_events_inner(caused_by, Some(reason)) {
            warn!(community = %self.name, error = %e, "Could not resume events");
        }
    }

    fn set_item_delay(&self, delay: Option<Duration>) {
        *self.item_delay.lock() = delay;
        if let Some(pipeline) = self.current_pipeline() {
            pipeline.queue.set_item_delay(delay);
        }
    }

    fn consumption_rate(&self) -> f64 {
        self.stats.events_rate() + self.stats.rules_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigSource;
    use crate::rules::{Rule, RuleOutcome};
    use platform_api::testing::MockClient;
    use platform_api::{ItemKind, Listing, SourceKind};
    use serde_json::json;
    use tokio::sync::broadcast;

    /// Triggers rules with `"trigger": true`, fails seriously on `"serious": true`
    /// and never finishes on `"block": true`.
    struct FlagEngine;

    #[async_trait]
    impl RuleEngine for FlagEngine {
        async fn run_rule(
            &self,
            rule: &Rule,
            _item: &Item,
        ) -> std::result::Result<RuleOutcome, EvaluationError> {
            if rule.config.get("serious") == Some(&json!(true)) {
                return Err(EvaluationError::serious("engine lost its backing store"));
            }
            if rule.config.get("block") == Some(&json!(true)) {
                std::future::pending::<()>().await;
            }
            Ok(RuleOutcome {
                triggered: rule.config.get("trigger") == Some(&json!(true)),
                detail: None,
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        results: Mutex<Vec<RunResult>>,
    }

    #[async_trait]
    impl ResultSink for RecordingSink {
        async fn save(&self, result: RunResult) -> Result<()> {
            self.results.lock().push(result);
            Ok(())
        }
    }

    struct Harness {
        client: Arc<MockClient>,
        sink: Arc<RecordingSink>,
        source: Arc<MemoryConfigSource>,
        hub: Arc<NotificationHub>,
        token: CancellationToken,
    }

    impl Harness {
        fn new(raw: &str) -> Self {
            Self {
                client: Arc::new(MockClient::new()),
                sink: Arc::new(RecordingSink::default()),
                source: Arc::new(MemoryConfigSource::new().with_document("rust", raw)),
                hub: Arc::new(NotificationHub::new()),
                token: CancellationToken::new(),
            }
        }

        fn manager(&self) -> Arc<Manager> {
            let ctx = ManagerContext {
                client: self.client.clone(),
                engine: Arc::new(FlagEngine),
                sink: self.sink.clone(),
                hub: self.hub.clone(),
                config_source: self.source.clone(),
                global: Arc::new(GlobalDefaults::default()),
            };
            Manager::new("rust", ctx, &self.token)
        }

        fn saved(&self) -> Vec<RunResult> {
            self.sink.results.lock().clone()
        }
    }

    fn removal_doc(rule_config: serde_json::Value) -> String {
        json!({
            "polling": [{"kind": "modqueue", "interval": 1}],
            "runs": [{
                "name": "spam",
                "checks": [{
                    "name": "links",
                    "rules": [{"kind": "flag", "config": rule_config}],
                    "actions": [{"kind": "remove"}]
                }]
            }]
        })
        .to_string()
    }

    fn item(id: &str) -> Item {
        Item::new(id, ItemKind::Submission, "rust", "alice", Utc::now()).with_reports(1)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    fn drain(rx: &mut broadcast::Receiver<NotificationEvent>) -> Vec<NotificationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn queue_changes(events: &[NotificationEvent]) -> Vec<(RunState, Option<String>)> {
        events
            .iter()
            .filter_map(|e| match e {
                NotificationEvent::RunStateChanged {
                    facet: Facet::Queue,
                    state,
                    reason,
                    ..
                } => Some((*state, reason.clone())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_refuses_start() {
        let h = Harness::new("{ not json");
        let mut rx = h.hub.subscribe();
        let manager = h.manager();

        assert!(manager.start(CausedBy::User).await.is_err());
        assert!(!manager.has_valid_config());
        assert!(matches!(
            manager.start_queue(CausedBy::User).await,
            Err(Error::Configuration(_))
        ));
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(e, NotificationEvent::ConfigInvalid { .. }))
        );

        h.source.set("rust", removal_doc(json!({"trigger": true})));
        assert!(manager.reload(CausedBy::User, false).await.unwrap());
        manager.start(CausedBy::User).await.unwrap();
        assert_eq!(manager.states().manager.state, RunState::Running);
        assert_eq!(manager.states().queue.state, RunState::Running);
        assert_eq!(manager.states().events.state, RunState::Running);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_now_evaluates_and_persists() {
        let h = Harness::new(&removal_doc(json!({"trigger": true})));
        let manager = h.manager();
        manager.reload(CausedBy::User, false).await.unwrap();
        manager.start_queue(CausedBy::User).await.unwrap();

        let outcome = manager.run_now(item("t3_a"), None).unwrap();
        assert!(outcome.forwarded());
        wait_until(|| h.saved().len() == 1).await;

        let result = &h.saved()[0];
        assert_eq!(result.provenance, Provenance::User);
        assert_eq!(result.actions_executed(), 1);
        assert_eq!(h.client.actions()[0].1.kind, "remove");
        // queued from run_now, so no refresh
        assert!(h.client.refreshed().is_empty());
        assert_eq!(manager.status().stats.items_processed, 1);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_now_dry_run_skips_actions() {
        let h = Harness::new(&removal_doc(json!({"trigger": true})));
        let manager = h.manager();
        manager.reload(CausedBy::User, false).await.unwrap();
        manager.start_queue(CausedBy::User).await.unwrap();

        manager.run_now(item("t3_a"), Some(true)).unwrap();
        wait_until(|| h.saved().len() == 1).await;

        assert!(h.saved()[0].dry_run);
        assert!(h.client.actions().is_empty());
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_polled_items_skip_first_tick() {
        let h = Harness::new(&removal_doc(json!({"trigger": false})));
        let first = Listing::new(vec![item("t3_old")], None);
        let later = Listing::new(vec![item("t3_new"), item("t3_old")], None);
        h.client.push_page("rust", SourceKind::ModQueue, first);
        h.client.set_steady_page("rust", SourceKind::ModQueue, later);

        let manager = h.manager();
        manager.start(CausedBy::User).await.unwrap();
        wait_until(|| !h.saved().is_empty()).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let saved = h.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].item_id, "t3_new");
        assert_eq!(saved[0].provenance, Provenance::poll("modqueue"));
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_serious_error_halts_community() {
        let h = Harness::new(&removal_doc(json!({"serious": true})));
        let mut rx = h.hub.subscribe();
        let manager = h.manager();
        manager.start(CausedBy::User).await.unwrap();

        manager.run_now(item("t3_a"), None).unwrap();
        wait_until(|| manager.states().manager.state == RunState::Stopped).await;

        let states = manager.states();
        assert_eq!(states.manager.caused_by, CausedBy::System);
        assert_eq!(states.queue.state, RunState::Stopped);
        assert_eq!(states.events.state, RunState::Stopped);
        wait_until(|| {
            drain(&mut rx)
                .iter()
                .any(|e| matches!(e, NotificationEvent::SeriousError { .. }))
        })
        .await;
        wait_until(|| !h.saved().is_empty()).await;
        assert!(h.saved()[0].is_failed());
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_is_idempotent_per_causer() {
        let h = Harness::new(&removal_doc(json!({"trigger": false})));
        let manager = h.manager();
        manager.start(CausedBy::User).await.unwrap();
        let mut rx = h.hub.subscribe();

        manager.pause_events(CausedBy::User).await.unwrap();
        manager.pause_events(CausedBy::User).await.unwrap();
        let changes = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, NotificationEvent::RunStateChanged { .. }))
            .count();
        assert_eq!(changes, 1);

        ManagedCommunity::pause_events(manager.as_ref(), CausedBy::System, "budget").await;
        assert_eq!(manager.states().events.caused_by, CausedBy::System);
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            NotificationEvent::RunStateChanged { caused_by: CausedBy::System, .. }
        )));
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_from_stopped_is_rejected() {
        let h = Harness::new(&removal_doc(json!({"trigger": false})));
        let manager = h.manager();
        manager.reload(CausedBy::User, false).await.unwrap();

        assert!(matches!(
            manager.pause_queue(CausedBy::User).await,
            Err(Error::InvalidStateTransition { .. })
        ));
        // resuming a stopped queue starts it
        manager.resume_queue(CausedBy::User).await.unwrap();
        assert_eq!(manager.states().queue.state, RunState::Running);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_detects_changes() {
        let h = Harness::new(&removal_doc(json!({"trigger": false})));
        let manager = h.manager();
        assert!(manager.reload(CausedBy::User, false).await.unwrap());
        assert!(!manager.reload(CausedBy::User, false).await.unwrap());

        let first_hash = manager.config().unwrap().hash.clone();
        h.source.set("rust", removal_doc(json!({"trigger": true})));
        assert!(manager.reload(CausedBy::User, false).await.unwrap());
        assert_ne!(manager.config().unwrap().hash, first_hash);

        // a broken document keeps the previous pipeline loaded
        h.source.set("rust", "{ broken");
        assert!(manager.reload(CausedBy::User, false).await.is_err());
        assert!(!manager.has_valid_config());
        assert!(manager.config().is_some());
        assert!(manager.run_now(item("t3_a"), None).is_err());
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_age_floor_defers_young_items() {
        let raw = json!({
            "polling": [{"kind": "modqueue", "interval": 1, "delayUntil": 600}],
            "runs": []
        })
        .to_string();
        let h = Harness::new(&raw);
        h.client
            .push_page("rust", SourceKind::ModQueue, Listing::empty());
        h.client.set_steady_page(
            "rust",
            SourceKind::ModQueue,
            Listing::new(vec![item("t3_young")], None),
        );

        let manager = h.manager();
        manager.start(CausedBy::User).await.unwrap();
        wait_until(|| manager.delayed().len() == 1).await;

        let entry = &manager.delayed().list()[0];
        assert_eq!(entry.item.id, "t3_young");
        assert_eq!(entry.identifier.as_deref(), Some(DELAY_UNTIL_IDENTIFIER));
        assert!(h.saved().is_empty());
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_poll_errors_stop_events() {
        let h = Harness::new(&removal_doc(json!({"trigger": false})));
        h.client.push_page("rust", SourceKind::ModQueue, Listing::empty());
        h.client.push_error(
            "rust",
            SourceKind::ModQueue,
            platform_api::ApiError::Forbidden("token revoked".to_string()),
        );
        let manager = h.manager();
        manager.start(CausedBy::User).await.unwrap();

        wait_until(|| manager.states().events.state == RunState::Stopped).await;
        assert_eq!(manager.states().events.caused_by, CausedBy::System);
        assert_eq!(manager.states().queue.state, RunState::Running);
        assert!(manager.status().sources.iter().all(|s| !s.running));
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_with_changes_restarts_running_queue() {
        let h = Harness::new(&removal_doc(json!({"trigger": false})));
        let manager = h.manager();
        manager.start(CausedBy::User).await.unwrap();
        let mut rx = h.hub.subscribe();

        h.source.set("rust", removal_doc(json!({"trigger": true})));
        assert!(manager.reload(CausedBy::User, false).await.unwrap());

        let reason = Some(CONFIG_CHANGED.to_string());
        assert_eq!(
            queue_changes(&drain(&mut rx)),
            vec![
                (RunState::Stopped, reason.clone()),
                (RunState::Running, reason)
            ]
        );
        assert_eq!(manager.states().queue.state, RunState::Running);
        assert_eq!(manager.states().events.state, RunState::Running);

        manager.run_now(item("t3_a"), None).unwrap();
        wait_until(|| h.saved().len() == 1).await;
        assert_eq!(h.client.actions().len(), 1);

        // an identical forced reload leaves the queue alone
        assert!(!manager.reload(CausedBy::User, true).await.unwrap());
        assert!(queue_changes(&drain(&mut rx)).is_empty());
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_keeps_stopped_queue_stopped() {
        let h = Harness::new(&removal_doc(json!({"trigger": false})));
        let manager = h.manager();
        manager.reload(CausedBy::User, false).await.unwrap();
        let mut rx = h.hub.subscribe();

        h.source.set("rust", removal_doc(json!({"trigger": true})));
        assert!(manager.reload(CausedBy::User, false).await.unwrap());
        assert!(queue_changes(&drain(&mut rx)).is_empty());
        assert_eq!(manager.states().queue.state, RunState::Stopped);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_draining_pause_does_not_block_event_control() {
        let h = Harness::new(&removal_doc(json!({"block": true})));
        let manager = h.manager();
        manager.start(CausedBy::User).await.unwrap();
        manager.run_now(item("t3_stuck"), None).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let pausing = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.pause_queue(CausedBy::User).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pausing.is_finished());
        assert_eq!(manager.states().queue.state, RunState::Paused);

        let paused = tokio::time::timeout(
            Duration::from_secs(1),
            ManagedCommunity::pause_events(manager.as_ref(), CausedBy::System, "budget"),
        )
        .await;
        assert!(paused.is_ok());
        assert_eq!(manager.states().events.state, RunState::Paused);

        pausing.abort();
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_listing_counts_every_fetched_page() {
        let h = Harness::new(&removal_doc(json!({"trigger": false})));
        let manager = h.manager();

        manager.on_poller_event(PollerEvent::Listing {
            community: "rust".to_string(),
            source: "submissions".to_string(),
            new_items: 4,
            pages: 3,
        });
        manager.on_poller_event(PollerEvent::Listing {
            community: "rust".to_string(),
            source: "submissions".to_string(),
            new_items: 0,
            pages: 1,
        });
        assert_eq!(manager.status().stats.api_calls, 4);
        manager.shutdown().await;
    }
}
