//! Bounded-concurrency worker pool draining deduplicated work.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::in_flight::InFlightRegistry;
use crate::domain::QueuedWork;

/// Default number of concurrent workers.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// How long `stop` waits for in-flight work before aborting it.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Interval between progress logs while waiting for in-flight work.
pub const WAIT_LOG_INTERVAL: Duration = Duration::from_millis(1500);

/// Processes one dequeued item.
#[async_trait]
pub trait WorkHandler: Send + Sync + 'static {
    async fn handle(&self, work: QueuedWork, should_refresh: bool) -> crate::Result<()>;
}

#[derive(Debug, Clone)]
pub struct WorkerQueueConfig {
    pub concurrency: usize,
    pub stop_grace: Duration,
}

impl Default for WorkerQueueConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Releases an item's in-flight record when its worker finishes or is aborted.
struct ActiveGuard {
    queue: Arc<WorkerQueue>,
    item_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.queue.registry.complete(&self.item_id);
        if self.queue.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.queue.idle.notify_waiters();
        }
        // skipped copies of this item may be runnable now
        self.queue.work_available.notify_waiters();
    }
}

/// FIFO queue with N workers. At most one worker processes a given item id.
pub struct WorkerQueue {
    name: String,
    config: WorkerQueueConfig,
    pending: Mutex<VecDeque<QueuedWork>>,
    registry: Arc<InFlightRegistry>,
    work_available: Notify,
    idle: Notify,
    running: AtomicUsize,
    paused: AtomicBool,
    item_delay: Mutex<Option<Duration>>,
    cancellation_token: Mutex<CancellationToken>,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl WorkerQueue {
    pub fn new(
        name: impl Into<String>,
        config: WorkerQueueConfig,
        registry: Arc<InFlightRegistry>,
    ) -> Self {
        let name = name.into();
        if config.concurrency > 1 {
            warn!(
                community = %name,
                concurrency = config.concurrency,
                "Queue concurrency above 1; items are no longer processed in strict order"
            );
        }
        Self {
            name,
            config,
            pending: Mutex::new(VecDeque::new()),
            registry,
            work_available: Notify::new(),
            idle: Notify::new(),
            running: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            item_delay: Mutex::new(None),
            cancellation_token: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(None),
        }
    }

    /// Spawn the workers. Calling `start` while started is a no-op.
    pub fn start(self: &Arc<Self>, handler: Arc<dyn WorkHandler>) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *self.cancellation_token.lock() = token.clone();
        self.paused.store(false, Ordering::SeqCst);

        info!(
            community = %self.name,
            workers = self.config.concurrency,
            "Starting worker queue"
        );

        let mut join_set = JoinSet::new();
        for worker_id in 0..self.config.concurrency.max(1) {
            let queue = Arc::clone(self);
            let handler = Arc::clone(&handler);
            let token = token.clone();
            join_set.spawn(async move {
                queue.worker_loop(worker_id, handler, token).await;
            });
        }
        *tasks = Some(join_set);
        drop(tasks);

        self.work_available.notify_waiters();
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker_id: usize,
        handler: Arc<dyn WorkHandler>,
        token: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = self.next_work() => next,
            };
            let (work, should_refresh) = next;
            let guard = ActiveGuard {
                queue: Arc::clone(&self),
                item_id: work.item.id.clone(),
            };

            let delay = *self.item_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let item_id = work.item.id.clone();
            debug!(community = %self.name, worker_id, item_id = %item_id, "Processing item");
            if let Err(e) = handler.handle(work, should_refresh).await {
                warn!(community = %self.name, item_id = %item_id, error = %e, "Item processing failed");
            }
            drop(guard);
        }
        debug!(community = %self.name, worker_id, "Worker exited");
    }

    /// Wait for the next runnable item and mark it processing.
    async fn next_work(&self) -> (QueuedWork, bool) {
        loop {
            let notified = self.work_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(next) = self.try_take() {
                return next;
            }
            notified.await;
        }
    }

    fn try_take(&self) -> Option<(QueuedWork, bool)> {
        if self.paused.load(Ordering::SeqCst) {
            return None;
        }
        let mut pending = self.pending.lock();
        let mut taken = None;
        for (idx, work) in pending.iter().enumerate() {
            if let Some(should_refresh) = self.registry.try_begin(&work.item.id) {
                taken = Some((idx, should_refresh));
                break;
            }
        }
        let (idx, should_refresh) = taken?;
        let work = pending.remove(idx)?;
        self.running.fetch_add(1, Ordering::SeqCst);
        let should_refresh = should_refresh || work.options.refresh;
        Some((work, should_refresh))
    }

    /// Append forwarded work.
    pub fn enqueue(&self, work: QueuedWork) {
        self.pending.lock().push_back(work);
        self.work_available.notify_waiters();
    }

    /// Stop dequeuing and wait for in-flight items to finish.
    /// Stop dequeuing and wait for in-flight items to finish.
    pub async fn pause(&self) {
        self.begin_pause();
        self.wait_idle().await;
        info!(community = %self.name, "Worker queue paused");
    }

    /// Stop dequeuing without waiting for in-flight items.
    pub fn begin_pause(&self) {
        info!(community = %self.name, "Pausing worker queue");
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        info!(community = %self.name, "Resuming worker queue");
        self.paused.store(false, Ordering::SeqCst);
        self.work_available.notify_waiters();
    }

    /// Stop dequeuing, wait up to the grace period, then abort remaining
    /// workers and drop all queued work.
    pub async fn stop(&self) {
        info!(community = %self.name, "Stopping worker queue");
        self.paused.store(true, Ordering::SeqCst);

        if tokio::time::timeout(self.config.stop_grace, self.wait_idle())
            .await
            .is_err()
        {
            warn!(
                community = %self.name,
                running = self.running(),
                "In-flight items did not finish within grace period, aborting"
            );
        }

        self.cancellation_token.lock().cancel();
        let join_set = self.tasks.lock().take();
        if let Some(mut join_set) = join_set {
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
        }

        self.pending.lock().clear();
        self.registry.clear();
        info!(community = %self.name, "Worker queue stopped");
    }

    /// Resolve once no item is being processed.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            let running = self.running();
            if running == 0 {
                return;
            }
            tokio::select! {
                _ = &mut idle => {}
                _ = tokio::time::sleep(WAIT_LOG_INTERVAL) => {
                    info!(community = %self.name, running, "Waiting for in-flight items to finish");
                }
            }
        }
    }

    /// Per-item delay applied before each item (nanny soft mode).
    pub fn set_item_delay(&self, delay: Option<Duration>) {
        *self.item_delay.lock() = delay;
    }

    pub fn item_delay(&self) -> Option<Duration> {
        *self.item_delay.lock()
    }

    /// Queued items not yet taken by a worker.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items currently being processed.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.tasks.lock().is_some()
    }

    pub fn concurrency(&self) -> usize {
        self.config.concurrency
    }
}
