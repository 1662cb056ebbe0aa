//! Interval poller for one content source of one community.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use platform_api::{ApiClient, ApiError, FetchOptions, Item};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::retry::{RetryDecision, RetryHandler};
use super::state::PollState;
use crate::domain::PollSource;

/// Maximum jitter applied to each interval, in either direction.
pub const INTERVAL_JITTER: Duration = Duration::from_secs(1);

/// Events emitted by a poller.
#[derive(Debug, Clone)]
pub enum PollerEvent {
    /// A tick completed; `new_items` were found across `pages` fetches.
    Listing {
        community: String,
        source: String,
        new_items: usize,
        pages: usize,
    },
    /// A newly seen item.
    Item {
        community: String,
        source: String,
        item: Item,
    },
    /// A poll failed. A fatal error means the poller stopped itself.
    Error {
        community: String,
        source: String,
        error: ApiError,
        fatal: bool,
    },
}

/// Result of one tick.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub items: Vec<Item>,
    /// Pages fetched, counting continuation pages.
    pub pages: usize,
}

pub struct StreamPoller {
    community: String,
    source: PollSource,
    client: Arc<dyn ApiClient>,
    retry: Arc<RetryHandler>,
    events: mpsc::Sender<PollerEvent>,
    state: Mutex<PollState>,
    running: AtomicBool,
    /// Bumped by every `stop()`; ticks started under an older value are discarded.
    generation: AtomicU64,
    cancellation_token: Mutex<Option<CancellationToken>>,
}

impl StreamPoller {
    pub fn new(
        community: impl Into<String>,
        source: PollSource,
        client: Arc<dyn ApiClient>,
        retry: Arc<RetryHandler>,
        events: mpsc::Sender<PollerEvent>,
    ) -> Self {
        Self {
            community: community.into(),
            source,
            client,
            retry,
            events,
            state: Mutex::new(PollState::new()),
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            cancellation_token: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &PollSource {
        &self.source
    }

    fn retry_key(&self) -> String {
        format!("{}/{}", self.community, self.source.name)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start polling. The first tick fires immediately.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.cancellation_token.lock();
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        drop(slot);

        info!(
            community = %self.community,
            source = %self.source.name,
            "Starting poller: {}",
            self.source.describe()
        );

        let poller = Arc::clone(self);
        tokio::spawn(async move {
            poller.run(token).await;
        });
    }

    /// Stop polling and forget all newness state.
    pub fn stop(&self, reason: &str) {
        if let Some(token) = self.cancellation_token.lock().take() {
            token.cancel();
        }
        self.running.store(false, Ordering::SeqCst);
        {
            let mut state = self.state.lock();
            self.generation.fetch_add(1, Ordering::SeqCst);
            state.reset();
        }
        info!(
            community = %self.community,
            source = %self.source.name,
            reason,
            "Poller stopped"
        );
    }

    /// Pre-populate seen ids so they are never emitted.
    pub fn seed_processed<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().seed_processed(ids);
    }

    pub fn state(&self) -> PollState {
        self.state.lock().clone()
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        let key = self.retry_key();
        loop {
            let outcome = self.tick().await;
            if token.is_cancelled() {
                break;
            }
            let wait = match outcome {
                Ok(outcome) => {
                    self.retry.record_success(&key);
                    if !self.emit_items(outcome).await {
                        break;
                    }
                    self.jittered_interval()
                }
                Err(error) => match self.retry.handle(&key, &error) {
                    RetryDecision::Retry(delay) => {
                        warn!(
                            community = %self.community,
                            source = %self.source.name,
                            error = %error,
                            delay_secs = delay.as_secs(),
                            "Poll failed, retrying"
                        );
                        if !self.emit_error(error, false).await {
                            break;
                        }
                        delay
                    }
                    RetryDecision::GiveUp => {
                        warn!(
                            community = %self.community,
                            source = %self.source.name,
                            error = %error,
                            "Poll failed fatally, stopping poller"
                        );
                        self.stop("fatal poll error");
                        self.emit_error(error, true).await;
                        break;
                    }
                },
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!(community = %self.community, source = %self.source.name, "Poll loop exited");
    }

    /// Fetch and classify one tick's worth of pages.
    ///
    /// The first tick after a start only seeds state and returns no items.
    /// A tick that was overtaken by `stop()` leaves the state untouched.
    pub async fn tick(&self) -> Result<TickOutcome, ApiError> {
        let kind = self.source.kind;
        let limit = self.source.limit;
        let now = Utc::now();
        let generation = self.generation.load(Ordering::SeqCst);

        let mut page = self
            .client
            .fetch_page(&self.community, kind, FetchOptions::first_page(limit))
            .await?;
        let mut outcome = TickOutcome {
            items: Vec::new(),
            pages: 1,
        };

        {
            let mut state = self.state.lock();
            if self.is_stale(generation) {
                return Ok(outcome);
            }
            if state.is_new_start() {
                state.absorb_first_page(&page, kind, now);
                debug!(
                    community = %self.community,
                    source = %self.source.name,
                    seeded = page.len(),
                    cutoff = ?state.cutoff(),
                    "First tick absorbed"
                );
                return Ok(outcome);
            }
        }

        let mut page_index = 0;
        loop {
            let classified = {
                let mut state = self.state.lock();
                if self.is_stale(generation) {
                    outcome.items.clear();
                    return Ok(outcome);
                }
                state.classify(&page, kind, page_index)
            };
            outcome.items.extend(classified.new_items);

            if !self.source.enforce_continuity || !classified.all_new {
                break;
            }
            let Some(after) = page.after.clone() else {
                break;
            };
            debug!(
                community = %self.community,
                source = %self.source.name,
                page = page_index + 1,
                "Whole page was new, fetching next page"
            );
            match self
                .client
                .fetch_page(&self.community, kind, FetchOptions::next_page(limit, after))
                .await
            {
                Ok(next) => page = next,
                Err(error) => {
                    // Ids on earlier pages are already marked processed.
                    warn!(
                        community = %self.community,
                        source = %self.source.name,
                        error = %error,
                        collected = outcome.items.len(),
                        "Continuation page failed, keeping items found so far"
                    );
                    break;
                }
            }
            outcome.pages += 1;
            page_index += 1;
        }

        Ok(outcome)
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    async fn emit_items(&self, outcome: TickOutcome) -> bool {
        let TickOutcome { items, pages } = outcome;
        let listing = PollerEvent::Listing {
            community: self.community.clone(),
            source: self.source.name.clone(),
            new_items: items.len(),
            pages,
        };
        if self.events.send(listing).await.is_err() {
            return false;
        }
        for item in items {
            let event = PollerEvent::Item {
                community: self.community.clone(),
                source: self.source.name.clone(),
                item,
            };
            if self.events.send(event).await.is_err() {
                return false;
            }
        }
        true
    }

    async fn emit_error(&self, error: ApiError, fatal: bool) -> bool {
        self.events
            .send(PollerEvent::Error {
                community: self.community.clone(),
                source: self.source.name.clone(),
                error,
                fatal,
            })
            .await
            .is_ok()
    }

    fn jittered_interval(&self) -> Duration {
        let jitter = INTERVAL_JITTER.as_secs_f64() * (rand::random::<f64>() * 2.0 - 1.0);
        let secs = (self.source.interval.as_secs_f64() + jitter).max(0.0);
        Duration::from_secs_f64(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::RetryConfig;
    use platform_api::testing::MockClient;
    use platform_api::{ItemKind, Listing, SourceKind};

    fn item(id: &str, age_secs: i64) -> Item {
        Item::new(
            id,
            ItemKind::Submission,
            "rust",
            "grace",
            Utc::now() - chrono::Duration::seconds(age_secs),
        )
    }

    fn poller(
        client: Arc<MockClient>,
        source: PollSource,
    ) -> (Arc<StreamPoller>, mpsc::Receiver<PollerEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let retry = Arc::new(RetryHandler::new(RetryConfig {
            use_jitter: false,
            ..Default::default()
        }));
        (
            Arc::new(StreamPoller::new("rust", source, client, retry, tx)),
            rx,
        )
    }

    #[tokio::test]
    async fn test_first_tick_is_silent() {
        let client = Arc::new(MockClient::new());
        client.push_page(
            "rust",
            SourceKind::Submissions,
            Listing::new(vec![item("a", 10), item("b", 20)], None),
        );
        let source = PollSource::new(SourceKind::Submissions, 25, Duration::from_secs(30));
        let (poller, _rx) = poller(client, source);

        assert!(poller.tick().await.unwrap().items.is_empty());
        assert!(poller.state().has_processed("a"));
    }

    #[tokio::test]
    async fn test_old_items_filtered_after_empty_first_page() {
        let client = Arc::new(MockClient::new());
        client.push_page("rust", SourceKind::Comments, Listing::empty());
        client.push_page(
            "rust",
            SourceKind::Comments,
            Listing::new(vec![item("old", 3600)], None),
        );
        let source = PollSource::new(SourceKind::Comments, 25, Duration::from_secs(30));
        let (poller, _rx) = poller(client, source);

        poller.tick().await.unwrap();
        assert!(poller.tick().await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn test_continuity_follows_cursor_until_seen() {
        let client = Arc::new(MockClient::new());
        client.push_page(
            "rust",
            SourceKind::Submissions,
            Listing::new(vec![item("seen", 100)], None),
        );
        client.push_page(
            "rust",
            SourceKind::Submissions,
            Listing::new(vec![item("n1", 1), item("n2", 2)], Some("t3_n2".into())),
        );
        client.push_page(
            "rust",
            SourceKind::Submissions,
            Listing::new(vec![item("n3", 3), item("seen", 100)], Some("t3_seen".into())),
        );
        let source = PollSource::new(SourceKind::Submissions, 2, Duration::from_secs(30))
            .with_continuity(true);
        let (poller, _rx) = poller(client.clone(), source);

        poller.tick().await.unwrap();
        let outcome = poller.tick().await.unwrap();
        let ids: Vec<_> = outcome.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["n1", "n2", "n3"]);
        assert_eq!(outcome.pages, 2);

        let fetches = client.fetches();
        assert_eq!(fetches.len(), 3);
        assert_eq!(fetches[2].2, FetchOptions::next_page(2, "t3_n2"));
    }

    #[tokio::test]
    async fn test_continuation_failure_keeps_collected_items() {
        let client = Arc::new(MockClient::new());
        client.push_page(
            "rust",
            SourceKind::Submissions,
            Listing::new(vec![item("seen", 100)], None),
        );
        client.push_page(
            "rust",
            SourceKind::Submissions,
            Listing::new(vec![item("n1", 1), item("n2", 2)], Some("t3_n2".into())),
        );
        client.push_error(
            "rust",
            SourceKind::Submissions,
            ApiError::transient(502, "bad gateway"),
        );
        client.push_page(
            "rust",
            SourceKind::Submissions,
            Listing::new(vec![item("n1", 1), item("n2", 2), item("seen", 100)], None),
        );
        let source = PollSource::new(SourceKind::Submissions, 2, Duration::from_secs(30))
            .with_continuity(true);
        let (poller, _rx) = poller(client, source);

        poller.tick().await.unwrap();
        let outcome = poller.tick().await.unwrap();
        let ids: Vec<_> = outcome.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["n1", "n2"]);
        assert_eq!(outcome.pages, 1);

        assert!(poller.tick().await.unwrap().items.is_empty());
    }

    /// Delegates to a [`MockClient`] but holds every fetch until a permit is added.
    struct GatedClient {
        inner: MockClient,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait::async_trait]
    impl ApiClient for GatedClient {
        async fn fetch_page(
            &self,
            community: &str,
            source: SourceKind,
            options: FetchOptions,
        ) -> Result<Listing, ApiError> {
            self.gate.acquire().await.unwrap().forget();
            self.inner.fetch_page(community, source, options).await
        }

        async fn refresh_item(&self, item: &Item) -> Result<Item, ApiError> {
            self.inner.refresh_item(item).await
        }

        async fn perform_action(
            &self,
            item: &Item,
            action: &platform_api::ActionRequest,
        ) -> Result<(), ApiError> {
            self.inner.perform_action(item, action).await
        }

        async fn probe(&self) -> Result<(), ApiError> {
            self.inner.probe().await
        }

        fn ratelimit_remaining(&self) -> Option<u32> {
            self.inner.ratelimit_remaining()
        }

        fn ratelimit_expiration(&self) -> Option<chrono::DateTime<Utc>> {
            self.inner.ratelimit_expiration()
        }
    }

    #[tokio::test]
    async fn test_tick_overtaken_by_stop_leaves_state_fresh() {
        let inner = MockClient::new();
        inner.push_page(
            "rust",
            SourceKind::Submissions,
            Listing::new(vec![item("a", 10)], None),
        );
        inner.push_page(
            "rust",
            SourceKind::Submissions,
            Listing::new(vec![item("c", 1), item("a", 10)], None),
        );
        let client = Arc::new(GatedClient {
            inner,
            gate: tokio::sync::Semaphore::new(0),
        });
        let (tx, _rx) = mpsc::channel(8);
        let retry = Arc::new(RetryHandler::new(RetryConfig::default()));
        let poller = Arc::new(StreamPoller::new(
            "rust",
            PollSource::new(SourceKind::Submissions, 25, Duration::from_secs(30)),
            client.clone(),
            retry,
            tx,
        ));

        let in_flight = tokio::spawn({
            let poller = Arc::clone(&poller);
            async move { poller.tick().await }
        });
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        poller.stop("restart");
        client.gate.add_permits(1);

        let stale = in_flight.await.unwrap().unwrap();
        assert!(stale.items.is_empty());
        assert!(poller.state().is_new_start());
        assert_eq!(poller.state().processed_count(), 0);

        client.gate.add_permits(1);
        assert!(poller.tick().await.unwrap().items.is_empty());
        assert!(poller.state().has_processed("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_emits_items_and_stop_resets() {
        let client = Arc::new(MockClient::new());
        client.push_page("rust", SourceKind::ModQueue, Listing::empty());
        client.set_steady_page(
            "rust",
            SourceKind::ModQueue,
            Listing::new(vec![item("flagged", 5000).with_reports(1)], None),
        );
        let source = PollSource::new(SourceKind::ModQueue, 25, Duration::from_secs(10));
        let (poller, mut rx) = poller(client, source);

        poller.start();
        let mut items = Vec::new();
        while items.is_empty() {
            match rx.recv().await {
                Some(PollerEvent::Item { item, source, .. }) => {
                    assert_eq!(source, "modqueue");
                    items.push(item);
                }
                Some(_) => {}
                None => panic!("channel closed"),
            }
        }
        assert_eq!(items[0].id, "flagged");

        poller.stop("test");
        assert!(!poller.is_running());
        assert!(poller.state().is_new_start());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_retries() {
        let client = Arc::new(MockClient::new());
        for _ in 0..6 {
            client.push_error(
                "rust",
                SourceKind::Submissions,
                ApiError::transient(502, "bad gateway"),
            );
        }
        let source = PollSource::new(SourceKind::Submissions, 25, Duration::from_secs(10));
        let (poller, mut rx) = poller(client, source);

        poller.start();
        let mut retries = 0;
        loop {
            match rx.recv().await {
                Some(PollerEvent::Error { fatal: false, .. }) => retries += 1,
                Some(PollerEvent::Error { fatal: true, .. }) => break,
                Some(_) => {}
                None => panic!("channel closed"),
            }
        }
        assert_eq!(retries, 5);
        assert!(!poller.is_running());
    }
}
