//! Scriptable in-memory [`ApiClient`] for tests.
//!
//! Responses are scripted per `(community, source)` and consumed in order.
//! Once a script is exhausted the client keeps answering with the source's
//! steady-state listing (empty unless set).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::client::{ActionRequest, ApiClient};
use crate::error::ApiError;
use crate::item::Item;
use crate::listing::{FetchOptions, Listing, SourceKind};

type SourceKey = (String, SourceKind);

#[derive(Default)]
struct MockState {
    scripts: HashMap<SourceKey, VecDeque<Result<Listing, ApiError>>>,
    steady: HashMap<SourceKey, Listing>,
    fetches: Vec<(String, SourceKind, FetchOptions)>,
    actions: Vec<(String, ActionRequest)>,
    refreshed: Vec<String>,
    refresh_overrides: HashMap<String, Item>,
    remaining: Option<u32>,
    expiration: Option<DateTime<Utc>>,
    remaining_after_probe: Option<u32>,
    action_error: Option<ApiError>,
}

/// In-memory client with scripted listings and recorded side effects.
#[derive(Default)]
pub struct MockClient {
    state: Mutex<MockState>,
    probes: AtomicUsize,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one response for the next fetch of this source.
    pub fn push_page(&self, community: &str, source: SourceKind, page: Listing) {
        self.push_response(community, source, Ok(page));
    }

    /// Queue one failure for the next fetch of this source.
    pub fn push_error(&self, community: &str, source: SourceKind, error: ApiError) {
        self.push_response(community, source, Err(error));
    }

    fn push_response(&self, community: &str, source: SourceKind, response: Result<Listing, ApiError>) {
        self.state
            .lock()
            .scripts
            .entry((community.to_string(), source))
            .or_default()
            .push_back(response);
    }

    /// Listing returned once the script for this source is exhausted.
    pub fn set_steady_page(&self, community: &str, source: SourceKind, page: Listing) {
        self.state
            .lock()
            .steady
            .insert((community.to_string(), source), page);
    }

    pub fn set_budget(&self, remaining: Option<u32>, expiration: Option<DateTime<Utc>>) {
        let mut state = self.state.lock();
        state.remaining = remaining;
        state.expiration = expiration;
    }

    /// Budget reading the next probe call will install.
    pub fn set_remaining_after_probe(&self, remaining: u32) {
        self.state.lock().remaining_after_probe = Some(remaining);
    }

    /// Item state handed back by `refresh_item` for this id.
    pub fn set_refreshed_item(&self, item: Item) {
        self.state
            .lock()
            .refresh_overrides
            .insert(item.id.clone(), item);
    }

    /// Make every subsequent action fail with this error.
    pub fn fail_actions_with(&self, error: ApiError) {
        self.state.lock().action_error = Some(error);
    }

    pub fn fetches(&self) -> Vec<(String, SourceKind, FetchOptions)> {
        self.state.lock().fetches.clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.state.lock().fetches.len()
    }

    /// Performed actions as `(item_id, action)` pairs, in order.
    pub fn actions(&self) -> Vec<(String, ActionRequest)> {
        self.state.lock().actions.clone()
    }

    pub fn refreshed(&self) -> Vec<String> {
        self.state.lock().refreshed.clone()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ApiClient for MockClient {
    async fn fetch_page(
        &self,
        community: &str,
        source: SourceKind,
        options: FetchOptions,
    ) -> Result<Listing, ApiError> {
        let mut state = self.state.lock();
        state
            .fetches
            .push((community.to_string(), source, options));

        let key = (community.to_string(), source);
        if let Some(response) = state.scripts.get_mut(&key).and_then(|s| s.pop_front()) {
            return response;
        }
        Ok(state.steady.get(&key).cloned().unwrap_or_default())
    }

    async fn refresh_item(&self, item: &Item) -> Result<Item, ApiError> {
        let mut state = self.state.lock();
        state.refreshed.push(item.id.clone());
        Ok(state
            .refresh_overrides
            .get(&item.id)
            .cloned()
            .unwrap_or_else(|| item.clone()))
    }

    async fn perform_action(&self, item: &Item, action: &ActionRequest) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        if let Some(error) = state.action_error.clone() {
            return Err(error);
        }
        state.actions.push((item.id.clone(), action.clone()));
        Ok(())
    }

    async fn probe(&self) -> Result<(), ApiError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if let Some(remaining) = state.remaining_after_probe.take() {
            state.remaining = Some(remaining);
        }
        Ok(())
    }

    fn ratelimit_remaining(&self) -> Option<u32> {
        self.state.lock().remaining
    }

    fn ratelimit_expiration(&self) -> Option<DateTime<Utc>> {
        self.state.lock().expiration
    }
}
