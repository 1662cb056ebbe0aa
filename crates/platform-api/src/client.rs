use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::item::Item;
use crate::listing::{FetchOptions, Listing, SourceKind};

/// A moderation action to perform against the platform.
///
/// The engine does not interpret `kind`/`params`; they are handed through
/// from the action configuration to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ActionRequest {
    pub fn new(kind: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }
}

/// Client for the platform API.
///
/// All calls draw from one global rate-limit budget. The budget counters are
/// maintained by the implementation and are read-only to callers.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Fetch one page of a community's content stream.
    async fn fetch_page(
        &self,
        community: &str,
        source: SourceKind,
        options: FetchOptions,
    ) -> Result<Listing, ApiError>;

    /// Re-fetch the current state of an item.
    async fn refresh_item(&self, item: &Item) -> Result<Item, ApiError>;

    /// Perform a moderation action on an item.
    async fn perform_action(&self, item: &Item, action: &ActionRequest) -> Result<(), ApiError>;

    /// Make the cheapest possible call, only to refresh the budget counters.
    async fn probe(&self) -> Result<(), ApiError>;

    /// Remaining requests in the current budget window, if known.
    fn ratelimit_remaining(&self) -> Option<u32>;

    /// When the current budget window resets, if known.
    fn ratelimit_expiration(&self) -> Option<DateTime<Utc>>;
}
