//! Newness bookkeeping for one polled source.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use platform_api::{Item, Listing, SourceKind};

/// Items of one fetched page that should be emitted.
#[derive(Debug, Default)]
pub struct PageClassification {
    pub new_items: Vec<Item>,
    /// Every item on the page was unseen; continuity may fetch another page.
    pub all_new: bool,
}

/// Seen ids, cutoff and first-tick flag of a poller.
#[derive(Debug, Clone)]
pub struct PollState {
    processed: HashSet<String>,
    cutoff: Option<DateTime<Utc>>,
    new_start: bool,
}

impl Default for PollState {
    fn default() -> Self {
        Self::new()
    }
}

impl PollState {
    pub fn new() -> Self {
        Self {
            processed: HashSet::new(),
            cutoff: None,
            new_start: true,
        }
    }

    /// Forget everything so the next tick behaves like a fresh start.
    pub fn reset(&mut self) {
        self.processed.clear();
        self.cutoff = None;
        self.new_start = true;
    }

    /// Pre-populate seen ids, e.g. when taking over from another poller.
    pub fn seed_processed<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.processed.extend(ids.into_iter().map(Into::into));
    }

    pub fn is_new_start(&self) -> bool {
        self.new_start
    }

    pub fn cutoff(&self) -> Option<DateTime<Utc>> {
        self.cutoff
    }

    pub fn has_processed(&self, id: &str) -> bool {
        self.processed.contains(id)
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    /// Absorb the first page after a (re)start without emitting anything.
    pub fn absorb_first_page(&mut self, page: &Listing, kind: SourceKind, now: DateTime<Utc>) {
        self.processed
            .extend(page.items.iter().map(|item| item.id.clone()));
        if kind.uses_cutoff() {
            self.cutoff = Some(
                page.items
                    .iter()
                    .map(|item| item.created_at)
                    .max()
                    .unwrap_or(now),
            );
        }
        self.new_start = false;
    }

    /// Classify a page fetched after the first tick.
    ///
    /// `page_index` is zero for the first page of a tick. On later pages of
    /// flag-based sources an unseen item only counts as new when it carries
    /// exactly one report; more reports suggest it was flagged earlier.
    pub fn classify(
        &mut self,
        page: &Listing,
        kind: SourceKind,
        page_index: usize,
    ) -> PageClassification {
        let mut result = PageClassification {
            new_items: Vec::new(),
            all_new: !page.is_empty(),
        };

        for item in &page.items {
            let unseen = !self.processed.contains(&item.id);
            let likely_new = if kind.is_flag_based() && page_index > 0 {
                unseen && item.num_reports == 1
            } else {
                unseen
            };

            if !likely_new {
                result.all_new = false;
                self.processed.insert(item.id.clone());
                continue;
            }
            self.processed.insert(item.id.clone());

            if kind.uses_cutoff()
                && let Some(cutoff) = self.cutoff
                && item.created_at < cutoff
            {
                continue;
            }
            result.new_items.push(item.clone());
        }

        result
    }
}
