use serde::{Deserialize, Serialize};

use crate::item::Item;

/// A content stream a community can be polled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Newest submissions.
    Submissions,
    /// Newest comments.
    Comments,
    /// Submissions not yet reviewed by a moderator.
    Unmoderated,
    /// Reported or filtered content awaiting review.
    ModQueue,
    /// Reported content only.
    Reports,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submissions => "submissions",
            Self::Comments => "comments",
            Self::Unmoderated => "unmoderated",
            Self::ModQueue => "modqueue",
            Self::Reports => "reports",
        }
    }

    /// Whether newness is decided by creation time.
    ///
    /// Sources ordered by when content was flagged have no reliable
    /// flagged-at timestamp, so a creation-time cutoff would drop fresh
    /// reports on old content.
    pub fn uses_cutoff(&self) -> bool {
        matches!(self, Self::Submissions | Self::Comments | Self::Unmoderated)
    }

    pub fn is_flag_based(&self) -> bool {
        !self.uses_cutoff()
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Paging options for a single listing request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Maximum number of items on the page.
    pub limit: usize,
    /// Cursor returned by the previous page.
    pub after: Option<String>,
}

impl FetchOptions {
    pub fn first_page(limit: usize) -> Self {
        Self { limit, after: None }
    }

    pub fn next_page(limit: usize, after: impl Into<String>) -> Self {
        Self {
            limit,
            after: Some(after.into()),
        }
    }
}

/// One page of a content stream, newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub items: Vec<Item>,
    /// Cursor for the next (older) page, if any.
    #[serde(default)]
    pub after: Option<String>,
}

impl Listing {
    pub fn new(items: Vec<Item>, after: Option<String>) -> Self {
        Self { items, after }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}
