use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of moderated content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// Top-level post.
    Submission,
    /// Reply to a submission or another comment.
    Comment,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submission => "submission",
            Self::Comment => "comment",
        }
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of moderated content.
///
/// Identity is the `id`; two items with the same id are the same content,
/// possibly observed at different times with different report/removal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub kind: ItemKind,
    /// Community the item belongs to.
    pub community: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    /// Parent submission/comment for replies.
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    /// Number of user reports currently on the item.
    #[serde(default)]
    pub num_reports: u32,
    #[serde(default)]
    pub removed: bool,
    #[serde(default)]
    pub approved: bool,
}

impl Item {
    /// Create a bare item, mostly useful for tests and manual injection.
    pub fn new(
        id: impl Into<String>,
        kind: ItemKind,
        community: impl Into<String>,
        author: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            community: community.into(),
            author: author.into(),
            created_at,
            parent_id: None,
            title: None,
            body: None,
            num_reports: 0,
            removed: false,
            approved: false,
        }
    }

    pub fn with_reports(mut self, num_reports: u32) -> Self {
        self.num_reports = num_reports;
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Age of the item relative to `now`, clamped at zero.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.created_at).max(chrono::Duration::zero())
    }
}
