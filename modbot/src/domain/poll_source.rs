//! Resolved polling source definition.

use std::time::Duration;

use platform_api::SourceKind;
use serde::Serialize;

/// One content stream to poll for a community.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollSource {
    /// Unique name within the community; used in `poll:<name>` provenance.
    pub name: String,
    pub kind: SourceKind,
    /// Page size.
    pub limit: usize,
    /// Base interval between ticks (jittered by ±1s).
    pub interval: Duration,
    /// Items younger than this are deferred until they reach this age.
    pub delay_until: Option<Duration>,
    /// Keep paging while every item on a page is new.
    pub enforce_continuity: bool,
}

impl PollSource {
    pub fn new(kind: SourceKind, limit: usize, interval: Duration) -> Self {
        Self {
            name: kind.as_str().to_string(),
            kind,
            limit,
            interval,
            delay_until: None,
            enforce_continuity: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_continuity(mut self, enforce: bool) -> Self {
        self.enforce_continuity = enforce;
        self
    }

    pub fn with_delay_until(mut self, delay: Duration) -> Self {
        self.delay_until = Some(delay);
        self
    }

    /// Human-readable summary for status reads.
    pub fn describe(&self) -> String {
        let mut desc = format!(
            "{} ({}) every {}s, limit {}",
            self.name,
            self.kind,
            self.interval.as_secs(),
            self.limit
        );
        if self.enforce_continuity {
            desc.push_str(", continuity");
        }
        if let Some(delay) = self.delay_until {
            desc.push_str(&format!(", delayed until {}s old", delay.as_secs()));
        }
        desc
    }
}
