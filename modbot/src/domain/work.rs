//! Units of work flowing from the pollers into the worker queue.

use platform_api::Item;
use serde::{Deserialize, Serialize};

use crate::rules::GotoTarget;

/// Where a piece of work came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Provenance {
    /// Polling, source unspecified.
    Poll,
    /// Polling, from the named source.
    PollNamed(String),
    /// Delayed re-dispatch, unnamed.
    Dispatch,
    /// Delayed re-dispatch with an identifier.
    DispatchNamed(String),
    /// Injected manually by an operator.
    User,
}

impl Provenance {
    pub fn poll(source: impl Into<String>) -> Self {
        Self::PollNamed(source.into())
    }

    pub fn dispatch(identifier: Option<&str>) -> Self {
        match identifier {
            Some(id) => Self::DispatchNamed(id.to_string()),
            None => Self::Dispatch,
        }
    }

    pub fn is_dispatch(&self) -> bool {
        matches!(self, Self::Dispatch | Self::DispatchNamed(_))
    }

    pub fn is_poll(&self) -> bool {
        matches!(self, Self::Poll | Self::PollNamed(_))
    }

    /// Whether an allow-list entry such as `poll`, `poll:modqueue` or `user`
    /// covers this provenance. A bare family name covers every named member.
    pub fn matches_pattern(&self, pattern: &str) -> bool {
        let pattern = pattern.trim();
        match pattern.split_once(':') {
            None => match pattern {
                "poll" => self.is_poll(),
                "dispatch" => self.is_dispatch(),
                "user" => matches!(self, Self::User),
                _ => false,
            },
            Some((family, name)) => match (family, self) {
                ("poll", Self::PollNamed(n)) => n == name,
                ("dispatch", Self::DispatchNamed(n)) => n == name,
                _ => false,
            },
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.split_once(':') {
            None => match s {
                "poll" => Some(Self::Poll),
                "dispatch" => Some(Self::Dispatch),
                "user" => Some(Self::User),
                _ => None,
            },
            Some(("poll", name)) if !name.is_empty() => Some(Self::PollNamed(name.to_string())),
            Some(("dispatch", name)) if !name.is_empty() => {
                Some(Self::DispatchNamed(name.to_string()))
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Poll => write!(f, "poll"),
            Self::PollNamed(name) => write!(f, "poll:{}", name),
            Self::Dispatch => write!(f, "dispatch"),
            Self::DispatchNamed(id) => write!(f, "dispatch:{}", id),
            Self::User => write!(f, "user"),
        }
    }
}

impl Serialize for Provenance {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Provenance {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid provenance: {}", raw)))
    }
}

/// Per-work processing options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkOptions {
    /// Re-fetch the item before evaluating it.
    pub refresh: bool,
    /// Evaluate even if the item is already removed.
    pub force: bool,
    /// Override the configured dry-run flag.
    pub dry_run: Option<bool>,
    /// Start evaluation at this run/check instead of the first run.
    pub start_at: Option<GotoTarget>,
}

/// An item on its way to the worker queue.
#[derive(Debug, Clone)]
pub struct QueuedWork {
    pub item: Item,
    pub options: WorkOptions,
    pub provenance: Provenance,
}

impl QueuedWork {
    pub fn new(item: Item, provenance: Provenance) -> Self {
        Self {
            item,
            options: WorkOptions::default(),
            provenance,
        }
    }

    pub fn with_options(mut self, options: WorkOptions) -> Self {
        self.options = options;
        self
    }

    pub fn item_id(&self) -> &str {
        &self.item.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provenance_display_parse() {
        for p in [
            Provenance::Poll,
            Provenance::poll("modqueue"),
            Provenance::Dispatch,
            Provenance::dispatch(Some("recheck")),
            Provenance::User,
        ] {
            assert_eq!(Provenance::parse(&p.to_string()), Some(p.clone()));
        }
        assert_eq!(Provenance::parse("poll:"), None);
        assert_eq!(Provenance::parse("cron"), None);
    }

    #[test]
    fn test_pattern_matching() {
        let named = Provenance::poll("unmoderated");
        assert!(named.matches_pattern("poll"));
        assert!(named.matches_pattern("poll:unmoderated"));
        assert!(!named.matches_pattern("poll:modqueue"));
        assert!(!named.matches_pattern("user"));

        assert!(Provenance::User.matches_pattern("user"));
        assert!(!Provenance::User.matches_pattern("poll"));
        assert!(Provenance::dispatch(Some("a")).matches_pattern("dispatch"));
    }

    #[test]
    fn test_provenance_serde() {
        let json = serde_json::to_string(&Provenance::poll("comments")).unwrap();
        assert_eq!(json, "\"poll:comments\"");
        let back: Provenance = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Provenance::poll("comments"));
    }
}
