//! Post-evaluation control flow for Runs and Checks.

use serde::{Deserialize, Serialize};

/// A named jump target: a Run, optionally starting at one of its Checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GotoTarget {
    pub run: String,
    pub check: Option<String>,
}

impl GotoTarget {
    pub fn run(run: impl Into<String>) -> Self {
        Self {
            run: run.into(),
            check: None,
        }
    }

    pub fn check(run: impl Into<String>, check: impl Into<String>) -> Self {
        Self {
            run: run.into(),
            check: Some(check.into()),
        }
    }

    /// Parse `run` or `run.check`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.split_once('.') {
            Some((run, check)) if !run.is_empty() && !check.is_empty() => {
                Some(Self::check(run, check))
            }
            Some(_) => None,
            None => Some(Self::run(raw)),
        }
    }
}

impl std::fmt::Display for GotoTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.check {
            Some(check) => write!(f, "{}.{}", self.run, check),
            None => f.write_str(&self.run),
        }
    }
}

/// What to do after a Check or Run finishes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PostBehavior {
    /// Continue with the next Check (or Run).
    #[default]
    Next,
    /// Leave the current Run and continue with the next one.
    NextRun,
    /// End evaluation for this item.
    Stop,
    /// Jump to a named Run/Check.
    Goto(GotoTarget),
}

impl PostBehavior {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Some(target) = raw.strip_prefix("goto:") {
            return GotoTarget::parse(target).map(Self::Goto);
        }
        match raw.to_ascii_lowercase().as_str() {
            "next" => Some(Self::Next),
            "nextrun" => Some(Self::NextRun),
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }

    pub fn goto_target(&self) -> Option<&GotoTarget> {
        match self {
            Self::Goto(target) => Some(target),
            _ => None,
        }
    }
}

impl std::fmt::Display for PostBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Next => f.write_str("next"),
            Self::NextRun => f.write_str("nextRun"),
            Self::Stop => f.write_str("stop"),
            Self::Goto(target) => write!(f, "goto:{}", target),
        }
    }
}

impl Serialize for PostBehavior {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PostBehavior {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid post behavior: {}", raw)))
    }
}

impl Serialize for GotoTarget {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GotoTarget {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid goto target: {}", raw)))
    }
}
