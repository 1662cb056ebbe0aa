//! Per-community configuration document.

use platform_api::SourceKind;
use serde::Deserialize;

use crate::rules::Run;

/// One `polling` entry: either a bare source kind or a full definition.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PollingEntry {
    Kind(SourceKind),
    Detailed(PollingDefinition),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingDefinition {
    #[serde(alias = "pollOn")]
    pub kind: SourceKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Seconds between ticks.
    #[serde(default)]
    pub interval: Option<u64>,
    /// Minimum item age in seconds before processing.
    #[serde(default)]
    pub delay_until: Option<u64>,
    #[serde(default)]
    pub enforce_continuity: bool,
}

impl PollingEntry {
    pub fn into_definition(self) -> PollingDefinition {
        match self {
            Self::Kind(kind) => PollingDefinition {
                kind,
                name: None,
                limit: None,
                interval: None,
                delay_until: None,
                enforce_continuity: false,
            },
            Self::Detailed(def) => def,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOverrides {
    #[serde(default, alias = "maxWorkers")]
    pub concurrency: Option<usize>,
}

/// A community's configuration as stored by the config source.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunityDocument {
    #[serde(default)]
    pub polling: Vec<PollingEntry>,
    #[serde(default)]
    pub runs: Vec<Run>,
    #[serde(default)]
    pub queue: Option<QueueOverrides>,
    #[serde(default)]
    pub max_goto_depth: Option<u32>,
    #[serde(default)]
    pub dry_run: Option<bool>,
}

impl CommunityDocument {
    pub fn parse(raw: &str) -> crate::Result<Self> {
        if raw.trim().is_empty() {
            return Err(crate::Error::config("configuration document is empty"));
        }
        serde_json::from_str(raw)
            .map_err(|e| crate::Error::config(format!("invalid configuration document: {e}")))
    }
}
