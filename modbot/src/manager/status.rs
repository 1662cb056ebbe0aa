//! Status reads for a managed community.

use serde::Serialize;

use super::stats::StatsSnapshot;
use crate::domain::RunningStates;

/// One polling source as seen by status reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub description: String,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub community: String,
    pub states: RunningStates,
    pub valid_config: bool,
    /// Hash of the loaded configuration document.
    pub config_hash: Option<String>,
    pub queue_len: usize,
    pub running: usize,
    pub concurrency: usize,
    pub delayed: usize,
    pub sources: Vec<SourceStatus>,
    /// Per-item delay applied by the nanny.
    pub item_delay_ms: Option<u64>,
    pub stats: StatsSnapshot,
}

impl ManagerStatus {
    pub fn summary(&self) -> String {
        format!(
            "{}: manager {}, events {}, queue {} ({} queued, {} running, {} delayed)",
            self.community,
            self.states.manager.state,
            self.states.events.state,
            self.states.queue.state,
            self.queue_len,
            self.running,
            self.delayed
        )
    }
}
