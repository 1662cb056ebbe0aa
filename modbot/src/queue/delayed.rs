//! Store of items scheduled for delayed re-processing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use platform_api::Item;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::firehose::DedupFirehose;
use crate::domain::{Provenance, QueuedWork, WorkOptions};
use crate::rules::{DispatchAction, GotoTarget};

/// Interval between sweeps for due entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Whether an organic push of the same item intercepts a delayed entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CancelPolicy {
    #[default]
    Never,
    Always,
    /// Provenance patterns, e.g. `poll`, `poll:modqueue`, `user`.
    Sources(Vec<String>),
}

impl CancelPolicy {
    pub fn matches(&self, provenance: &Provenance) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::Sources(patterns) => patterns.iter().any(|p| provenance.matches_pattern(p)),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawCancelPolicy {
    Flag(bool),
    Sources(Vec<String>),
}

impl Serialize for CancelPolicy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Never => RawCancelPolicy::Flag(false),
            Self::Always => RawCancelPolicy::Flag(true),
            Self::Sources(list) => RawCancelPolicy::Sources(list.clone()),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CancelPolicy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawCancelPolicy::deserialize(deserializer)? {
            RawCancelPolicy::Flag(true) => Self::Always,
            RawCancelPolicy::Flag(false) => Self::Never,
            RawCancelPolicy::Sources(list) => Self::Sources(list),
        })
    }
}

/// How late an entry may fire before it is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TardyTolerance {
    #[default]
    Always,
    /// Only the lateness inherent to the sweep interval is tolerated.
    Never,
    Max(Duration),
}

impl TardyTolerance {
    pub fn tolerates(&self, lateness: Duration) -> bool {
        match self {
            Self::Always => true,
            Self::Never => lateness <= SWEEP_INTERVAL,
            Self::Max(max) => lateness <= *max,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawTardyTolerance {
    Flag(bool),
    Seconds(u64),
}

impl Serialize for TardyTolerance {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Always => RawTardyTolerance::Flag(true),
            Self::Never => RawTardyTolerance::Flag(false),
            Self::Max(max) => RawTardyTolerance::Seconds(max.as_secs()),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TardyTolerance {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawTardyTolerance::deserialize(deserializer)? {
            RawTardyTolerance::Flag(true) => Self::Always,
            RawTardyTolerance::Flag(false) => Self::Never,
            RawTardyTolerance::Seconds(secs) => Self::Max(Duration::from_secs(secs)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct DelayedEntry {
    pub id: Uuid,
    pub item: Item,
    pub delay: Duration,
    pub queued_at: DateTime<Utc>,
    /// `run.check` label of whatever scheduled the entry.
    pub source: String,
    pub identifier: Option<String>,
    pub cancel_if_queued: CancelPolicy,
    pub tardy_tolerance: TardyTolerance,
    pub start_at: Option<GotoTarget>,
}

impl DelayedEntry {
    pub fn new(item: Item, delay: Duration, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            item,
            delay,
            queued_at: Utc::now(),
            source: source.into(),
            identifier: None,
            cancel_if_queued: CancelPolicy::Never,
            tardy_tolerance: TardyTolerance::Always,
            start_at: None,
        }
    }

    pub fn from_dispatch(item: Item, dispatch: &DispatchAction, source: &str) -> Self {
        Self {
            identifier: dispatch.identifier.clone(),
            cancel_if_queued: dispatch.cancel_if_queued.clone(),
            tardy_tolerance: dispatch.tardy_tolerance,
            start_at: dispatch.start_at.clone(),
            ..Self::new(item, dispatch.delay, source)
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_cancel_policy(mut self, policy: CancelPolicy) -> Self {
        self.cancel_if_queued = policy;
        self
    }

    pub fn with_tardy_tolerance(mut self, tolerance: TardyTolerance) -> Self {
        self.tardy_tolerance = tolerance;
        self
    }

    pub fn with_queued_at(mut self, queued_at: DateTime<Utc>) -> Self {
        self.queued_at = queued_at;
        self
    }

    pub fn due_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.delay)
            .ok()
            .and_then(|delay| self.queued_at.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// How far past due the entry is, or `None` if not yet due.
    pub fn lateness(&self, now: DateTime<Utc>) -> Option<Duration> {
        let due = self.due_at();
        if now < due {
            return None;
        }
        Some((now - due).to_std().unwrap_or_default())
    }

    pub fn provenance(&self) -> Provenance {
        Provenance::dispatch(self.identifier.as_deref())
    }

    /// Work pushed into the firehose when the entry fires.
    pub fn into_work(self) -> QueuedWork {
        let provenance = self.provenance();
        QueuedWork::new(self.item, provenance).with_options(WorkOptions {
            refresh: true,
            start_at: self.start_at,
            ..Default::default()
        })
    }
}

/// Entries taken from the store by one sweep.
#[derive(Debug, Default)]
pub struct DueEntries {
    pub ready: Vec<DelayedEntry>,
    pub expired: Vec<DelayedEntry>,
}

#[derive(Debug, Default)]
pub struct DelayedDispatchStore {
    entries: Mutex<Vec<DelayedEntry>>,
}

impl DelayedDispatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, entry: DelayedEntry) {
        debug!(
            item_id = %entry.item.id,
            entry_id = %entry.id,
            delay_secs = entry.delay.as_secs(),
            source = %entry.source,
            "Delayed entry added"
        );
        self.entries.lock().push(entry);
    }

    pub fn remove(&self, id: Uuid) -> Option<DelayedEntry> {
        let mut entries = self.entries.lock();
        let pos = entries.iter().position(|e| e.id == id)?;
        Some(entries.remove(pos))
    }

    /// Remove entries for `item_id` whose cancel policy matches `provenance`.
    pub fn cancel_matching(&self, item_id: &str, provenance: &Provenance) -> Vec<DelayedEntry> {
        let mut entries = self.entries.lock();
        let (cancelled, kept): (Vec<_>, Vec<_>) = entries
            .drain(..)
            .partition(|e| e.item.id == item_id && e.cancel_if_queued.matches(provenance));
        *entries = kept;
        cancelled
    }

    /// Take every entry due at `now`, split by whether its lateness is tolerated.
    pub fn take_due(&self, now: DateTime<Utc>) -> DueEntries {
        let mut entries = self.entries.lock();
        let mut due = DueEntries::default();
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries.drain(..) {
            match entry.lateness(now) {
                None => kept.push(entry),
                Some(lateness) if entry.tardy_tolerance.tolerates(lateness) => {
                    due.ready.push(entry)
                }
                Some(_) => due.expired.push(entry),
            }
        }
        *entries = kept;
        due
    }

    pub fn list(&self) -> Vec<DelayedEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Fire due entries into the firehose once.
    pub fn sweep(&self, firehose: &DedupFirehose) -> usize {
        let due = self.take_due(Utc::now());
        for entry in due.expired {
            warn!(
                item_id = %entry.item.id,
                entry_id = %entry.id,
                source = %entry.source,
                "Delayed entry fired too late, dropping"
            );
        }
        let fired = due.ready.len();
        for entry in due.ready {
            debug!(item_id = %entry.item.id, entry_id = %entry.id, "Delayed entry due");
            firehose.push(entry.into_work());
        }
        fired
    }

    /// Spawn the periodic sweep.
    pub fn start_sweep(
        self: &Arc<Self>,
        firehose: Arc<DedupFirehose>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            info!("Delayed dispatch sweep started");
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        store.sweep(&firehose);
                    }
                }
            }
            info!("Delayed dispatch sweep stopped");
        })
    }
}
