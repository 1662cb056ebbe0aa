//! Tracking of items between firehose admission and worker completion.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InFlightState {
    Queued,
    Processing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InFlightRecord {
    pub item_id: String,
    pub should_refresh: bool,
    pub state: InFlightState,
}

/// Decision taken for one pushed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Hand the work to the queue.
    Forward { should_refresh: bool },
    /// A queued copy already exists; it was flagged for refresh instead.
    Coalesced,
}

/// Records for every admitted item id, in admission order.
///
/// Admission and dequeue both go through this registry's lock, so a push
/// racing a worker either flags the still-queued record or sees it
/// processing and forwards a new copy.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    records: Mutex<HashMap<String, Vec<InFlightRecord>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a freshly pushed item should be forwarded.
    pub fn admit(&self, item_id: &str) -> Admission {
        let mut records = self.records.lock();
        let entries = records.entry(item_id.to_string()).or_default();

        match entries.last_mut() {
            None => {
                entries.push(InFlightRecord {
                    item_id: item_id.to_string(),
                    should_refresh: false,
                    state: InFlightState::Queued,
                });
                Admission::Forward {
                    should_refresh: false,
                }
            }
            Some(last) if last.state == InFlightState::Queued => {
                last.should_refresh = true;
                Admission::Coalesced
            }
            Some(_) => {
                entries.push(InFlightRecord {
                    item_id: item_id.to_string(),
                    should_refresh: true,
                    state: InFlightState::Queued,
                });
                Admission::Forward {
                    should_refresh: true,
                }
            }
        }
    }

    /// Move the oldest queued record to processing.
    ///
    /// Returns `None` while another copy of the item is still processing,
    /// otherwise the record's refresh flag.
    pub fn try_begin(&self, item_id: &str) -> Option<bool> {
        let mut records = self.records.lock();
        let entries = records.get_mut(item_id)?;
        if entries.iter().any(|r| r.state == InFlightState::Processing) {
            return None;
        }
        let record = entries
            .iter_mut()
            .find(|r| r.state == InFlightState::Queued)?;
        record.state = InFlightState::Processing;
        Some(record.should_refresh)
    }

    /// Remove the processing record for this item, whatever the outcome.
    pub fn complete(&self, item_id: &str) {
        let mut records = self.records.lock();
        if let Some(entries) = records.get_mut(item_id) {
            if let Some(pos) = entries
                .iter()
                .position(|r| r.state == InFlightState::Processing)
            {
                entries.remove(pos);
            }
            if entries.is_empty() {
                records.remove(item_id);
            }
        }
    }

    pub fn is_processing(&self, item_id: &str) -> bool {
        self.records
            .lock()
            .get(item_id)
            .is_some_and(|e| e.iter().any(|r| r.state == InFlightState::Processing))
    }

    /// Snapshot of the records held for one item.
    pub fn records_for(&self, item_id: &str) -> Vec<InFlightRecord> {
        self.records
            .lock()
            .get(item_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of records across all items.
    pub fn len(&self) -> usize {
        self.records.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}
