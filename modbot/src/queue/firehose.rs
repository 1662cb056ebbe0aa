//! Single-concurrency funnel in front of the worker queue.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::delayed::DelayedDispatchStore;
use super::in_flight::{Admission, InFlightRegistry};
use super::worker::WorkerQueue;
use crate::domain::QueuedWork;

/// Result of one push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    pub admission: Admission,
    /// Delayed entries intercepted by this push.
    pub intercepted: usize,
}

impl PushOutcome {
    pub fn forwarded(&self) -> bool {
        matches!(self.admission, Admission::Forward { .. })
    }
}

/// Every discovered item passes through here before reaching the queue.
pub struct DedupFirehose {
    registry: Arc<InFlightRegistry>,
    queue: Arc<WorkerQueue>,
    delayed: Arc<DelayedDispatchStore>,
    lock: Mutex<()>,
}

impl DedupFirehose {
    pub fn new(
        registry: Arc<InFlightRegistry>,
        queue: Arc<WorkerQueue>,
        delayed: Arc<DelayedDispatchStore>,
    ) -> Self {
        Self {
            registry,
            queue,
            delayed,
            lock: Mutex::new(()),
        }
    }

    pub fn push(&self, work: QueuedWork) -> PushOutcome {
        let _guard = self.lock.lock();
        let item_id = work.item.id.clone();

        let admission = self.registry.admit(&item_id);

        let intercepted = if work.provenance.is_dispatch() {
            0
        } else {
            let cancelled = self.delayed.cancel_matching(&item_id, &work.provenance);
            for entry in &cancelled {
                debug!(
                    item_id = %item_id,
                    entry_id = %entry.id,
                    provenance = %work.provenance,
                    "Delayed entry intercepted by organic push"
                );
            }
            cancelled.len()
        };

        match admission {
            Admission::Forward { should_refresh } => {
                debug!(
                    item_id = %item_id,
                    provenance = %work.provenance,
                    should_refresh,
                    "Forwarding item to queue"
                );
                self.queue.enqueue(work);
            }
            Admission::Coalesced => {
                debug!(
                    item_id = %item_id,
                    provenance = %work.provenance,
                    "Item already queued, flagged for refresh"
                );
            }
        }

        PushOutcome {
            admission,
            intercepted,
        }
    }

    pub fn registry(&self) -> &Arc<InFlightRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<WorkerQueue> {
        &self.queue
    }

    pub fn delayed(&self) -> &Arc<DelayedDispatchStore> {
        &self.delayed
    }
}
