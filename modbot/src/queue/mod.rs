//! Item admission and processing queue.
//!
//! Discovered items flow through the [`DedupFirehose`], which consults the
//! [`InFlightRegistry`] so that no two workers of the [`WorkerQueue`] ever
//! process the same item at once. The [`DelayedDispatchStore`] feeds
//! scheduled re-processing back into the firehose.

pub mod delayed;
pub mod firehose;
pub mod in_flight;
pub mod worker;

pub use delayed::{
    CancelPolicy, DelayedDispatchStore, DelayedEntry, DueEntries, SWEEP_INTERVAL, TardyTolerance,
};
pub use firehose::{DedupFirehose, PushOutcome};
pub use in_flight::{Admission, InFlightRecord, InFlightRegistry, InFlightState};
pub use worker::{
    DEFAULT_CONCURRENCY, DEFAULT_STOP_GRACE, WorkHandler, WorkerQueue, WorkerQueueConfig,
};
