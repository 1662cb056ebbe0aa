//! Per-community orchestration.
//!
//! Each moderated community gets one [`Manager`] that wires polling,
//! admission, the worker queue and rule evaluation together behind a
//! small control surface.

pub mod orchestrator;
pub mod stats;
pub mod status;

pub use orchestrator::{DEFAULT_EVENT_CAPACITY, DELAY_UNTIL_IDENTIFIER, Manager, ManagerContext};
pub use stats::{ManagerStats, RATE_WINDOW_SAMPLES, STATS_SAMPLE_INTERVAL, StatsSnapshot};
pub use status::{ManagerStatus, SourceStatus};
