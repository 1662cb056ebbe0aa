//! Domain layer for modbot.
//!
//! Running-state machines, polling sources and the work units that flow
//! through the pipeline.

pub mod poll_source;
pub mod running_state;
pub mod work;

pub use poll_source::PollSource;
pub use running_state::{CausedBy, Facet, RunState, RunningStates, StateEntry, Transition};
pub use work::{Provenance, QueuedWork, WorkOptions};
