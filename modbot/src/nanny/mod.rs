//! API budget tracking and admission control.

pub mod budget;
pub mod service;

pub use budget::{BudgetSnapshot, RateBudgetTracker, WINDOW_DELTAS};
pub use service::{
    AdmissionNanny, ManagedCommunity, NannyConfig, NannyDecision, NannyLimit, NannyMode,
};
