//! modbot library crate.
//!
//! Polls community activity streams, admits discovered items through a
//! deduplicating firehose into a bounded worker queue, evaluates them against
//! configured rule runs, and throttles polling when the shared API budget
//! runs low.

pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod manager;
pub mod nanny;
pub mod notification;
pub mod poller;
pub mod queue;
pub mod rules;
pub mod services;
pub mod sink;

pub use error::{Error, Result};
