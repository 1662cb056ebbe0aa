//! Service layer module.
//!
//! This module provides the service container that builds and owns every
//! community manager.

pub mod container;

pub use container::{ServiceContainer, ServiceStats};
