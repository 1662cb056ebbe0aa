//! Layered configuration.
//!
//! Global defaults (optionally overridden from the environment) form the
//! base layer; each community's document is applied on top and resolved
//! once per load into a [`ResolvedConfig`].

pub mod defaults;
pub mod document;
pub mod resolved;
pub mod settings;
pub mod source;

pub use defaults::GlobalDefaults;
pub use document::{CommunityDocument, PollingDefinition, PollingEntry, QueueOverrides};
pub use resolved::{ResolvedConfig, ResolvedConfigBuilder};
pub use settings::Settings;
pub use source::{ConfigSource, MemoryConfigSource, content_hash};
