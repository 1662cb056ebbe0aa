//! # Platform API
//!
//! The platform-facing vocabulary shared by the modbot engine: content items,
//! listings, content sources and the [`ApiClient`] trait the engine drives.
//!
//! The HTTP and authentication internals of a concrete client live outside
//! this crate. The engine only needs to fetch listings, read the shared
//! rate-limit budget, perform moderation actions and re-fetch single items.

pub mod client;
pub mod error;
pub mod item;
pub mod listing;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{ActionRequest, ApiClient};
pub use error::ApiError;
pub use item::{Item, ItemKind};
pub use listing::{FetchOptions, Listing, SourceKind};
