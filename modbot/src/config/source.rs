//! Where community configuration documents come from.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

/// Supplies the raw configuration document of each managed community.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Names of every community that should be managed.
    async fn communities(&self) -> crate::Result<Vec<String>>;

    async fn fetch(&self, community: &str) -> crate::Result<String>;
}

/// Hex-encoded SHA-256 of a raw document, used for change detection.
pub fn content_hash(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// Config source backed by an in-process map.
#[derive(Debug, Default)]
pub struct MemoryConfigSource {
    documents: RwLock<BTreeMap<String, String>>,
}

impl MemoryConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(self, community: impl Into<String>, raw: impl Into<String>) -> Self {
        self.set(community, raw);
        self
    }

    pub fn set(&self, community: impl Into<String>, raw: impl Into<String>) {
        self.documents.write().insert(community.into(), raw.into());
    }

    pub fn remove(&self, community: &str) -> Option<String> {
        self.documents.write().remove(community)
    }
}

#[async_trait]
impl ConfigSource for MemoryConfigSource {
    async fn communities(&self) -> crate::Result<Vec<String>> {
        Ok(self.documents.read().keys().cloned().collect())
    }

    async fn fetch(&self, community: &str) -> crate::Result<String> {
        self.documents
            .read()
            .get(community)
            .cloned()
            .ok_or_else(|| crate::Error::not_found("community configuration", community))
    }
}
