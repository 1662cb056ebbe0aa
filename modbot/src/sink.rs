//! Persistence seam for evaluation results.

use async_trait::async_trait;
use tracing::trace;

use crate::rules::RunResult;

/// Receives every finished [`RunResult`]. Saves are fire-and-forget; a
/// failure is logged by the caller and never affects processing.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn save(&self, result: RunResult) -> crate::Result<()>;
}

/// Sink that drops results.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

#[async_trait]
impl ResultSink for DiscardSink {
    async fn save(&self, result: RunResult) -> crate::Result<()> {
        trace!(item_id = %result.item_id, "Discarding run result");
        Ok(())
    }
}
