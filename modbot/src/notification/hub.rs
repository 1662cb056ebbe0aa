//! Fan-out of notification events to subscribers and sinks.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::events::{Notification, NotificationEvent, canonicalize_subscription_event_name};

/// Delivers rendered notifications somewhere outside the process.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, notification: &Notification) -> crate::Result<()>;
}

struct SinkRegistration {
    sink: Arc<dyn NotificationSink>,
    /// Canonical event types; `None` means every event.
    event_types: Option<HashSet<&'static str>>,
}

impl SinkRegistration {
    fn wants(&self, event_type: &str) -> bool {
        self.event_types
            .as_ref()
            .is_none_or(|types| types.contains(event_type))
    }
}

/// Shared event bus. Publishing never blocks; sink delivery is spawned.
pub struct NotificationHub {
    event_tx: broadcast::Sender<NotificationEvent>,
    sinks: RwLock<Vec<SinkRegistration>>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            event_tx,
            sinks: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.event_tx.subscribe()
    }

    /// Register a sink for every event.
    pub fn add_sink(&self, sink: Arc<dyn NotificationSink>) {
        self.sinks.write().push(SinkRegistration {
            sink,
            event_types: None,
        });
    }

    /// Register a sink for the given event types (aliases accepted).
    /// Unknown names are ignored with a warning.
    pub fn add_sink_for(&self, sink: Arc<dyn NotificationSink>, subscriptions: &[&str]) {
        let mut event_types = HashSet::new();
        for name in subscriptions {
            match canonicalize_subscription_event_name(name) {
                Some(event_type) => {
                    event_types.insert(event_type);
                }
                None => warn!(sink = sink.name(), event = name, "Unknown notification event"),
            }
        }
        self.sinks.write().push(SinkRegistration {
            sink,
            event_types: Some(event_types),
        });
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.read().len()
    }

    pub fn publish(&self, event: NotificationEvent) {
        debug!(
            event_type = event.event_type(),
            priority = %event.priority(),
            "Publishing notification"
        );

        let notification = Notification::from(&event);
        let targets: Vec<_> = self
            .sinks
            .read()
            .iter()
            .filter(|reg| reg.wants(&notification.event_type))
            .map(|reg| Arc::clone(&reg.sink))
            .collect();

        let _ = self.event_tx.send(event);

        if targets.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available, dropping notification delivery");
            return;
        };
        runtime.spawn(async move {
            for sink in targets {
                if let Err(e) = sink.notify(&notification).await {
                    warn!(sink = sink.name(), error = %e, "Notification delivery failed");
                }
            }
        });
    }
}
