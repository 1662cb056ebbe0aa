//! Service container for dependency injection.
//!
//! The ServiceContainer builds one [`Manager`] per community listed by the
//! configuration source, wires the shared collaborators into each, and
//! owns the admission nanny that watches the shared API budget.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use platform_api::ApiClient;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::{ConfigSource, GlobalDefaults};
use crate::domain::{CausedBy, RunState};
use crate::manager::{Manager, ManagerContext};
use crate::nanny::{AdmissionNanny, NannyMode};
use crate::notification::NotificationHub;
use crate::rules::RuleEngine;
use crate::sink::ResultSink;

/// Default shutdown timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Service container holding every community manager.
pub struct ServiceContainer {
    /// Notification hub shared by all managers and the nanny.
    pub hub: Arc<NotificationHub>,
    /// Admission control over the shared API budget.
    pub nanny: Arc<AdmissionNanny>,
    context: ManagerContext,
    managers: DashMap<String, Arc<Manager>>,
    /// Cancellation token for graceful shutdown.
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    pub fn new(
        client: Arc<dyn ApiClient>,
        engine: Arc<dyn RuleEngine>,
        sink: Arc<dyn ResultSink>,
        config_source: Arc<dyn ConfigSource>,
        global: GlobalDefaults,
    ) -> Self {
        let hub = Arc::new(NotificationHub::new());
        let nanny = Arc::new(AdmissionNanny::new(
            global.nanny.clone(),
            client.clone(),
            hub.clone(),
        ));
        let context = ManagerContext {
            client,
            engine,
            sink,
            hub: hub.clone(),
            config_source,
            global: Arc::new(global),
        };

        Self {
            hub,
            nanny,
            context,
            managers: DashMap::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Build a manager for every community the source lists, load each
    /// configuration and start the nanny. Returns the number of managers.
    ///
    /// A community whose configuration fails to load still gets a manager;
    /// it refuses to start until a valid document is reloaded.
    pub async fn initialize(&self) -> Result<usize> {
        info!("Initializing services");

        let communities = self.context.config_source.communities().await?;
        for name in communities {
            self.add_community(&name).await;
        }

        self.nanny
            .clone()
            .start_monitoring(self.cancellation_token.child_token());

        info!("Initialized {} community managers", self.managers.len());
        Ok(self.managers.len())
    }

    /// Create, load and register a manager. Returns the existing manager if
    /// the community is already known.
    pub async fn add_community(&self, name: &str) -> Arc<Manager> {
        if let Some(existing) = self.manager(name) {
            return existing;
        }

        let manager = Manager::new(name, self.context.clone(), &self.cancellation_token);
        if let Err(e) = manager.reload(CausedBy::System, false).await {
            warn!(community = %name, error = %e, "Configuration failed to load");
        }

        // Another call may have registered the same community during the reload.
        let winner = match self.managers.entry(name.to_string()) {
            Entry::Occupied(existing) => Some(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(manager.clone());
                None
            }
        };
        if let Some(existing) = winner {
            debug!(community = %name, "Manager added concurrently, discarding duplicate");
            manager.shutdown().await;
            return existing;
        }

        self.nanny.register(manager.clone());
        debug!(community = %name, "Manager registered");
        manager
    }

    /// Stop and forget a community.
    pub async fn remove_community(&self, name: &str) -> bool {
        let Some((_, manager)) = self.managers.remove(name) else {
            return false;
        };
        self.nanny.unregister(name);
        manager.shutdown().await;
        info!(community = %name, "Manager removed");
        true
    }

    /// Start every manager with a valid configuration. Returns how many
    /// started.
    pub async fn start_all(&self, caused_by: CausedBy) -> usize {
        let managers = self.managers();
        let results = join_all(managers.iter().map(|m| m.start(caused_by))).await;

        let mut started = 0;
        for (manager, result) in managers.iter().zip(results) {
            match result {
                Ok(()) => started += 1,
                Err(e) => {
                    warn!(community = %manager.name(), error = %e, "Manager failed to start");
                }
            }
        }
        info!("Started {} of {} managers", started, self.managers.len());
        started
    }

    pub async fn stop_all(&self, caused_by: CausedBy) {
        for manager in self.managers() {
            if let Err(e) = manager.stop(caused_by).await {
                warn!(community = %manager.name(), error = %e, "Manager failed to stop");
            }
        }
    }

    /// Reload every community's configuration. Returns how many changed.
    pub async fn reload_all(&self, caused_by: CausedBy) -> usize {
        let mut changed = 0;
        for manager in self.managers() {
            match manager.reload(caused_by, false).await {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(community = %manager.name(), error = %e, "Reload failed");
                }
            }
        }
        changed
    }

    /// Shutdown all services gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Shutdown all services gracefully with a custom timeout.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);

        // Signal all background tasks to stop
        self.cancellation_token.cancel();

        let managers = self.managers();
        let shutdown_result =
            tokio::time::timeout(timeout, join_all(managers.iter().map(|m| m.shutdown()))).await;

        if shutdown_result.is_err() {
            warn!("Shutdown timeout reached, forcing shutdown");
        }

        info!("Services shut down");
        Ok(())
    }

    pub fn manager(&self, name: &str) -> Option<Arc<Manager>> {
        self.managers.get(name).map(|entry| entry.value().clone())
    }

    /// All managers, ordered by community name.
    pub fn managers(&self) -> Vec<Arc<Manager>> {
        let mut managers: Vec<_> = self
            .managers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        managers.sort_by(|a, b| a.name().cmp(b.name()));
        managers
    }

    /// Get the cancellation token for external use.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub fn stats(&self) -> ServiceStats {
        let managers = self.managers();
        let statuses: Vec<_> = managers.iter().map(|m| m.status()).collect();
        ServiceStats {
            community_count: statuses.len(),
            running_count: statuses
                .iter()
                .filter(|s| s.states.manager.state == RunState::Running)
                .count(),
            invalid_config_count: statuses.iter().filter(|s| !s.valid_config).count(),
            queued_items: statuses.iter().map(|s| s.queue_len).sum(),
            delayed_items: statuses.iter().map(|s| s.delayed).sum(),
            nanny_mode: self.nanny.mode(),
            budget_remaining: self.nanny.budget().remaining,
            notification_sinks: self.hub.sink_count(),
        }
    }
}

/// Service statistics.
#[derive(Debug, Clone)]
pub struct ServiceStats {
    /// Number of managed communities.
    pub community_count: usize,
    /// Number of managers currently running.
    pub running_count: usize,
    pub invalid_config_count: usize,
    /// Items waiting in worker queues across communities.
    pub queued_items: usize,
    pub delayed_items: usize,
    pub nanny_mode: NannyMode,
    pub budget_remaining: Option<u32>,
    pub notification_sinks: usize,
}
