//! Notification events.
//!
//! Defines the events that can trigger notifications and their priority levels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{CausedBy, Facet, RunState};
use crate::nanny::NannyMode;

/// Static metadata about a supported notification event type.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct NotificationEventTypeInfo {
    /// Canonical subscription key (snake_case).
    pub event_type: &'static str,
    pub label: &'static str,
    /// Additional accepted subscription keys.
    pub aliases: &'static [&'static str],
}

const NOTIFICATION_EVENT_TYPES: &[NotificationEventTypeInfo] = &[
    NotificationEventTypeInfo {
        event_type: "state_changed",
        label: "Running State Changed",
        aliases: &["state.changed", "RunStateChanged", "running_state"],
    },
    NotificationEventTypeInfo {
        event_type: "polling_error",
        label: "Polling Error",
        aliases: &["poll.error", "PollingError"],
    },
    NotificationEventTypeInfo {
        event_type: "serious_error",
        label: "Serious Error",
        aliases: &["serious.error", "SeriousError", "halted"],
    },
    NotificationEventTypeInfo {
        event_type: "config_reloaded",
        label: "Configuration Reloaded",
        aliases: &["config.reloaded", "ConfigReloaded"],
    },
    NotificationEventTypeInfo {
        event_type: "config_invalid",
        label: "Configuration Invalid",
        aliases: &["config.invalid", "ConfigInvalid"],
    },
    NotificationEventTypeInfo {
        event_type: "nanny_mode",
        label: "Rate Limit Nanny",
        aliases: &["nanny.mode", "NannyModeChanged", "ratelimit"],
    },
];

pub fn notification_event_types() -> &'static [NotificationEventTypeInfo] {
    NOTIFICATION_EVENT_TYPES
}

/// Resolve a subscription key or alias to its canonical event type.
pub fn canonicalize_subscription_event_name(input: &str) -> Option<&'static str> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let normalized_input = normalize_subscription_key(trimmed);
    NOTIFICATION_EVENT_TYPES
        .iter()
        .find(|info| {
            normalize_subscription_key(info.event_type) == normalized_input
                || info
                    .aliases
                    .iter()
                    .any(|alias| normalize_subscription_key(alias) == normalized_input)
        })
        .map(|info| info.event_type)
}

fn normalize_subscription_key(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .filter(|c| !matches!(c, '_' | '.' | '-' | ' '))
        .collect()
}

/// Priority level for notifications.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum NotificationPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for NotificationPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Events that can trigger notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NotificationEvent {
    /// A manager, events or queue state changed (or changed causer).
    RunStateChanged {
        community: String,
        facet: Facet,
        state: RunState,
        caused_by: CausedBy,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    PollingError {
        community: String,
        source: String,
        error: String,
        fatal: bool,
        timestamp: DateTime<Utc>,
    },
    /// An item error that halted the community.
    SeriousError {
        community: String,
        item_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    ConfigReloaded {
        community: String,
        changed: bool,
        caused_by: CausedBy,
        timestamp: DateTime<Utc>,
    },
    ConfigInvalid {
        community: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    NannyModeChanged {
        from: NannyMode,
        to: NannyMode,
        remaining: Option<u32>,
        depletion_secs: Option<f64>,
        communities: Vec<String>,
        timestamp: DateTime<Utc>,
    },
}

impl NotificationEvent {
    pub fn state_changed(
        community: &str,
        facet: Facet,
        state: RunState,
        caused_by: CausedBy,
        reason: Option<&str>,
    ) -> Self {
        Self::RunStateChanged {
            community: community.to_string(),
            facet,
            state,
            caused_by,
            reason: reason.map(str::to_string),
            timestamp: Utc::now(),
        }
    }

    pub fn priority(&self) -> NotificationPriority {
        match self {
            Self::RunStateChanged { caused_by, .. } => match caused_by {
                CausedBy::User => NotificationPriority::Low,
                CausedBy::System => NotificationPriority::Normal,
            },
            Self::PollingError { fatal, .. } => {
                if *fatal {
                    NotificationPriority::High
                } else {
                    NotificationPriority::Low
                }
            }
            Self::SeriousError { .. } => NotificationPriority::Critical,
            Self::ConfigReloaded { .. } => NotificationPriority::Low,
            Self::ConfigInvalid { .. } => NotificationPriority::High,
            Self::NannyModeChanged { to, .. } => match to {
                NannyMode::Hard => NotificationPriority::Critical,
                NannyMode::Soft => NotificationPriority::High,
                NannyMode::None => NotificationPriority::Normal,
            },
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStateChanged { .. } => "state_changed",
            Self::PollingError { .. } => "polling_error",
            Self::SeriousError { .. } => "serious_error",
            Self::ConfigReloaded { .. } => "config_reloaded",
            Self::ConfigInvalid { .. } => "config_invalid",
            Self::NannyModeChanged { .. } => "nanny_mode",
        }
    }

    pub fn title(&self) -> String {
        match self {
            Self::RunStateChanged {
                community,
                facet,
                state,
                ..
            } => format!("{} {} {}", community, facet, state),
            Self::PollingError {
                community,
                source,
                fatal,
                ..
            } => {
                if *fatal {
                    format!("{} stopped polling {}", community, source)
                } else {
                    format!("{} polling {} failed", community, source)
                }
            }
            Self::SeriousError { community, .. } => format!("{} halted", community),
            Self::ConfigReloaded { community, .. } => {
                format!("{} configuration reloaded", community)
            }
            Self::ConfigInvalid { community, .. } => {
                format!("{} configuration invalid", community)
            }
            Self::NannyModeChanged { to, .. } => match to {
                NannyMode::None => "API budget recovered".to_string(),
                NannyMode::Soft => "API budget low, slowing down".to_string(),
                NannyMode::Hard => "API budget critical, polling paused".to_string(),
            },
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::RunStateChanged {
                caused_by, reason, ..
            } => match reason {
                Some(reason) => format!("Caused by {}: {}", caused_by, reason),
                None => format!("Caused by {}", caused_by),
            },
            Self::PollingError { error, .. } => error.clone(),
            Self::SeriousError { item_id, error, .. } => {
                format!("Processing {} failed: {}", item_id, error)
            }
            Self::ConfigReloaded { changed, .. } => {
                if *changed {
                    "Configuration changed and was applied".to_string()
                } else {
                    "Configuration unchanged".to_string()
                }
            }
            Self::ConfigInvalid { error, .. } => error.clone(),
            Self::NannyModeChanged {
                from,
                remaining,
                depletion_secs,
                communities,
                ..
            } => {
                let mut desc = format!("Previous mode: {}", from);
                if let Some(remaining) = remaining {
                    desc.push_str(&format!(", remaining budget: {}", remaining));
                }
                if let Some(secs) = depletion_secs {
                    desc.push_str(&format!(", estimated depletion in {:.1}s", secs));
                }
                if !communities.is_empty() {
                    desc.push_str(&format!(", affected: {}", communities.join(", ")));
                }
                desc
            }
        }
    }

    pub fn community(&self) -> Option<&str> {
        match self {
            Self::RunStateChanged { community, .. }
            | Self::PollingError { community, .. }
            | Self::SeriousError { community, .. }
            | Self::ConfigReloaded { community, .. }
            | Self::ConfigInvalid { community, .. } => Some(community),
            Self::NannyModeChanged { .. } => None,
        }
    }

    pub fn caused_by(&self) -> CausedBy {
        match self {
            Self::RunStateChanged { caused_by, .. } | Self::ConfigReloaded { caused_by, .. } => {
                *caused_by
            }
            _ => CausedBy::System,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RunStateChanged { timestamp, .. }
            | Self::PollingError { timestamp, .. }
            | Self::SeriousError { timestamp, .. }
            | Self::ConfigReloaded { timestamp, .. }
            | Self::ConfigInvalid { timestamp, .. }
            | Self::NannyModeChanged { timestamp, .. } => *timestamp,
        }
    }
}

/// Rendered notification handed to sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub event_type: String,
    pub title: String,
    pub body: String,
    pub caused_by: CausedBy,
    pub priority: NotificationPriority,
    pub community: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl From<&NotificationEvent> for Notification {
    fn from(event: &NotificationEvent) -> Self {
        Self {
            event_type: event.event_type().to_string(),
            title: event.title(),
            body: event.description(),
            caused_by: event.caused_by(),
            priority: event.priority(),
            community: event.community().map(str::to_string),
            timestamp: event.timestamp(),
        }
    }
}
