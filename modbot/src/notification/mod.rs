//! Notifications about state changes, failures and rate-limit degradation.

pub mod events;
pub mod hub;

pub use events::{
    Notification, NotificationEvent, NotificationEventTypeInfo, NotificationPriority,
    canonicalize_subscription_event_name, notification_event_types,
};
pub use hub::{NotificationHub, NotificationSink};
