use crate::events::types::{Notification, NotificationLevel};

/// User-facing signalling owned by the embedding application.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);

    /// Global "activity in progress" indicator
    fn set_busy(&self, busy: bool);
}

/// Sink that only logs; the default when the application wires nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, notification: Notification) {
        match notification.level {
            NotificationLevel::Info => {
                tracing::info!(title = %notification.title, "{}", notification.message)
            }
            NotificationLevel::Warning => {
                tracing::warn!(title = %notification.title, "{}", notification.message)
            }
            NotificationLevel::Error => tracing::error!(
                title = %notification.title,
                requires_ack = notification.requires_ack,
                "{}",
                notification.message
            ),
        }
    }

    fn set_busy(&self, busy: bool) {
        tracing::debug!(busy, "activity indicator");
    }
}
