use crate::events::{Notification, NotificationSink};
use parking_lot::RwLock;

/// Sink that keeps everything it is told, for assertions.
#[derive(Default)]
pub struct RecordingSink {
    notifications: RwLock<Vec<Notification>>,
    busy: RwLock<Vec<bool>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.read().clone()
    }

    /// Every busy value set, in order
    pub fn busy_history(&self) -> Vec<bool> {
        self.busy.read().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.read().last().copied().unwrap_or(false)
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: Notification) {
        self.notifications.write().push(notification);
    }

    fn set_busy(&self, busy: bool) {
        self.busy.write().push(busy);
    }
}
