use crate::device::{DeviceId, HardwareAddress};
use crate::transfer::TransferPhase;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum FleetEvent {
    /// The user signed out; every session and pending upload is torn down
    LoggedOut,
    DeviceDiscovered {
        device_id: Option<DeviceId>,
        address: HardwareAddress,
        rssi: i16,
    },
    ScanFinished {
        results: usize,
    },
    Connecting {
        device_id: DeviceId,
    },
    Connected {
        device_id: DeviceId,
    },
    ConnectFailed {
        device_id: DeviceId,
        error: String,
    },
    Disconnected {
        device_id: DeviceId,
    },
    ProbeCompleted {
        device_id: DeviceId,
        campaign_id: u64,
        file_count: usize,
        total_size: u64,
    },
    JobPhaseChanged {
        job_id: Uuid,
        device_id: DeviceId,
        phase: TransferPhase,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
    /// Stays visible until the user acknowledges it
    pub requires_ack: bool,
}

impl Notification {
    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Info,
            title: title.into(),
            message: message.into(),
            requires_ack: false,
        }
    }

    pub fn persistent_error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Error,
            title: title.into(),
            message: message.into(),
            requires_ack: true,
        }
    }
}
