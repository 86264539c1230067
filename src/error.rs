use crate::device::DeviceId;
use thiserror::Error;

/// Failure kinds surfaced by sessions, probes and transfer jobs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FleetError {
    #[error("Device not found: {0}")]
    NotFound(DeviceId),

    #[error("Invalid hardware address for device {device_id}: {reason}")]
    InvalidAddress { device_id: DeviceId, reason: String },

    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Device {0} is not connected")]
    NotConnected(DeviceId),

    #[error("Probe failed: {0}")]
    ProbeFailed(String),

    #[error("No files available for device {device_id} campaign {campaign_id}")]
    NoFilesAvailable { device_id: DeviceId, campaign_id: u64 },

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Device {device_id} is busy ({activity})")]
    Busy { device_id: DeviceId, activity: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl FleetError {
    /// Only these kinds are re-attempted by the transfer orchestrator.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::ConnectFailed(_) | FleetError::DownloadFailed(_) | FleetError::UploadFailed(_)
        )
    }

    /// Short machine-readable kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            FleetError::NotFound(_) => "not_found",
            FleetError::InvalidAddress { .. } => "invalid_address",
            FleetError::ScanFailed(_) => "scan_failed",
            FleetError::ConnectFailed(_) => "connect_failed",
            FleetError::NotConnected(_) => "not_connected",
            FleetError::ProbeFailed(_) => "probe_failed",
            FleetError::NoFilesAvailable { .. } => "no_files_available",
            FleetError::DownloadFailed(_) => "download_failed",
            FleetError::UploadFailed(_) => "upload_failed",
            FleetError::Busy { .. } => "busy",
            FleetError::Storage(_) => "storage",
            FleetError::Cancelled(_) => "cancelled",
        }
    }
}

impl From<crate::store::StoreError> for FleetError {
    fn from(err: crate::store::StoreError) -> Self {
        FleetError::Storage(err.to_string())
    }
}

impl From<crate::queue::QueueError> for FleetError {
    fn from(err: crate::queue::QueueError) -> Self {
        match err {
            crate::queue::QueueError::Upload(message) => FleetError::UploadFailed(message),
            other => FleetError::Storage(other.to_string()),
        }
    }
}

pub type FleetResult<T> = Result<T, FleetError>;
