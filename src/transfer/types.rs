use crate::device::DeviceId;
use crate::error::FleetError;
use crate::transport::TransportKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferPhase {
    Idle,
    Initializing,
    Connecting,
    Probing,
    Downloading,
    Storing,
    Uploading,
    Cleanup,
    Completed,
    Error,
}

impl TransferPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferPhase::Completed | TransferPhase::Error)
    }

    /// Counts toward the global activity indicator
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != TransferPhase::Idle
    }
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferPhase::Idle => "idle",
            TransferPhase::Initializing => "initializing",
            TransferPhase::Connecting => "connecting",
            TransferPhase::Probing => "probing",
            TransferPhase::Downloading => "downloading",
            TransferPhase::Storing => "storing",
            TransferPhase::Uploading => "uploading",
            TransferPhase::Cleanup => "cleanup",
            TransferPhase::Completed => "completed",
            TransferPhase::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub device_id: DeviceId,
    pub campaign_id: u64,
    /// Restrict the job to these file names; `None` takes every probed file
    pub files: Option<Vec<String>>,
}

impl TransferRequest {
    pub fn campaign(device_id: impl Into<DeviceId>, campaign_id: u64) -> Self {
        Self {
            device_id: device_id.into(),
            campaign_id,
            files: None,
        }
    }

    pub fn only(mut self, files: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.files = Some(files.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferJob {
    pub id: Uuid,
    pub device_id: DeviceId,
    pub campaign_id: u64,
    pub requested_files: Option<Vec<String>>,
    /// Chosen once per attempt
    pub transport: Option<TransportKind>,
    pub phase: TransferPhase,
    pub retry_count: u32,
    pub max_retries: u32,
    pub file_count: usize,
    pub files_done: usize,
    pub total_bytes: u64,
    pub bytes_done: u64,
    pub error: Option<FleetError>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransferJob {
    pub fn new(request: &TransferRequest, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: request.device_id,
            campaign_id: request.campaign_id,
            requested_files: request.files.clone(),
            transport: None,
            phase: TransferPhase::Idle,
            retry_count: 0,
            max_retries,
            file_count: 0,
            files_done: 0,
            total_bytes: 0,
            bytes_done: 0,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            job_id: self.id,
            device_id: self.device_id,
            phase: self.phase,
            transport: self.transport,
            files_done: self.files_done,
            file_count: self.file_count,
            bytes_done: self.bytes_done,
            total_bytes: self.total_bytes,
            retry_count: self.retry_count,
        }
    }
}

/// Snapshot handed to progress callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub job_id: Uuid,
    pub device_id: DeviceId,
    pub phase: TransferPhase,
    pub transport: Option<TransportKind>,
    pub files_done: usize,
    pub file_count: usize,
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub retry_count: u32,
}

pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;
