use crate::device::{DeviceId, UploadContext};
use crate::store::StoredArtifact;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A locally stored artifact pending backend delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadQueueEntry {
    pub file_id: String,
    pub file_name: String,
    pub size: u64,
    /// The artifact is fully committed to local storage
    pub transferred: bool,
    pub device_id: DeviceId,
    pub campaign_id: u64,
    pub local_path: PathBuf,
    pub checksum: String,
    pub context: UploadContext,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl UploadQueueEntry {
    pub fn file_id_for(device_id: DeviceId, campaign_id: u64, file_name: &str) -> String {
        format!("{device_id}/{campaign_id}/{file_name}")
    }

    pub fn from_artifact(
        context: UploadContext,
        campaign_id: u64,
        file_name: &str,
        artifact: StoredArtifact,
    ) -> Self {
        let device_id = context.machine_id;
        Self {
            file_id: Self::file_id_for(device_id, campaign_id, file_name),
            file_name: file_name.to_string(),
            size: artifact.size,
            transferred: true,
            device_id,
            campaign_id,
            local_path: artifact.path,
            checksum: artifact.checksum,
            context,
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_enqueued: u64,
    pub total_uploaded: u64,
    pub total_failed_attempts: u64,
    pub bytes_uploaded: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
}

/// What one `process_queue` pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub attempted: usize,
    pub uploaded: Vec<String>,
    pub failed: Vec<String>,
    /// Entries left untouched because the queue was paused mid-pass
    pub skipped: usize,
}
