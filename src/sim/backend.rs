use crate::backend::{BackendApi, BackendError, BackendResult, BleStatus, UploadReceipt, UploadRequest};
use crate::device::{DeviceId, UploadContext};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedUpload {
    pub context: UploadContext,
    pub campaign_id: u64,
    pub file_name: String,
    pub size: usize,
}

/// Simulated backend recording every call.
#[derive(Default)]
pub struct SimBackend {
    uploads: RwLock<Vec<RecordedUpload>>,
    statuses: RwLock<Vec<(DeviceId, BleStatus)>>,
    failing_files: RwLock<HashSet<String>>,
    fail_all_uploads: AtomicBool,
    fail_statuses: AtomicBool,
    upload_attempts: AtomicU32,
    upload_latency: RwLock<Duration>,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uploads of `name` fail until cleared
    pub fn fail_file(&self, name: &str) {
        self.failing_files.write().insert(name.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_files.write().clear();
        self.fail_all_uploads.store(false, Ordering::SeqCst);
    }

    pub fn fail_all_uploads(&self, fail: bool) {
        self.fail_all_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_statuses(&self, fail: bool) {
        self.fail_statuses.store(fail, Ordering::SeqCst);
    }

    /// Time each upload takes before it is accepted or rejected
    pub fn set_upload_latency(&self, latency: Duration) {
        *self.upload_latency.write() = latency;
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.read().clone()
    }

    pub fn uploaded_names(&self) -> Vec<String> {
        self.uploads.read().iter().map(|u| u.file_name.clone()).collect()
    }

    pub fn upload_attempts(&self) -> u32 {
        self.upload_attempts.load(Ordering::SeqCst)
    }

    pub fn statuses(&self) -> Vec<(DeviceId, BleStatus)> {
        self.statuses.read().clone()
    }
}

#[async_trait]
impl BackendApi for SimBackend {
    async fn post_ble_status(&self, device_id: DeviceId, status: BleStatus) -> BackendResult<()> {
        if self.fail_statuses.load(Ordering::SeqCst) {
            return Err(BackendError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        self.statuses.write().push((device_id, status));
        Ok(())
    }

    async fn upload_file(&self, request: UploadRequest) -> BackendResult<UploadReceipt> {
        self.upload_attempts.fetch_add(1, Ordering::SeqCst);
        let latency = *self.upload_latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.fail_all_uploads.load(Ordering::SeqCst)
            || self.failing_files.read().contains(&request.file_name)
        {
            return Err(BackendError::Status {
                status: 500,
                body: format!("could not store {}", request.file_name),
            });
        }

        let mut uploads = self.uploads.write();
        uploads.push(RecordedUpload {
            context: request.context,
            campaign_id: request.campaign_id,
            file_name: request.file_name,
            size: request.data.len(),
        });
        Ok(UploadReceipt {
            remote_id: Some(format!("sim-{}", uploads.len())),
        })
    }
}
