use crate::backend::error::BackendResult;
use crate::backend::types::{BleStatus, UploadReceipt, UploadRequest};
use crate::device::DeviceId;
use async_trait::async_trait;

#[async_trait]
pub trait BackendApi: Send + Sync {
    /// Connection lifecycle telemetry (`POST /machine/{id}/ble-status`)
    async fn post_ble_status(&self, device_id: DeviceId, status: BleStatus) -> BackendResult<()>;

    /// Deliver one retrieved file; success means the backend stored it
    async fn upload_file(&self, request: UploadRequest) -> BackendResult<UploadReceipt>;
}
