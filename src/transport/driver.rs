use crate::device::{DeviceIdentity, HardwareAddress};
use crate::transport::error::TransportResult;
use crate::transport::types::{Advertisement, Opcode, RemoteFile, ScanRequest, SessionHandle};
use async_trait::async_trait;
use bytes::Bytes;

/// Short-range radio driver. One physical radio per process; callers must not
/// overlap a scan with a connect.
#[async_trait]
pub trait RadioDriver: Send + Sync {
    /// Listen for advertisements until `request.timeout` elapses.
    async fn scan(&self, request: ScanRequest) -> TransportResult<Vec<Advertisement>>;

    /// Abort a running scan. Drivers without explicit cancellation may ignore it.
    async fn stop_scan(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn connect(&self, address: HardwareAddress) -> TransportResult<SessionHandle>;

    async fn disconnect(&self, handle: SessionHandle) -> TransportResult<()>;

    async fn request(
        &self,
        handle: SessionHandle,
        campaign_id: u64,
        opcode: Opcode,
    ) -> TransportResult<Bytes>;
}

/// Optional faster local-network channel to the same device.
#[async_trait]
pub trait BulkDriver: Send + Sync {
    async fn is_reachable(&self, device: &DeviceIdentity) -> bool;

    async fn download(
        &self,
        device: &DeviceIdentity,
        campaign_id: u64,
        file: &RemoteFile,
    ) -> TransportResult<Bytes>;
}
