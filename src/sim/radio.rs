use crate::device::{DeviceIdentity, HardwareAddress};
use crate::transport::{
    Advertisement, BulkDriver, Opcode, RadioDriver, RemoteFile, ScanRequest, SessionHandle,
    TransportError, TransportResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct SimDevice {
    name: String,
    rssi: i16,
    /// Advertise with the byte order reversed, like some firmware batches
    reversed: bool,
    campaigns: HashMap<u64, Vec<(RemoteFile, Bytes)>>,
}

/// Simulated radio with scripted devices and injectable failures.
pub struct SimRadio {
    devices: RwLock<HashMap<HardwareAddress, SimDevice>>,
    sessions: RwLock<HashMap<SessionHandle, HardwareAddress>>,
    next_handle: AtomicU64,
    scan_duration: RwLock<Duration>,
    request_latency: RwLock<Duration>,

    fail_connects: AtomicU32,
    fail_reads: AtomicU32,
    fail_all_reads: AtomicBool,
    fail_lists: AtomicU32,
    drop_link_on_read: AtomicBool,
    fail_disconnects: AtomicBool,

    radio_busy: AtomicBool,
    overlaps: AtomicU32,

    scan_calls: AtomicU32,
    stop_scan_calls: AtomicU32,
    connect_calls: AtomicU32,
    disconnect_calls: AtomicU32,
    list_calls: AtomicU32,
    read_calls: AtomicU32,
    delete_calls: AtomicU32,
}

impl Default for SimRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRadio {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            scan_duration: RwLock::new(Duration::from_millis(100)),
            request_latency: RwLock::new(Duration::ZERO),
            fail_connects: AtomicU32::new(0),
            fail_reads: AtomicU32::new(0),
            fail_all_reads: AtomicBool::new(false),
            fail_lists: AtomicU32::new(0),
            drop_link_on_read: AtomicBool::new(false),
            fail_disconnects: AtomicBool::new(false),
            radio_busy: AtomicBool::new(false),
            overlaps: AtomicU32::new(0),
            scan_calls: AtomicU32::new(0),
            stop_scan_calls: AtomicU32::new(0),
            connect_calls: AtomicU32::new(0),
            disconnect_calls: AtomicU32::new(0),
            list_calls: AtomicU32::new(0),
            read_calls: AtomicU32::new(0),
            delete_calls: AtomicU32::new(0),
        }
    }

    pub fn add_device(&self, address: HardwareAddress, name: &str, rssi: i16) {
        self.devices.write().insert(
            address,
            SimDevice {
                name: name.to_string(),
                rssi,
                reversed: false,
                campaigns: HashMap::new(),
            },
        );
    }

    pub fn advertise_reversed(&self, address: HardwareAddress) {
        if let Some(device) = self.devices.write().get_mut(&address) {
            device.reversed = true;
        }
    }

    pub fn remove_device(&self, address: HardwareAddress) {
        self.devices.write().remove(&address);
    }

    pub fn add_file(&self, address: HardwareAddress, campaign_id: u64, name: &str, data: Vec<u8>) {
        if let Some(device) = self.devices.write().get_mut(&address) {
            let file = RemoteFile::new(name, data.len() as u64);
            device
                .campaigns
                .entry(campaign_id)
                .or_default()
                .push((file, Bytes::from(data)));
        }
    }

    pub fn remote_files(&self, address: HardwareAddress, campaign_id: u64) -> Vec<String> {
        self.devices
            .read()
            .get(&address)
            .and_then(|d| d.campaigns.get(&campaign_id))
            .map(|files| files.iter().map(|(f, _)| f.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn file_data(&self, address: HardwareAddress, campaign_id: u64, name: &str) -> Option<Bytes> {
        self.devices
            .read()
            .get(&address)
            .and_then(|d| d.campaigns.get(&campaign_id))
            .and_then(|files| files.iter().find(|(f, _)| f.name == name))
            .map(|(_, data)| data.clone())
    }

    pub fn set_scan_duration(&self, duration: Duration) {
        *self.scan_duration.write() = duration;
    }

    pub fn set_request_latency(&self, latency: Duration) {
        *self.request_latency.write() = latency;
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.fail_connects.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_reads(&self, count: u32) {
        self.fail_reads.store(count, Ordering::SeqCst);
    }

    pub fn fail_all_reads(&self, fail: bool) {
        self.fail_all_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next_lists(&self, count: u32) {
        self.fail_lists.store(count, Ordering::SeqCst);
    }

    /// The next read drops the link instead of answering
    pub fn drop_link_on_read(&self, drop: bool) {
        self.drop_link_on_read.store(drop, Ordering::SeqCst);
    }

    /// Disconnects still end the session but report an error
    pub fn fail_disconnects(&self, fail: bool) {
        self.fail_disconnects.store(fail, Ordering::SeqCst);
    }

    /// Simulate the device walking out of range: every session to it ends
    pub fn sever(&self, address: HardwareAddress) {
        self.sessions.write().retain(|_, a| *a != address);
    }

    pub fn is_connected(&self, address: HardwareAddress) -> bool {
        self.sessions.read().values().any(|a| *a == address)
    }

    /// Times a scan and a connect were in flight on the radio together
    pub fn overlaps(&self) -> u32 {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn scan_calls(&self) -> u32 {
        self.scan_calls.load(Ordering::SeqCst)
    }

    pub fn stop_scan_calls(&self) -> u32 {
        self.stop_scan_calls.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> u32 {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u32 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn session_address(&self, handle: SessionHandle) -> TransportResult<HardwareAddress> {
        self.sessions
            .read()
            .get(&handle)
            .copied()
            .ok_or(TransportError::Disconnected)
    }

    fn listing(&self, address: HardwareAddress, campaign_id: u64) -> TransportResult<Bytes> {
        let devices = self.devices.read();
        let device = devices.get(&address).ok_or(TransportError::Disconnected)?;
        let files: Vec<serde_json::Value> = device
            .campaigns
            .get(&campaign_id)
            .map(|files| {
                files
                    .iter()
                    .map(|(f, _)| serde_json::json!({"name": f.name, "size": f.size}))
                    .collect()
            })
            .unwrap_or_default();
        let body = serde_json::to_vec(&serde_json::json!({ "files": files }))?;
        Ok(Bytes::from(body))
    }
}

struct BusyFlag<'a>(&'a AtomicBool);

impl Drop for BusyFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SimRadio {
    fn claim_radio(&self) -> BusyFlag<'_> {
        if self.radio_busy.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        BusyFlag(&self.radio_busy)
    }
}

#[async_trait]
impl RadioDriver for SimRadio {
    async fn scan(&self, request: ScanRequest) -> TransportResult<Vec<Advertisement>> {
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        let _busy = self.claim_radio();

        let wait = (*self.scan_duration.read()).min(request.timeout);
        tokio::time::sleep(wait).await;

        let devices = self.devices.read();
        Ok(devices
            .iter()
            .filter(|(address, _)| {
                request.known_addresses.is_empty()
                    || request.known_addresses.iter().any(|k| k.matches(address))
            })
            .map(|(address, device)| Advertisement {
                address: Some(if device.reversed {
                    address.reversed()
                } else {
                    *address
                }),
                name: Some(device.name.clone()),
                rssi: device.rssi,
            })
            .collect())
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        self.stop_scan_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, address: HardwareAddress) -> TransportResult<SessionHandle> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let _busy = self.claim_radio();

        let latency = *self.request_latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if Self::take_failure(&self.fail_connects) {
            return Err(TransportError::Rejected("handshake failed".into()));
        }

        let known = self.devices.read().keys().copied().find(|a| a.matches(&address));
        let Some(device_address) = known else {
            return Err(TransportError::Unavailable(format!("{address} out of range")));
        };

        let handle = SessionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.sessions.write().insert(handle, device_address);
        Ok(handle)
    }

    async fn disconnect(&self, handle: SessionHandle) -> TransportResult<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.sessions.write().remove(&handle);
        if self.fail_disconnects.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("disconnect not acknowledged".into()));
        }
        Ok(())
    }

    async fn request(
        &self,
        handle: SessionHandle,
        campaign_id: u64,
        opcode: Opcode,
    ) -> TransportResult<Bytes> {
        let latency = *self.request_latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let address = self.session_address(handle)?;

        match opcode {
            Opcode::ListFiles => {
                self.list_calls.fetch_add(1, Ordering::SeqCst);
                if Self::take_failure(&self.fail_lists) {
                    return Err(TransportError::Rejected("listing unavailable".into()));
                }
                self.listing(address, campaign_id)
            }
            Opcode::ReadFile { name } => {
                self.read_calls.fetch_add(1, Ordering::SeqCst);
                if self.drop_link_on_read.swap(false, Ordering::SeqCst) {
                    self.sever(address);
                    return Err(TransportError::Disconnected);
                }
                if self.fail_all_reads.load(Ordering::SeqCst) || Self::take_failure(&self.fail_reads)
                {
                    return Err(TransportError::Rejected(format!("read of {name} failed")));
                }
                self.file_data(address, campaign_id, &name)
                    .ok_or(TransportError::FileNotFound(name))
            }
            Opcode::DeleteFiles { names } => {
                self.delete_calls.fetch_add(1, Ordering::SeqCst);
                if let Some(device) = self.devices.write().get_mut(&address) {
                    if let Some(files) = device.campaigns.get_mut(&campaign_id) {
                        files.retain(|(f, _)| !names.contains(&f.name));
                    }
                }
                Ok(Bytes::new())
            }
        }
    }
}

/// Simulated local-network channel reading from the same devices.
pub struct SimBulk {
    radio: Arc<SimRadio>,
    reachable: AtomicBool,
    fail_downloads: AtomicBool,
    downloads: AtomicU32,
}

impl SimBulk {
    pub fn new(radio: Arc<SimRadio>) -> Self {
        Self {
            radio,
            reachable: AtomicBool::new(true),
            fail_downloads: AtomicBool::new(false),
            downloads: AtomicU32::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn fail_downloads(&self, fail: bool) {
        self.fail_downloads.store(fail, Ordering::SeqCst);
    }

    pub fn downloads(&self) -> u32 {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BulkDriver for SimBulk {
    async fn is_reachable(&self, _device: &DeviceIdentity) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn download(
        &self,
        device: &DeviceIdentity,
        campaign_id: u64,
        file: &RemoteFile,
    ) -> TransportResult<Bytes> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if self.fail_downloads.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("bulk link dropped".into()));
        }
        let address = device
            .address
            .ok_or_else(|| TransportError::Unavailable("no address".into()))?;
        self.radio
            .file_data(address, campaign_id, &file.name)
            .ok_or_else(|| TransportError::FileNotFound(file.name.clone()))
    }
}
