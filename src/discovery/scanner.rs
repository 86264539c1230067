use crate::device::{DeviceId, DeviceIdentity, HardwareAddress};
use crate::discovery::types::{DiscoveryResult, ScanOptions};
use crate::error::{FleetError, FleetResult};
use crate::events::{EventBus, FleetEvent};
use crate::session::{Activity, SessionRegistry};
use crate::transport::{Advertisement, RadioDriver, ScanRequest, TransportResult};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How long a driver may take to hand over its list once the scan window
/// has closed and it was told to stop
pub const SCAN_GRACE: Duration = Duration::from_secs(2);

struct ActiveScan {
    id: u64,
    task: JoinHandle<()>,
}

/// Process-wide discovery over the single radio.
#[derive(Clone)]
pub struct DiscoveryScanner {
    radio: Arc<dyn RadioDriver>,
    registry: SessionRegistry,
    bus: EventBus,
    results: Arc<DashMap<HardwareAddress, DiscoveryResult>>,
    active: Arc<Mutex<Option<ActiveScan>>>,
    scan_ids: Arc<AtomicU64>,
}

impl DiscoveryScanner {
    pub fn new(radio: Arc<dyn RadioDriver>, registry: SessionRegistry, bus: EventBus) -> Self {
        Self {
            radio,
            registry,
            bus,
            results: Arc::new(DashMap::new()),
            active: Arc::new(Mutex::new(None)),
            scan_ids: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start a background scan. Returns false (and logs) if one is already
    /// running; the running scan is left untouched.
    pub fn start_scan(&self, options: ScanOptions) -> bool {
        let mut active = self.active.lock();
        if active.is_some() {
            tracing::warn!("Scan already in progress, ignoring start request");
            return false;
        }

        self.results.clear();
        let id = self.scan_ids.fetch_add(1, Ordering::Relaxed);
        let scanner = self.clone();
        let task = tokio::spawn(async move {
            scanner.run_scan(id, options).await;
        });
        *active = Some(ActiveScan { id, task });
        true
    }

    async fn run_scan(&self, id: u64, options: ScanOptions) {
        let request = ScanRequest {
            timeout: options.timeout,
            known_addresses: if options.only_known_addresses {
                self.registry.known_addresses()
            } else {
                Vec::new()
            },
        };

        tracing::info!(timeout = ?options.timeout, "Scan started");
        match self.collect(request).await {
            Ok(advertisements) => {
                for advertisement in advertisements {
                    self.ingest(advertisement, &options);
                }
            }
            Err(e) => tracing::warn!("Scan failed: {}", e),
        }

        {
            let mut active = self.active.lock();
            if active.as_ref().is_some_and(|scan| scan.id == id) {
                *active = None;
            }
        }
        tracing::info!(results = self.results.len(), "Scan finished");
        self.bus.publish(FleetEvent::ScanFinished {
            results: self.results.len(),
        });
    }

    /// Run one driver scan. When the window closes first the driver is told
    /// to stop and gets [`SCAN_GRACE`] to return what it saw.
    async fn collect(&self, request: ScanRequest) -> TransportResult<Vec<Advertisement>> {
        let window = request.timeout;
        let scan = self.radio.scan(request);
        tokio::pin!(scan);
        if let Ok(result) = tokio::time::timeout(window, &mut scan).await {
            return result;
        }

        tracing::debug!("Scan reached its timeout");
        if let Err(e) = self.radio.stop_scan().await {
            tracing::debug!("stop_scan after timeout: {}", e);
        }
        match tokio::time::timeout(SCAN_GRACE, scan).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(grace = ?SCAN_GRACE, "Driver kept its scan results past the grace period");
                Ok(Vec::new())
            }
        }
    }

    /// Fold one advertisement into the result table. Returns the stored
    /// result when it was inserted or replaced, `None` when it was dropped.
    pub fn ingest(
        &self,
        advertisement: Advertisement,
        options: &ScanOptions,
    ) -> Option<DiscoveryResult> {
        let from_name = advertisement
            .name
            .as_deref()
            .and_then(HardwareAddress::from_advertised_name);

        let address = advertisement.address.or(from_name)?;
        let device = self
            .registry
            .resolve_address(&address)
            .or_else(|| from_name.and_then(|a| self.registry.resolve_address(&a)));

        if options.only_known_addresses && device.is_none() {
            tracing::trace!(%address, "Dropping unknown advertisement");
            return None;
        }

        // Both byte orders of a known device collapse onto its stored address.
        let key = device.as_ref().and_then(|d| d.address).unwrap_or(address);

        let result = DiscoveryResult {
            address,
            name: advertisement.name,
            rssi: advertisement.rssi,
            seen_at: Utc::now(),
            device,
        };

        match self.results.entry(key) {
            Entry::Occupied(mut occupied) => {
                if !options.allow_duplicates && occupied.get().rssi >= result.rssi {
                    return None;
                }
                occupied.insert(result.clone());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(result.clone());
            }
        }

        self.bus.publish(FleetEvent::DeviceDiscovered {
            device_id: result.device.as_ref().map(|d| d.id),
            address: result.address,
            rssi: result.rssi,
        });
        Some(result)
    }

    /// Idempotent; safe to call when nothing is scanning
    pub async fn stop_scan(&self) {
        let active = self.active.lock().take();
        if let Some(scan) = active {
            scan.task.abort();
            // Wait for the task to be dropped so the radio is free on return
            let _ = scan.task.await;
            if let Err(e) = self.radio.stop_scan().await {
                tracing::debug!("stop_scan: {}", e);
            }
            tracing::info!("Scan stopped");
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Known devices first, then strongest signal
    pub fn results(&self) -> Vec<DiscoveryResult> {
        let mut results: Vec<DiscoveryResult> =
            self.results.iter().map(|e| e.value().clone()).collect();
        results.sort_by(|a, b| {
            b.is_known()
                .cmp(&a.is_known())
                .then_with(|| b.rssi.cmp(&a.rssi))
        });
        results
    }

    pub fn clear_results(&self) {
        self.results.clear();
    }

    /// Look for one specific device. Used before connecting; the caller is
    /// responsible for the device's busy slot.
    pub async fn locate(
        &self,
        identity: &DeviceIdentity,
        timeout: Duration,
    ) -> FleetResult<DiscoveryResult> {
        let address = identity.address.ok_or_else(|| FleetError::InvalidAddress {
            device_id: identity.id,
            reason: "no hardware address on record".into(),
        })?;

        self.stop_scan().await;

        let request = ScanRequest {
            timeout,
            known_addresses: vec![address],
        };
        let advertisements = self
            .collect(request)
            .await
            .map_err(|e| FleetError::ScanFailed(e.to_string()))?;

        let found = advertisements
            .into_iter()
            .filter(|adv| {
                adv.address.is_some_and(|a| a.matches(&address))
                    || adv
                        .name
                        .as_deref()
                        .and_then(HardwareAddress::from_advertised_name)
                        .is_some_and(|a| a.matches(&address))
            })
            .max_by_key(|adv| adv.rssi);

        match found {
            Some(adv) => Ok(DiscoveryResult {
                address: adv.address.unwrap_or(address),
                name: adv.name,
                rssi: adv.rssi,
                seen_at: Utc::now(),
                device: Some(identity.clone()),
            }),
            None => Err(FleetError::ScanFailed(format!(
                "device {} ({}) not seen within {:?}",
                identity.id, address, timeout
            ))),
        }
    }

    /// Presence check for one device, holding its `scanning` slot
    pub async fn scan_device(
        &self,
        device_id: DeviceId,
        timeout: Duration,
    ) -> FleetResult<DiscoveryResult> {
        let identity = self
            .registry
            .identity(device_id)
            .ok_or(FleetError::NotFound(device_id))?;
        let _guard = self.registry.try_begin(device_id, Activity::Scanning)?;
        self.locate(&identity, timeout).await
    }
}
