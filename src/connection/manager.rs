use crate::backend::{BackendApi, BleStatus};
use crate::config::FleetConfig;
use crate::device::DeviceId;
use crate::discovery::DiscoveryScanner;
use crate::error::{FleetError, FleetResult};
use crate::events::{EventBus, FleetEvent};
use crate::metrics;
use crate::session::{Activity, ConnectionStatus, SessionRegistry, SessionUpdate};
use crate::transport::{Opcode, RadioDriver, SessionHandle, TransportError, TransportResult};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Owns the transition of every [`ConnectionSession`](crate::session::ConnectionSession)
/// between disconnected, connecting, connected and error.
#[derive(Clone)]
pub struct ConnectionManager {
    radio: Arc<dyn RadioDriver>,
    scanner: DiscoveryScanner,
    registry: SessionRegistry,
    bus: EventBus,
    backend: Arc<dyn BackendApi>,
    connect_timeout: Duration,
    locate_timeout: Duration,
    /// One locate-and-handshake on the radio at a time, across devices
    radio_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ConnectionManager {
    pub fn new(
        radio: Arc<dyn RadioDriver>,
        scanner: DiscoveryScanner,
        registry: SessionRegistry,
        bus: EventBus,
        backend: Arc<dyn BackendApi>,
        config: &FleetConfig,
    ) -> Self {
        Self {
            radio,
            scanner,
            registry,
            bus,
            backend,
            connect_timeout: config.connect_timeout(),
            locate_timeout: config.locate_timeout(),
            radio_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub async fn connect(&self, device_id: DeviceId) -> FleetResult<SessionHandle> {
        self.connect_with_timeout(device_id, self.connect_timeout).await
    }

    /// Open an exclusive session. Returns the existing handle without touching
    /// the radio when the device is already connected.
    pub async fn connect_with_timeout(
        &self,
        device_id: DeviceId,
        timeout: Duration,
    ) -> FleetResult<SessionHandle> {
        if let Some(handle) = self.handle(device_id) {
            tracing::debug!(%device_id, "Already connected");
            return Ok(handle);
        }

        let identity = self
            .registry
            .identity(device_id)
            .ok_or(FleetError::NotFound(device_id))?;
        let address = identity.address.ok_or_else(|| FleetError::InvalidAddress {
            device_id,
            reason: "no hardware address on record".into(),
        })?;

        let _guard = self.registry.try_begin(device_id, Activity::Connecting)?;
        // Another caller may have finished connecting while we waited for the slot
        if let Some(handle) = self.handle(device_id) {
            return Ok(handle);
        }

        self.registry
            .upsert(device_id, SessionUpdate::status(ConnectionStatus::Connecting));
        self.bus.publish(FleetEvent::Connecting { device_id });
        self.post_status(device_id, BleStatus::new(ConnectionStatus::Connecting))
            .await;
        metrics::record_connect_attempt();
        tracing::info!(%device_id, %address, "Connecting");

        match self.open_session(&identity, timeout).await {
            Ok(handle) => {
                self.registry.upsert(
                    device_id,
                    SessionUpdate::status(ConnectionStatus::Connected)
                        .with_handle(handle)
                        .connected_at(Utc::now())
                        .clear_error(),
                );
                self.bus.publish(FleetEvent::Connected { device_id });
                self.post_status(device_id, BleStatus::new(ConnectionStatus::Connected))
                    .await;
                tracing::info!(%device_id, ?handle, "Connected");
                Ok(handle)
            }
            Err(e) => {
                let message = e.to_string();
                self.registry.upsert(
                    device_id,
                    SessionUpdate::status(ConnectionStatus::Error)
                        .without_handle()
                        .with_error(message.clone()),
                );
                self.bus.publish(FleetEvent::ConnectFailed {
                    device_id,
                    error: message.clone(),
                });
                self.post_status(device_id, BleStatus::failed(message)).await;
                metrics::record_connect_failed(e.kind());
                tracing::warn!(%device_id, "Connect failed: {}", e);
                Err(e)
            }
        }
    }

    async fn open_session(
        &self,
        identity: &crate::device::DeviceIdentity,
        timeout: Duration,
    ) -> FleetResult<SessionHandle> {
        // The radio cannot scan and connect at once; locate() stops any scan
        let _radio = self.radio_lock.lock().await;
        let found = self
            .scanner
            .locate(identity, self.locate_timeout.min(timeout))
            .await?;

        match tokio::time::timeout(timeout, self.radio.connect(found.address)).await {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(e)) => Err(FleetError::ConnectFailed(e.to_string())),
            Err(_) => Err(FleetError::ConnectFailed(format!(
                "handshake timed out after {timeout:?}"
            ))),
        }
    }

    /// Tear down the session. A device that was never connected is left as is.
    pub async fn disconnect(&self, device_id: DeviceId) -> FleetResult<()> {
        let Some(handle) = self.release(device_id, None) else {
            return Ok(());
        };

        if let Err(e) = self.radio.disconnect(handle).await {
            tracing::debug!(%device_id, "Driver disconnect: {}", e);
        }
        self.bus.publish(FleetEvent::Disconnected { device_id });
        self.post_status(device_id, BleStatus::new(ConnectionStatus::Disconnected))
            .await;
        tracing::info!(%device_id, "Disconnected");
        Ok(())
    }

    /// The driver reported that the link dropped under us.
    pub async fn handle_link_lost(&self, device_id: DeviceId) {
        let Some(handle) = self.release(device_id, Some("link lost")) else {
            return;
        };

        tracing::warn!(%device_id, "Link lost");
        if let Err(e) = self.radio.disconnect(handle).await {
            tracing::debug!(%device_id, "Driver disconnect after link loss: {}", e);
        }
        self.bus.publish(FleetEvent::Disconnected { device_id });
        self.post_status(device_id, BleStatus::new(ConnectionStatus::Disconnected))
            .await;
    }

    /// Disconnect every connected device; returns how many were torn down
    pub async fn disconnect_all(&self) -> usize {
        let connected: Vec<DeviceId> = self
            .registry
            .sessions()
            .into_iter()
            .filter(|s| s.is_connected())
            .map(|s| s.device_id)
            .collect();

        for device_id in &connected {
            if let Err(e) = self.disconnect(*device_id).await {
                tracing::debug!(%device_id, "Disconnect during teardown: {}", e);
            }
        }
        connected.len()
    }

    /// Clear the handle and campaign files in one registry update, returning
    /// the handle that was live
    fn release(&self, device_id: DeviceId, error: Option<&str>) -> Option<SessionHandle> {
        self.registry.get(device_id)?;
        self.registry.update_with(device_id, |session| {
            let handle = session.handle.take()?;
            session.status = ConnectionStatus::Disconnected;
            session.campaigns.clear();
            if let Some(error) = error {
                session.last_error = Some(error.to_string());
            }
            Some(handle)
        })
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn handle(&self, device_id: DeviceId) -> Option<SessionHandle> {
        self.registry
            .get(device_id)
            .filter(|s| s.is_connected())
            .and_then(|s| s.handle)
    }

    pub fn is_connected(&self, device_id: DeviceId) -> bool {
        self.handle(device_id).is_some()
    }

    /// Issue one request over the live session. A dropped link is converted
    /// into a disconnected session before the error is returned.
    pub async fn request(
        &self,
        device_id: DeviceId,
        campaign_id: u64,
        opcode: Opcode,
        timeout: Duration,
    ) -> TransportResult<Bytes> {
        let handle = self.handle(device_id).ok_or(TransportError::Disconnected)?;

        let result = match tokio::time::timeout(
            timeout,
            self.radio.request(handle, campaign_id, opcode),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };

        if let Err(e) = &result {
            if e.is_link_loss() {
                self.handle_link_lost(device_id).await;
            }
        }
        result
    }

    async fn post_status(&self, device_id: DeviceId, status: BleStatus) {
        if let Err(e) = self.backend.post_ble_status(device_id, status).await {
            tracing::warn!(%device_id, "Failed to report connection status: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceIdentity, HardwareAddress};
    use crate::discovery::ScanOptions;
    use crate::session::CampaignFiles;
    use crate::sim::{SimBackend, SimRadio};

    const ADDR: &str = "54:32:04:01:E6:41";

    struct Rig {
        radio: Arc<SimRadio>,
        backend: Arc<SimBackend>,
        registry: SessionRegistry,
        bus: EventBus,
        scanner: DiscoveryScanner,
        manager: ConnectionManager,
    }

    fn rig() -> Rig {
        let radio = Arc::new(SimRadio::new());
        let backend = Arc::new(SimBackend::new());
        let registry = SessionRegistry::new();
        let bus = EventBus::new(64);
        let scanner = DiscoveryScanner::new(radio.clone(), registry.clone(), bus.clone());
        let manager = ConnectionManager::new(
            radio.clone(),
            scanner.clone(),
            registry.clone(),
            bus.clone(),
            backend.clone(),
            &FleetConfig::default(),
        );

        let address: HardwareAddress = ADDR.parse().unwrap();
        radio.add_device(address, "REC-42", -60);
        registry.register_identity(DeviceIdentity::new(42u64, address));

        Rig {
            radio,
            backend,
            registry,
            bus,
            scanner,
            manager,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_success() {
        let rig = rig();
        let mut events = rig.bus.subscribe();

        let handle = rig.manager.connect(DeviceId(42)).await.unwrap();

        let session = rig.registry.get(DeviceId(42)).unwrap();
        assert_eq!(session.status, ConnectionStatus::Connected);
        assert_eq!(session.handle, Some(handle));
        assert!(session.last_connected_at.is_some());
        assert!(session.last_error.is_none());
        assert!(session.activity.is_none());

        assert_eq!(events.recv().await.unwrap(), FleetEvent::Connecting { device_id: DeviceId(42) });
        assert_eq!(events.recv().await.unwrap(), FleetEvent::Connected { device_id: DeviceId(42) });

        let statuses: Vec<ConnectionStatus> =
            rig.backend.statuses().into_iter().map(|(_, s)| s.status).collect();
        assert_eq!(
            statuses,
            vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_is_short_circuited() {
        let rig = rig();
        let first = rig.manager.connect(DeviceId(42)).await.unwrap();
        let second = rig.manager.connect(DeviceId(42)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(rig.radio.connect_calls(), 1);
        assert_eq!(rig.radio.scan_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_error_kinds() {
        let rig = rig();

        let err = rig.manager.connect(DeviceId(7)).await.unwrap_err();
        assert_eq!(err, FleetError::NotFound(DeviceId(7)));

        rig.registry.register_identity(DeviceIdentity {
            id: DeviceId(8),
            address: None,
            name: None,
            site_id: None,
            installation_id: None,
        });
        let err = rig.manager.connect(DeviceId(8)).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidAddress { .. }));

        rig.registry
            .register_identity(DeviceIdentity::new(9u64, "11:22:33:44:55:66".parse().unwrap()));
        let err = rig.manager.connect(DeviceId(9)).await.unwrap_err();
        assert!(matches!(err, FleetError::ScanFailed(_)));
        let session = rig.registry.get(DeviceId(9)).unwrap();
        assert_eq!(session.status, ConnectionStatus::Error);
        assert!(session.last_error.is_some());
        assert!(session.activity.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_failure_then_recovery() {
        let rig = rig();
        let mut events = rig.bus.subscribe();
        rig.radio.fail_next_connects(1);

        let err = rig.manager.connect(DeviceId(42)).await.unwrap_err();
        assert!(matches!(err, FleetError::ConnectFailed(_)));
        assert!(err.is_retryable());

        let session = rig.registry.get(DeviceId(42)).unwrap();
        assert_eq!(session.status, ConnectionStatus::Error);
        assert!(!session.is_connecting());

        let _ = events.recv().await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            FleetEvent::ConnectFailed { .. }
        ));
        assert_eq!(
            rig.backend.statuses().last().unwrap().1.status,
            ConnectionStatus::Error
        );

        rig.manager.connect(DeviceId(42)).await.unwrap();
        let session = rig.registry.get(DeviceId(42)).unwrap();
        assert_eq!(session.status, ConnectionStatus::Connected);
        assert!(session.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_never_connected_is_noop() {
        let rig = rig();
        rig.manager.disconnect(DeviceId(42)).await.unwrap();
        rig.manager.disconnect(DeviceId(999)).await.unwrap();
        assert_eq!(rig.radio.disconnect_calls(), 0);
        assert!(rig.registry.get(DeviceId(999)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_clears_handle_and_files() {
        let rig = rig();
        rig.manager.connect(DeviceId(42)).await.unwrap();
        rig.registry.upsert(
            DeviceId(42),
            SessionUpdate::default().with_campaign(CampaignFiles::new(7, Vec::new())),
        );

        rig.manager.disconnect(DeviceId(42)).await.unwrap();
        let session = rig.registry.get(DeviceId(42)).unwrap();
        assert_eq!(session.status, ConnectionStatus::Disconnected);
        assert!(session.handle.is_none());
        assert!(session.campaigns.is_empty());
        assert!(!rig.radio.is_connected(ADDR.parse().unwrap()));

        // Twice is fine
        rig.manager.disconnect(DeviceId(42)).await.unwrap();
        assert_eq!(rig.radio.disconnect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_stops_running_scan() {
        let rig = rig();
        rig.radio.set_scan_duration(Duration::from_secs(20));
        assert!(rig.scanner.start_scan(ScanOptions::default()));
        tokio::task::yield_now().await;

        rig.manager.connect(DeviceId(42)).await.unwrap();
        assert!(!rig.scanner.is_scanning());
        assert_eq!(rig.radio.overlaps(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_the_radio() {
        let rig = rig();
        let other: HardwareAddress = "54:32:04:01:E6:99".parse().unwrap();
        rig.radio.add_device(other, "REC-43", -70);
        rig.registry.register_identity(DeviceIdentity::new(43u64, other));
        rig.radio.set_request_latency(Duration::from_millis(50));

        let (a, b) = tokio::join!(
            rig.manager.connect(DeviceId(42)),
            rig.manager.connect(DeviceId(43))
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(rig.radio.overlaps(), 0);
        assert_eq!(rig.radio.connect_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reversed_advertisement_connects() {
        let rig = rig();
        rig.radio.advertise_reversed(ADDR.parse().unwrap());
        rig.manager.connect(DeviceId(42)).await.unwrap();
        assert!(rig.manager.is_connected(DeviceId(42)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_busy() {
        let rig = rig();
        let _probe = rig.registry.try_begin(DeviceId(42), Activity::Probing).unwrap();
        let err = rig.manager.connect(DeviceId(42)).await.unwrap_err();
        assert!(matches!(err, FleetError::Busy { .. }));
        assert_eq!(rig.radio.connect_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_during_request() {
        let rig = rig();
        rig.radio.add_file(ADDR.parse().unwrap(), 7, "a.ubx", vec![0; 16]);
        rig.manager.connect(DeviceId(42)).await.unwrap();
        rig.radio.drop_link_on_read(true);

        let err = rig
            .manager
            .request(
                DeviceId(42),
                7,
                Opcode::ReadFile { name: "a.ubx".into() },
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(err.is_link_loss());

        let session = rig.registry.get(DeviceId(42)).unwrap();
        assert_eq!(session.status, ConnectionStatus::Disconnected);
        assert_eq!(session.last_error.as_deref(), Some("link lost"));
        assert!(!rig.manager.is_connected(DeviceId(42)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_survives_driver_disconnect_error() {
        let rig = rig();
        rig.manager.connect(DeviceId(42)).await.unwrap();
        rig.radio.fail_disconnects(true);
        let mut events = rig.bus.subscribe();

        rig.manager.handle_link_lost(DeviceId(42)).await;

        assert_eq!(rig.radio.disconnect_calls(), 1);
        let session = rig.registry.get(DeviceId(42)).unwrap();
        assert_eq!(session.status, ConnectionStatus::Disconnected);
        assert_eq!(session.last_error.as_deref(), Some("link lost"));
        assert!(session.handle.is_none());
        assert_eq!(
            events.recv().await.unwrap(),
            FleetEvent::Disconnected { device_id: DeviceId(42) }
        );
        let last = rig.backend.statuses().last().map(|(_, s)| s.status);
        assert_eq!(last, Some(ConnectionStatus::Disconnected));

        // Already released: a second report does nothing
        rig.manager.handle_link_lost(DeviceId(42)).await;
        assert_eq!(rig.radio.disconnect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_all_with_failing_driver() {
        let rig = rig();
        rig.manager.connect(DeviceId(42)).await.unwrap();
        rig.radio.fail_disconnects(true);

        assert_eq!(rig.manager.disconnect_all().await, 1);
        assert!(!rig.manager.is_connected(DeviceId(42)));
        assert!(!rig.radio.is_connected(ADDR.parse().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_post_failure_is_not_surfaced() {
        let rig = rig();
        rig.backend.fail_statuses(true);
        rig.manager.connect(DeviceId(42)).await.unwrap();
        assert!(rig.backend.statuses().is_empty());
    }
}
