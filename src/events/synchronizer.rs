use crate::connection::ConnectionManager;
use crate::device::DeviceId;
use crate::events::bus::EventBus;
use crate::events::notify::NotificationSink;
use crate::events::types::{FleetEvent, Notification};
use crate::probe::FileProbe;
use crate::queue::UploadQueue;
use crate::session::SessionRegistry;
use crate::transfer::TransferOrchestrator;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Applies the cross-component effects of [`FleetEvent`]s.
///
/// Every handler is idempotent and swallows its own failures.
#[derive(Clone)]
pub struct Synchronizer {
    registry: SessionRegistry,
    connections: ConnectionManager,
    probe: FileProbe,
    queue: UploadQueue,
    orchestrator: TransferOrchestrator,
    sink: Arc<dyn NotificationSink>,
    /// Jobs in a non-terminal phase, with their device
    active_jobs: Arc<Mutex<HashMap<Uuid, DeviceId>>>,
    activity_tx: Arc<watch::Sender<bool>>,
    auto_probe: Arc<DashMap<DeviceId, u64>>,
}

impl Synchronizer {
    pub fn new(
        connections: ConnectionManager,
        probe: FileProbe,
        queue: UploadQueue,
        orchestrator: TransferOrchestrator,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let (activity_tx, _) = watch::channel(false);
        Self {
            registry: connections.registry().clone(),
            connections,
            probe,
            queue,
            orchestrator,
            sink,
            active_jobs: Arc::new(Mutex::new(HashMap::new())),
            activity_tx: Arc::new(activity_tx),
            auto_probe: Arc::new(DashMap::new()),
        }
    }

    /// Probe `campaign_id` whenever `device_id` connects
    pub fn set_auto_probe_campaign(&self, device_id: DeviceId, campaign_id: u64) {
        self.auto_probe.insert(device_id, campaign_id);
    }

    pub fn clear_auto_probe_campaign(&self, device_id: DeviceId) {
        self.auto_probe.remove(&device_id);
    }

    /// Global "activity in progress" flag
    pub fn activity(&self) -> watch::Receiver<bool> {
        self.activity_tx.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        *self.activity_tx.borrow()
    }

    /// Subscribe to `bus` and handle events until it closes.
    pub fn spawn(&self, bus: &EventBus) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        let synchronizer = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => synchronizer.handle(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Synchronizer lagged behind the event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn handle(&self, event: FleetEvent) {
        match event {
            FleetEvent::LoggedOut => self.on_logged_out().await,
            FleetEvent::JobPhaseChanged {
                job_id,
                device_id,
                phase,
            } => {
                let busy = {
                    let mut active = self.active_jobs.lock();
                    if phase.is_active() {
                        active.insert(job_id, device_id);
                    } else {
                        active.remove(&job_id);
                    }
                    !active.is_empty()
                };
                self.set_busy(busy);
            }
            FleetEvent::Connected { device_id } => self.on_connected(device_id),
            _ => {}
        }
    }

    async fn on_logged_out(&self) {
        // Jobs first, so none reconnects or treats a cleared entry as delivered
        let cancelled = self.orchestrator.cancel_all();
        let disconnected = self.connections.disconnect_all().await;
        let dropped = match self.queue.clear().await {
            Ok(dropped) => dropped,
            Err(e) => {
                tracing::error!("Failed to clear upload queue on logout: {}", e);
                0
            }
        };
        self.registry.clear();
        self.auto_probe.clear();

        tracing::info!(cancelled, disconnected, dropped, "Logout teardown");
        if cancelled > 0 || disconnected > 0 || dropped > 0 {
            self.sink.notify(Notification::info(
                "Signed out",
                format!(
                    "Cancelled {cancelled} transfer(s), disconnected {disconnected} device(s) \
                     and dropped {dropped} pending upload(s)"
                ),
            ));
        }
    }

    fn on_connected(&self, device_id: DeviceId) {
        let Some(campaign_id) = self.auto_probe.get(&device_id).map(|c| *c) else {
            return;
        };
        // A running job probes on its own
        if self.active_jobs.lock().values().any(|d| *d == device_id) {
            return;
        }

        let probe = self.probe.clone();
        tokio::spawn(async move {
            if let Err(e) = probe.probe(device_id, campaign_id).await {
                tracing::warn!(%device_id, campaign_id, "Auto-probe failed: {}", e);
            }
        });
    }

    fn set_busy(&self, busy: bool) {
        let changed = self.activity_tx.send_if_modified(|current| {
            if *current == busy {
                false
            } else {
                *current = busy;
                true
            }
        });
        if changed {
            self.sink.set_busy(busy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetConfig;
    use crate::device::{DeviceIdentity, HardwareAddress};
    use crate::discovery::DiscoveryScanner;
    use crate::sim::{RecordingSink, SimBackend, SimRadio};
    use crate::store::{ArtifactStore, MemoryStore};
    use crate::transfer::{TransferPhase, TransferRequest};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Rig {
        _dir: TempDir,
        radio: Arc<SimRadio>,
        registry: SessionRegistry,
        connections: ConnectionManager,
        queue: UploadQueue,
        artifacts: ArtifactStore,
        sink: Arc<RecordingSink>,
        bus: EventBus,
        orchestrator: TransferOrchestrator,
        sync: Synchronizer,
    }

    async fn rig() -> Rig {
        let dir = TempDir::new().unwrap();
        let config = FleetConfig::ephemeral(dir.path());
        let radio = Arc::new(SimRadio::new());
        let backend = Arc::new(SimBackend::new());
        let registry = SessionRegistry::new();
        let bus = EventBus::new(64);
        let sink = Arc::new(RecordingSink::new());
        let scanner = DiscoveryScanner::new(radio.clone(), registry.clone(), bus.clone());
        let connections = ConnectionManager::new(
            radio.clone(),
            scanner,
            registry.clone(),
            bus.clone(),
            backend.clone(),
            &config,
        );
        let probe = FileProbe::new(connections.clone(), registry.clone(), bus.clone(), &config);
        let artifacts = ArtifactStore::new(dir.path());
        let queue = UploadQueue::load(
            Arc::new(MemoryStore::new()),
            backend,
            artifacts.clone(),
            &config,
        )
        .await
        .unwrap();
        let orchestrator = TransferOrchestrator::new(
            connections.clone(),
            probe.clone(),
            queue.clone(),
            artifacts.clone(),
            bus.clone(),
            sink.clone(),
            &config,
        );
        let sync = Synchronizer::new(
            connections.clone(),
            probe,
            queue.clone(),
            orchestrator.clone(),
            sink.clone(),
        );

        for (id, raw) in [(42u64, "54:32:04:01:E6:41"), (43, "54:32:04:01:E6:42")] {
            let address: HardwareAddress = raw.parse().unwrap();
            radio.add_device(address, "REC", -60);
            radio.add_file(address, 7, "a.ubx", vec![0; 100]);
            registry.register_identity(DeviceIdentity::new(id, address));
        }

        Rig {
            _dir: dir,
            radio,
            registry,
            connections,
            queue,
            artifacts,
            sink,
            bus,
            orchestrator,
            sync,
        }
    }

    fn phase(job_id: Uuid, phase: TransferPhase) -> FleetEvent {
        FleetEvent::JobPhaseChanged {
            job_id,
            device_id: DeviceId(42),
            phase,
        }
    }

    #[tokio::test]
    async fn test_activity_flag_follows_active_jobs() {
        let rig = rig().await;
        let activity = rig.sync.activity();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        rig.sync.handle(phase(a, TransferPhase::Initializing)).await;
        rig.sync.handle(phase(a, TransferPhase::Connecting)).await;
        rig.sync.handle(phase(b, TransferPhase::Downloading)).await;
        assert!(*activity.borrow());

        rig.sync.handle(phase(a, TransferPhase::Completed)).await;
        assert!(rig.sync.is_busy());
        rig.sync.handle(phase(b, TransferPhase::Error)).await;
        assert!(!rig.sync.is_busy());

        // Repeated terminal events change nothing
        rig.sync.handle(phase(b, TransferPhase::Error)).await;
        assert_eq!(rig.sink.busy_history(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_tears_everything_down() {
        let rig = rig().await;
        rig.connections.connect(DeviceId(42)).await.unwrap();
        rig.connections.connect(DeviceId(43)).await.unwrap();

        let artifact = rig
            .artifacts
            .write(DeviceId(42), 7, "a.ubx", b"data")
            .await
            .unwrap();
        let context = rig.registry.identity(DeviceId(42)).unwrap().upload_context();
        rig.queue
            .enqueue(crate::queue::UploadQueueEntry::from_artifact(context, 7, "a.ubx", artifact))
            .await
            .unwrap();

        rig.sync.handle(FleetEvent::LoggedOut).await;

        assert!(rig.registry.sessions().is_empty());
        assert!(rig.queue.is_empty());
        assert_eq!(rig.radio.disconnect_calls(), 2);
        let notifications = rig.sink.notifications();
        assert_eq!(notifications.len(), 1);
        assert!(!notifications[0].requires_ack);

        // Second logout is a no-op
        rig.sync.handle(FleetEvent::LoggedOut).await;
        assert_eq!(rig.sink.notifications().len(), 1);
        assert_eq!(rig.radio.disconnect_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_cancels_running_job() {
        let rig = rig().await;
        rig.radio.set_request_latency(Duration::from_millis(300));
        let job_id = rig
            .orchestrator
            .spawn(TransferRequest::campaign(42u64, 7))
            .unwrap();
        while rig.orchestrator.job(job_id).unwrap().phase != TransferPhase::Downloading {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        rig.sync.handle(FleetEvent::LoggedOut).await;
        while !rig.orchestrator.job(job_id).unwrap().phase.is_terminal() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let job = rig.orchestrator.job(job_id).unwrap();
        assert_eq!(job.phase, TransferPhase::Error);
        assert!(matches!(job.error, Some(crate::error::FleetError::Cancelled(_))));
        assert_eq!(job.retry_count, 0);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(rig.radio.connect_calls(), 1);
        assert!(rig.queue.is_empty());
        assert!(rig.registry.sessions().is_empty());
        // Only the sign-out toast
        assert_eq!(rig.sink.notifications().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_probe_on_connect() {
        let rig = rig().await;
        let handle = rig.sync.spawn(&rig.bus);
        rig.sync.set_auto_probe_campaign(DeviceId(42), 7);

        rig.connections.connect(DeviceId(42)).await.unwrap();
        rig.connections.connect(DeviceId(43)).await.unwrap();

        for _ in 0..50 {
            if rig.radio.list_calls() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(rig.radio.list_calls(), 1);
        let session = rig.registry.get(DeviceId(42)).unwrap();
        assert_eq!(session.campaign(7).unwrap().file_count(), 1);
        assert!(rig.registry.get(DeviceId(43)).unwrap().campaigns.is_empty());

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_auto_probe_during_job() {
        let rig = rig().await;
        rig.sync.set_auto_probe_campaign(DeviceId(42), 7);
        rig.sync
            .handle(phase(Uuid::new_v4(), TransferPhase::Connecting))
            .await;

        rig.connections.connect(DeviceId(42)).await.unwrap();
        rig.sync
            .handle(FleetEvent::Connected {
                device_id: DeviceId(42),
            })
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rig.radio.list_calls(), 0);
    }

    #[tokio::test]
    async fn test_run_loop_survives_lag() {
        let rig = rig().await;
        let bus = EventBus::new(1);
        let handle = rig.sync.spawn(&bus);
        let job = Uuid::new_v4();
        for _ in 0..10 {
            bus.publish(phase(job, TransferPhase::Downloading));
        }
        bus.publish(phase(Uuid::new_v4(), TransferPhase::Uploading));

        let mut activity = rig.sync.activity();
        tokio::time::timeout(Duration::from_secs(5), activity.wait_for(|busy| *busy))
            .await
            .unwrap()
            .unwrap();
        assert!(!handle.is_finished());
        handle.abort();
    }
}
