//! Wiring of every component into one owned context.

use crate::backend::BackendApi;
use crate::config::{ConfigError, FleetConfig};
use crate::connection::ConnectionManager;
use crate::device::{DeviceId, DeviceIdentity};
use crate::discovery::{DiscoveryResult, DiscoveryScanner, ScanOptions};
use crate::error::FleetResult;
use crate::events::{EventBus, FleetEvent, NotificationSink, Synchronizer, TracingSink};
use crate::metrics;
use crate::probe::{FileProbe, ProbeSummary};
use crate::queue::{ProcessReport, QueueError, UploadQueue};
use crate::session::{ConnectionSession, SessionRegistry};
use crate::store::{self, ArtifactStore, KeyValueStore, StoreError};
use crate::transfer::{ProgressCallback, TransferJob, TransferOrchestrator, TransferRequest};
use crate::transport::{BulkDriver, RadioDriver, SessionHandle};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("Upload queue could not be restored: {0}")]
    Queue(#[from] QueueError),
}

pub struct FleetBuilder {
    config: FleetConfig,
    radio: Arc<dyn RadioDriver>,
    backend: Arc<dyn BackendApi>,
    bulk: Option<Arc<dyn BulkDriver>>,
    sink: Option<Arc<dyn NotificationSink>>,
    store: Option<Arc<dyn KeyValueStore>>,
}

impl FleetBuilder {
    pub fn new(
        config: FleetConfig,
        radio: Arc<dyn RadioDriver>,
        backend: Arc<dyn BackendApi>,
    ) -> Self {
        Self {
            config,
            radio,
            backend,
            bulk: None,
            sink: None,
            store: None,
        }
    }

    pub fn bulk(mut self, bulk: Arc<dyn BulkDriver>) -> Self {
        self.bulk = Some(bulk);
        self
    }

    /// Defaults to [`TracingSink`]
    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Use this store instead of opening `config.store_path`
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate the config, open the store, restore the upload queue and
    /// start the synchronizer. Needs a Tokio runtime.
    pub async fn build(self) -> Result<Fleet, BuildError> {
        self.config.validate()?;
        metrics::init_metrics();

        let store = match self.store {
            Some(store) => store,
            None => store::open(&self.config.store_path).await?,
        };
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));

        let registry = SessionRegistry::new();
        let bus = EventBus::new(self.config.event_capacity);
        let artifacts = ArtifactStore::new(self.config.artifact_dir.clone());

        let scanner = DiscoveryScanner::new(self.radio.clone(), registry.clone(), bus.clone());
        let connections = ConnectionManager::new(
            self.radio,
            scanner.clone(),
            registry.clone(),
            bus.clone(),
            self.backend.clone(),
            &self.config,
        );
        let probe = FileProbe::new(connections.clone(), registry.clone(), bus.clone(), &self.config);
        let queue = UploadQueue::load(store, self.backend, artifacts.clone(), &self.config).await?;

        let mut orchestrator = TransferOrchestrator::new(
            connections.clone(),
            probe.clone(),
            queue.clone(),
            artifacts,
            bus.clone(),
            sink.clone(),
            &self.config,
        );
        if let Some(bulk) = self.bulk {
            orchestrator = orchestrator.with_bulk(bulk);
        }

        let synchronizer = Synchronizer::new(
            connections.clone(),
            probe.clone(),
            queue.clone(),
            orchestrator.clone(),
            sink,
        );
        let sync_task = synchronizer.spawn(&bus);

        tracing::info!(
            store = %self.config.store_path,
            artifacts = %self.config.artifact_dir.display(),
            pending_uploads = queue.len(),
            "Fleet ready"
        );

        Ok(Fleet {
            config: self.config,
            registry,
            scanner,
            connections,
            probe,
            queue,
            orchestrator,
            bus,
            synchronizer,
            sync_task,
        })
    }
}

/// Owned application context; dropping it stops the synchronizer.
pub struct Fleet {
    config: FleetConfig,
    registry: SessionRegistry,
    scanner: DiscoveryScanner,
    connections: ConnectionManager,
    probe: FileProbe,
    queue: UploadQueue,
    orchestrator: TransferOrchestrator,
    bus: EventBus,
    synchronizer: Synchronizer,
    sync_task: JoinHandle<()>,
}

impl Fleet {
    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn scanner(&self) -> &DiscoveryScanner {
        &self.scanner
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn probe_service(&self) -> &FileProbe {
        &self.probe
    }

    pub fn queue(&self) -> &UploadQueue {
        &self.queue
    }

    pub fn orchestrator(&self) -> &TransferOrchestrator {
        &self.orchestrator
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.synchronizer
    }

    /// Add devices to the directory, e.g. after fetching the user's machines
    pub fn register_devices(&self, identities: impl IntoIterator<Item = DeviceIdentity>) -> usize {
        let mut count = 0;
        for identity in identities {
            self.registry.register_identity(identity);
            count += 1;
        }
        count
    }

    pub fn register_device(&self, identity: DeviceIdentity) {
        self.registry.register_identity(identity);
    }

    pub fn session(&self, device_id: DeviceId) -> Option<ConnectionSession> {
        self.registry.get(device_id)
    }

    pub fn start_scan(&self, options: ScanOptions) -> bool {
        self.scanner.start_scan(options)
    }

    pub async fn stop_scan(&self) {
        self.scanner.stop_scan().await
    }

    pub fn discovered(&self) -> Vec<DiscoveryResult> {
        self.scanner.results()
    }

    pub async fn connect(&self, device_id: DeviceId) -> FleetResult<SessionHandle> {
        self.connections.connect(device_id).await
    }

    pub async fn disconnect(&self, device_id: DeviceId) -> FleetResult<()> {
        self.connections.disconnect(device_id).await
    }

    pub async fn probe(&self, device_id: DeviceId, campaign_id: u64) -> FleetResult<ProbeSummary> {
        self.probe.probe(device_id, campaign_id).await
    }

    pub async fn run_transfer(&self, request: TransferRequest) -> FleetResult<TransferJob> {
        self.orchestrator.run(request).await
    }

    pub async fn run_transfer_with_progress(
        &self,
        request: TransferRequest,
        progress: ProgressCallback,
    ) -> FleetResult<TransferJob> {
        self.orchestrator.run_with_progress(request, progress).await
    }

    pub fn spawn_transfer(&self, request: TransferRequest) -> FleetResult<Uuid> {
        self.orchestrator.spawn(request)
    }

    pub async fn process_uploads(&self) -> FleetResult<ProcessReport> {
        Ok(self.queue.process_queue().await?)
    }

    /// Publish a logout; the synchronizer tears sessions and the queue down.
    pub fn logout(&self) {
        self.bus.publish(FleetEvent::LoggedOut);
    }

    /// Stop reacting to events and release every device.
    pub async fn shutdown(&self) {
        self.sync_task.abort();
        self.scanner.stop_scan().await;
        let released = self.connections.disconnect_all().await;
        tracing::info!(released, "Fleet shut down");
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        self.sync_task.abort();
    }
}
