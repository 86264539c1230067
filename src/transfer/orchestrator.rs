use crate::config::FleetConfig;
use crate::connection::ConnectionManager;
use crate::device::{DeviceId, DeviceIdentity};
use crate::error::{FleetError, FleetResult};
use crate::events::{EventBus, FleetEvent, Notification, NotificationSink};
use crate::metrics;
use crate::probe::FileProbe;
use crate::queue::{QueueError, UploadQueue, UploadQueueEntry};
use crate::session::{Activity, SessionRegistry};
use crate::store::ArtifactStore;
use crate::transfer::state_machine::JobStateMachine;
use crate::transfer::types::{ProgressCallback, TransferJob, TransferPhase, TransferRequest};
use crate::transport::{BulkDriver, Opcode, RemoteFile, TransportKind};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

/// Delay schedule between attempts: base, doubling, capped, no jitter.
pub(crate) fn retry_backoff(config: &FleetConfig) -> ExponentialBackoff {
    let base = config.backoff_base();
    ExponentialBackoff {
        current_interval: base,
        initial_interval: base,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: config.backoff_max(),
        max_elapsed_time: None,
        ..Default::default()
    }
}

struct Downloaded {
    file: RemoteFile,
    data: Bytes,
}

/// State of one job that survives across attempts.
struct JobRun {
    job_id: Uuid,
    device_id: DeviceId,
    campaign_id: u64,
    requested: Option<Vec<String>>,
    /// Cancellation generation the job was registered under
    generation: u64,
    sm: JobStateMachine,
    progress: Option<ProgressCallback>,
    /// File name to upload queue id, for files committed locally
    stored: BTreeMap<String, String>,
    uploaded: HashSet<String>,
    downloaded: Vec<Downloaded>,
}

/// Drives transfer jobs and keeps them addressable by id.
#[derive(Clone)]
pub struct TransferOrchestrator {
    registry: SessionRegistry,
    connections: ConnectionManager,
    probe: FileProbe,
    bulk: Option<Arc<dyn BulkDriver>>,
    artifacts: ArtifactStore,
    queue: UploadQueue,
    bus: EventBus,
    sink: Arc<dyn NotificationSink>,
    config: Arc<FleetConfig>,
    jobs: Arc<DashMap<Uuid, TransferJob>>,
    /// At most one running job per device
    active: Arc<DashMap<DeviceId, Uuid>>,
    /// Bumped by `cancel_all`; jobs from an older generation stop
    generation: Arc<watch::Sender<u64>>,
}

impl TransferOrchestrator {
    pub fn new(
        connections: ConnectionManager,
        probe: FileProbe,
        queue: UploadQueue,
        artifacts: ArtifactStore,
        bus: EventBus,
        sink: Arc<dyn NotificationSink>,
        config: &FleetConfig,
    ) -> Self {
        Self {
            registry: connections.registry().clone(),
            connections,
            probe,
            bulk: None,
            artifacts,
            queue,
            bus,
            sink,
            config: Arc::new(config.clone()),
            jobs: Arc::new(DashMap::new()),
            active: Arc::new(DashMap::new()),
            generation: Arc::new(watch::channel(0).0),
        }
    }

    pub fn with_bulk(mut self, bulk: Arc<dyn BulkDriver>) -> Self {
        self.bulk = Some(bulk);
        self
    }

    /// Run a job to its terminal phase. Only a refused registration is an
    /// `Err`; a failed job comes back with `phase == Error`.
    pub async fn run(&self, request: TransferRequest) -> FleetResult<TransferJob> {
        let (job, generation) = self.register(&request)?;
        Ok(self.drive(job, generation, None).await)
    }

    pub async fn run_with_progress(
        &self,
        request: TransferRequest,
        progress: ProgressCallback,
    ) -> FleetResult<TransferJob> {
        let (job, generation) = self.register(&request)?;
        Ok(self.drive(job, generation, Some(progress)).await)
    }

    /// Start a job in the background and return its id
    pub fn spawn(&self, request: TransferRequest) -> FleetResult<Uuid> {
        self.spawn_inner(request, None)
    }

    pub fn spawn_with_progress(
        &self,
        request: TransferRequest,
        progress: ProgressCallback,
    ) -> FleetResult<Uuid> {
        self.spawn_inner(request, Some(progress))
    }

    fn spawn_inner(
        &self,
        request: TransferRequest,
        progress: Option<ProgressCallback>,
    ) -> FleetResult<Uuid> {
        let (job, generation) = self.register(&request)?;
        let job_id = job.id;
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.drive(job, generation, progress).await;
        });
        Ok(job_id)
    }

    /// Stop every running job at its next step. Stopped jobs end in `Error`
    /// without retrying; jobs registered afterwards are unaffected.
    pub fn cancel_all(&self) -> usize {
        let running = self.active.len();
        self.generation.send_modify(|g| *g += 1);
        if running > 0 {
            tracing::info!(running, "Cancelling transfer jobs");
        }
        running
    }

    fn register(&self, request: &TransferRequest) -> FleetResult<(TransferJob, u64)> {
        let job = TransferJob::new(request, self.config.max_retries);
        match self.active.entry(request.device_id) {
            Entry::Occupied(running) => {
                return Err(FleetError::Busy {
                    device_id: request.device_id,
                    activity: format!("transfer {}", running.get()),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(job.id);
            }
        }
        self.jobs.insert(job.id, job.clone());
        metrics::record_job_started();
        Ok((job, *self.generation.borrow()))
    }

    async fn drive(
        &self,
        job: TransferJob,
        generation: u64,
        progress: Option<ProgressCallback>,
    ) -> TransferJob {
        let started = Instant::now();
        let mut run = JobRun {
            job_id: job.id,
            device_id: job.device_id,
            campaign_id: job.campaign_id,
            requested: job.requested_files.clone(),
            generation,
            sm: JobStateMachine::new(),
            progress,
            stored: BTreeMap::new(),
            uploaded: HashSet::new(),
            downloaded: Vec::new(),
        };
        let mut backoff = retry_backoff(&self.config);
        let mut cancel = self.generation.subscribe();

        tracing::info!(
            job_id = %run.job_id,
            device_id = %run.device_id,
            campaign_id = run.campaign_id,
            "Transfer job started"
        );

        let outcome = loop {
            match self.attempt(&mut run).await {
                Ok(()) => break Ok(()),
                // Whatever failed, a cancelled job is not re-attempted
                Err(_) if self.is_cancelled(&run) => break Err(cancelled()),
                Err(e)
                    if e.is_retryable()
                        && job_retries(&self.jobs, run.job_id) < self.config.max_retries =>
                {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| self.config.backoff_max());
                    self.update(run.job_id, |j| {
                        j.retry_count += 1;
                        j.error = Some(e.clone());
                    });
                    metrics::record_job_retry();
                    tracing::warn!(
                        job_id = %run.job_id,
                        device_id = %run.device_id,
                        "Attempt failed, retrying in {:?}: {}",
                        delay,
                        e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.changed() => {}
                    }
                }
                Err(e) => break Err(e),
            }
        };

        let mut finished = job;
        match outcome {
            Ok(()) => {
                self.update(run.job_id, |j| {
                    j.error = None;
                    j.finished_at = Some(Utc::now());
                });
                self.enter(&run, TransferPhase::Completed);
                finished = self.job(run.job_id).unwrap_or(finished);
                metrics::record_job_completed(started.elapsed());
                tracing::info!(job_id = %run.job_id, "Transfer job completed");
                self.verify(&run).await;
            }
            Err(e) => {
                self.update(run.job_id, |j| {
                    j.error = Some(e.clone());
                    j.finished_at = Some(Utc::now());
                });
                self.enter(&run, TransferPhase::Error);
                finished = self.job(run.job_id).unwrap_or(finished);
                metrics::record_job_failed(e.kind(), started.elapsed());
                if let FleetError::Cancelled(_) = e {
                    tracing::info!(job_id = %run.job_id, "Transfer job cancelled");
                    // It may have reconnected after the teardown
                    if let Err(e) = self.connections.disconnect(run.device_id).await {
                        tracing::debug!(job_id = %run.job_id, "Disconnect after cancel: {}", e);
                    }
                } else {
                    tracing::error!(job_id = %run.job_id, "Transfer job failed: {}", e);
                    self.sink.notify(Notification::persistent_error(
                        format!("Transfer failed for device {}", run.device_id),
                        format!("Campaign {}: {}", run.campaign_id, e),
                    ));
                }
            }
        }

        self.active
            .remove_if(&run.device_id, |_, id| *id == run.job_id);
        finished
    }

    /// One pass through the pipeline, from initializing to cleanup
    async fn attempt(&self, run: &mut JobRun) -> FleetResult<()> {
        self.advance(run, TransferPhase::Initializing)?;
        run.downloaded.clear();
        let identity = self
            .registry
            .identity(run.device_id)
            .ok_or(FleetError::NotFound(run.device_id))?;

        self.advance(run, TransferPhase::Connecting)?;
        self.connections.connect(run.device_id).await?;

        self.advance(run, TransferPhase::Probing)?;
        let summary = self.probe.probe(run.device_id, run.campaign_id).await?;
        let files: Vec<RemoteFile> = match &run.requested {
            Some(names) => summary
                .files
                .into_iter()
                .filter(|f| names.contains(&f.name))
                .collect(),
            None => summary.files,
        };
        if files.is_empty() {
            return Err(FleetError::NoFilesAvailable {
                device_id: run.device_id,
                campaign_id: run.campaign_id,
            });
        }
        self.update(run.job_id, |j| {
            j.file_count = files.len();
            j.total_bytes = files.iter().map(|f| f.size).sum();
        });
        self.record_stored(run, &files);

        self.advance(run, TransferPhase::Downloading)?;
        let download_failure = self.download_pending(run, &identity, &files).await?;

        self.advance(run, TransferPhase::Storing)?;
        let context = identity.upload_context();
        for item in std::mem::take(&mut run.downloaded) {
            self.checkpoint(run)?;
            let artifact = self
                .artifacts
                .write(run.device_id, run.campaign_id, &item.file.name, &item.data)
                .await?;
            let entry = UploadQueueEntry::from_artifact(
                context.clone(),
                run.campaign_id,
                &item.file.name,
                artifact,
            );
            let file_id = entry.file_id.clone();
            self.queue.enqueue(entry).await?;
            run.stored.insert(item.file.name, file_id);
        }
        self.record_stored(run, &files);

        self.advance(run, TransferPhase::Uploading)?;
        let upload_failure = self.upload_stored(run).await?;

        if let Some(e) = download_failure.or(upload_failure) {
            return Err(e);
        }

        self.advance(run, TransferPhase::Cleanup)?;
        self.cleanup(run, &files).await;
        Ok(())
    }

    /// Fetch every file not yet committed locally. Individual failures do not
    /// stop the remaining files; the first one is returned for the retry loop.
    async fn download_pending(
        &self,
        run: &mut JobRun,
        identity: &DeviceIdentity,
        files: &[RemoteFile],
    ) -> FleetResult<Option<FleetError>> {
        let transport = self.choose_transport(identity).await;
        self.update(run.job_id, |j| j.transport = Some(transport));
        tracing::debug!(job_id = %run.job_id, %transport, "Transport chosen");

        let _slot = self.registry.try_begin(run.device_id, Activity::Downloading)?;
        let mut failure = None;
        for file in files.iter().filter(|f| !run.stored.contains_key(&f.name)) {
            self.checkpoint(run)?;
            match self.download(identity, run.campaign_id, file, transport).await {
                Ok(data) => {
                    run.downloaded.push(Downloaded {
                        file: file.clone(),
                        data,
                    });
                    self.report(run);
                }
                Err(e) => {
                    tracing::warn!(job_id = %run.job_id, file = %file.name, "Download failed: {}", e);
                    failure.get_or_insert(e);
                    if !self.connections.is_connected(run.device_id) {
                        break;
                    }
                }
            }
        }
        Ok(failure)
    }

    async fn choose_transport(&self, identity: &DeviceIdentity) -> TransportKind {
        match &self.bulk {
            Some(bulk) if bulk.is_reachable(identity).await => TransportKind::Wifi,
            _ => TransportKind::Ble,
        }
    }

    /// Bulk first when chosen, silently falling back to the radio
    async fn download(
        &self,
        identity: &DeviceIdentity,
        campaign_id: u64,
        file: &RemoteFile,
        transport: TransportKind,
    ) -> FleetResult<Bytes> {
        let timeout = self.config.task_timeout();

        if let (TransportKind::Wifi, Some(bulk)) = (transport, &self.bulk) {
            match tokio::time::timeout(timeout, bulk.download(identity, campaign_id, file)).await {
                Ok(Ok(data)) if size_matches(file, &data) => {
                    metrics::record_download(TransportKind::Wifi, data.len() as u64);
                    return Ok(data);
                }
                Ok(Ok(data)) => tracing::debug!(
                    file = %file.name,
                    got = data.len(),
                    "Bulk download short, falling back to radio"
                ),
                Ok(Err(e)) => tracing::debug!(file = %file.name, "Bulk download failed, falling back to radio: {}", e),
                Err(_) => tracing::debug!(file = %file.name, "Bulk download timed out, falling back to radio"),
            }
        }

        let data = self
            .connections
            .request(
                identity.id,
                campaign_id,
                Opcode::ReadFile {
                    name: file.name.clone(),
                },
                timeout,
            )
            .await
            .map_err(|e| FleetError::DownloadFailed(format!("{}: {}", file.name, e)))?;

        if !size_matches(file, &data) {
            return Err(FleetError::DownloadFailed(format!(
                "{}: expected {} bytes, got {}",
                file.name,
                file.size,
                data.len()
            )));
        }
        metrics::record_download(TransportKind::Ble, data.len() as u64);
        Ok(data)
    }

    /// Deliver every stored file not yet accepted. Returns the first
    /// delivery failure; local storage failures abort immediately.
    async fn upload_stored(&self, run: &mut JobRun) -> FleetResult<Option<FleetError>> {
        let pending: Vec<(String, String)> = run
            .stored
            .iter()
            .filter(|(name, _)| !run.uploaded.contains(*name))
            .map(|(name, id)| (name.clone(), id.clone()))
            .collect();

        let mut failure = None;
        for (name, file_id) in pending {
            self.checkpoint(run)?;
            match self.queue.upload(&file_id).await {
                // Already delivered by a queue pass
                Ok(_) | Err(QueueError::EntryNotFound(_)) => {
                    run.uploaded.insert(name);
                }
                Err(QueueError::Upload(message)) => {
                    tracing::warn!(job_id = %run.job_id, file = %name, "Upload failed: {}", message);
                    failure.get_or_insert(FleetError::UploadFailed(format!("{name}: {message}")));
                }
                Err(e) => return Err(e.into()),
            }
            self.report(run);
        }
        Ok(failure)
    }

    /// Best-effort removal of the delivered files from the device
    async fn cleanup(&self, run: &JobRun, files: &[RemoteFile]) {
        if !self.config.remote_cleanup {
            return;
        }
        let names: Vec<String> = files
            .iter()
            .filter(|f| run.uploaded.contains(&f.name))
            .map(|f| f.name.clone())
            .collect();
        if names.is_empty() {
            return;
        }

        let count = names.len();
        match self
            .connections
            .request(
                run.device_id,
                run.campaign_id,
                Opcode::DeleteFiles { names },
                self.config.task_timeout(),
            )
            .await
        {
            Ok(_) => tracing::info!(job_id = %run.job_id, count, "Remote files removed"),
            Err(e) => tracing::warn!(job_id = %run.job_id, "Remote cleanup failed: {}", e),
        }
    }

    async fn verify(&self, run: &JobRun) {
        if !self.config.verify_after_completion {
            return;
        }
        match self.probe.probe(run.device_id, run.campaign_id).await {
            Ok(summary) => tracing::info!(
                job_id = %run.job_id,
                remaining = summary.file_count,
                "Verification probe done"
            ),
            Err(e) => tracing::warn!(job_id = %run.job_id, "Verification probe failed: {}", e),
        }
    }

    fn record_stored(&self, run: &JobRun, files: &[RemoteFile]) {
        let stored: Vec<&RemoteFile> = files
            .iter()
            .filter(|f| run.stored.contains_key(&f.name))
            .collect();
        self.update(run.job_id, |j| {
            j.files_done = stored.len();
            j.bytes_done = stored.iter().map(|f| f.size).sum();
        });
    }

    fn is_cancelled(&self, run: &JobRun) -> bool {
        *self.generation.borrow() != run.generation
    }

    fn checkpoint(&self, run: &JobRun) -> FleetResult<()> {
        if self.is_cancelled(run) {
            return Err(cancelled());
        }
        Ok(())
    }

    fn advance(&self, run: &JobRun, phase: TransferPhase) -> FleetResult<()> {
        self.checkpoint(run)?;
        self.enter(run, phase);
        Ok(())
    }

    fn enter(&self, run: &JobRun, phase: TransferPhase) {
        if let Err(e) = run.sm.transition(phase) {
            tracing::error!(job_id = %run.job_id, "{}", e);
            return;
        }
        self.update(run.job_id, |j| j.phase = phase);
        tracing::debug!(job_id = %run.job_id, %phase, "Phase");
        self.bus.publish(FleetEvent::JobPhaseChanged {
            job_id: run.job_id,
            device_id: run.device_id,
            phase,
        });
        self.report(run);
    }

    fn report(&self, run: &JobRun) {
        if let (Some(callback), Some(job)) = (&run.progress, self.job(run.job_id)) {
            callback(job.progress());
        }
    }

    fn update(&self, job_id: Uuid, f: impl FnOnce(&mut TransferJob)) {
        if let Some(mut job) = self.jobs.get_mut(&job_id) {
            f(&mut job);
        }
    }

    pub fn job(&self, job_id: Uuid) -> Option<TransferJob> {
        self.jobs.get(&job_id).map(|j| j.clone())
    }

    pub fn jobs(&self) -> Vec<TransferJob> {
        self.jobs.iter().map(|e| e.value().clone()).collect()
    }

    pub fn active_jobs(&self) -> Vec<TransferJob> {
        self.jobs
            .iter()
            .filter(|e| !e.value().phase.is_terminal())
            .map(|e| e.value().clone())
            .collect()
    }

    /// Dismiss a terminal job. Running jobs cannot be dismissed.
    pub fn acknowledge(&self, job_id: Uuid) -> bool {
        self.jobs
            .remove_if(&job_id, |_, job| job.phase.is_terminal())
            .is_some()
    }
}

fn cancelled() -> FleetError {
    FleetError::Cancelled("transfers cancelled by logout".into())
}

fn job_retries(jobs: &DashMap<Uuid, TransferJob>, job_id: Uuid) -> u32 {
    jobs.get(&job_id).map(|j| j.retry_count).unwrap_or(u32::MAX)
}

fn size_matches(file: &RemoteFile, data: &Bytes) -> bool {
    file.size == 0 || data.len() as u64 == file.size
}
