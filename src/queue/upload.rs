use crate::backend::{BackendApi, UploadReceipt, UploadRequest};
use crate::config::FleetConfig;
use crate::device::DeviceId;
use crate::metrics;
use crate::queue::error::{QueueError, QueueResult};
use crate::queue::types::{ProcessReport, QueueStats, UploadQueueEntry};
use crate::store::{load_json, save_json, ArtifactStore, KeyValueStore};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub const ENTRIES_KEY: &str = "upload_queue.entries";
pub const STATS_KEY: &str = "upload_queue.stats";

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;
type Claims = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// Exclusive right to deliver one entry. The map slot is dropped with the
/// last holder or waiter.
struct DeliveryClaim {
    claims: Claims,
    file_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for DeliveryClaim {
    fn drop(&mut self) {
        // Map and our guard hold two references; more means someone waits
        self.claims
            .remove_if(&self.file_id, |_, lock| Arc::strong_count(lock) <= 2);
    }
}

#[derive(Clone)]
pub struct UploadQueue {
    /// Insertion order
    entries: Arc<RwLock<Vec<UploadQueueEntry>>>,
    stats: Arc<RwLock<QueueStats>>,
    paused: Arc<AtomicBool>,
    /// One processing pass at a time
    pass: Arc<Mutex<()>>,
    /// Entries being delivered right now, by file id
    claims: Claims,
    /// Orders snapshot-and-write so the last write carries the latest state
    persist_lock: Arc<Mutex<()>>,
    store: Arc<dyn KeyValueStore>,
    backend: Arc<dyn BackendApi>,
    artifacts: ArtifactStore,
    limiter: Option<Arc<Limiter>>,
}

impl UploadQueue {
    /// Restore entries and statistics persisted by a previous run.
    pub async fn load(
        store: Arc<dyn KeyValueStore>,
        backend: Arc<dyn BackendApi>,
        artifacts: ArtifactStore,
        config: &FleetConfig,
    ) -> QueueResult<Self> {
        let entries: Vec<UploadQueueEntry> =
            load_json(store.as_ref(), ENTRIES_KEY).await?.unwrap_or_default();
        let stats: QueueStats = load_json(store.as_ref(), STATS_KEY).await?.unwrap_or_default();

        if !entries.is_empty() {
            tracing::info!(pending = entries.len(), "Recovered upload queue");
        }
        metrics::set_queue_depth(entries.len());

        let limiter = NonZeroU32::new(config.queue_uploads_per_second)
            .map(|rate| Arc::new(RateLimiter::direct(Quota::per_second(rate))));

        Ok(Self {
            entries: Arc::new(RwLock::new(entries)),
            stats: Arc::new(RwLock::new(stats)),
            paused: Arc::new(AtomicBool::new(false)),
            pass: Arc::new(Mutex::new(())),
            claims: Arc::new(DashMap::new()),
            persist_lock: Arc::new(Mutex::new(())),
            store,
            backend,
            artifacts,
            limiter,
        })
    }

    /// Add an entry. An entry with the same file id is replaced in place,
    /// keeping its position; returns whether the entry was new.
    pub async fn enqueue(&self, entry: UploadQueueEntry) -> QueueResult<bool> {
        let inserted = {
            let mut entries = self.entries.write();
            match entries.iter_mut().find(|e| e.file_id == entry.file_id) {
                Some(existing) => {
                    *existing = entry;
                    false
                }
                None => {
                    entries.push(entry);
                    true
                }
            }
        };
        if inserted {
            self.stats.write().total_enqueued += 1;
        }
        self.persist().await?;
        Ok(inserted)
    }

    pub async fn dequeue(&self, file_id: &str) -> QueueResult<Option<UploadQueueEntry>> {
        let removed = {
            let mut entries = self.entries.write();
            entries
                .iter()
                .position(|e| e.file_id == file_id)
                .map(|idx| entries.remove(idx))
        };
        if removed.is_some() {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Attempt every current entry once. Failing entries stay queued for the
    /// next pass; accepted ones are removed along with their local artifact.
    pub async fn process_queue(&self) -> QueueResult<ProcessReport> {
        if self.is_paused() {
            return Err(QueueError::Paused);
        }
        let _pass = self.pass.lock().await;

        let mut per_device: BTreeMap<DeviceId, Vec<String>> = BTreeMap::new();
        for entry in self.entries.read().iter() {
            per_device
                .entry(entry.device_id)
                .or_default()
                .push(entry.file_id.clone());
        }

        let lanes = per_device
            .into_values()
            .map(|file_ids| self.process_lane(file_ids));
        let mut report = ProcessReport::default();
        for lane in join_all(lanes).await {
            report.attempted += lane.attempted;
            report.uploaded.extend(lane.uploaded);
            report.failed.extend(lane.failed);
            report.skipped += lane.skipped;
        }

        self.stats.write().last_processed_at = Some(Utc::now());
        self.persist().await?;
        tracing::info!(
            attempted = report.attempted,
            uploaded = report.uploaded.len(),
            failed = report.failed.len(),
            "Upload queue pass finished"
        );
        Ok(report)
    }

    /// One device's entries, strictly in order
    async fn process_lane(&self, file_ids: Vec<String>) -> ProcessReport {
        let mut report = ProcessReport::default();
        for file_id in file_ids {
            if self.is_paused() {
                report.skipped += 1;
                continue;
            }
            report.attempted += 1;
            match self.upload(&file_id).await {
                Ok(_) => report.uploaded.push(file_id),
                Err(QueueError::EntryNotFound(_)) => report.attempted -= 1,
                Err(e) => {
                    tracing::warn!(%file_id, "Queued upload failed: {}", e);
                    report.failed.push(file_id);
                }
            }
        }
        report
    }

    /// Upload a single entry now, regardless of pause state. On success the
    /// entry and its artifact are removed; on failure the entry stays queued.
    ///
    /// Concurrent callers for the same entry are serialised; a caller that
    /// waited on a successful delivery gets `EntryNotFound`.
    pub async fn upload(&self, file_id: &str) -> QueueResult<UploadReceipt> {
        let _claim = self.claim(file_id).await;
        let entry = self
            .entry(file_id)
            .ok_or_else(|| QueueError::EntryNotFound(file_id.to_string()))?;

        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        match self.deliver(&entry).await {
            Ok(receipt) => {
                self.entries.write().retain(|e| e.file_id != entry.file_id);
                {
                    let mut stats = self.stats.write();
                    stats.total_uploaded += 1;
                    stats.bytes_uploaded += entry.size;
                }
                self.persist().await?;
                metrics::record_upload(true, entry.size);

                if let Err(e) = self.artifacts.remove(&entry.local_path).await {
                    tracing::warn!(file_id, "Could not remove uploaded artifact: {}", e);
                }
                tracing::debug!(file_id, remote_id = ?receipt.remote_id, "Uploaded");
                Ok(receipt)
            }
            Err(e) => {
                {
                    let mut entries = self.entries.write();
                    if let Some(queued) = entries.iter_mut().find(|q| q.file_id == entry.file_id) {
                        queued.attempts += 1;
                        queued.last_error = Some(e.to_string());
                    }
                }
                self.stats.write().total_failed_attempts += 1;
                self.persist().await?;
                metrics::record_upload(false, 0);
                Err(e)
            }
        }
    }

    async fn claim(&self, file_id: &str) -> DeliveryClaim {
        let lock = self
            .claims
            .entry(file_id.to_string())
            .or_default()
            .clone();
        DeliveryClaim {
            claims: self.claims.clone(),
            file_id: file_id.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    async fn deliver(&self, entry: &UploadQueueEntry) -> QueueResult<UploadReceipt> {
        let data = self
            .artifacts
            .read(&entry.local_path)
            .await
            .map_err(|e| QueueError::Artifact(e.to_string()))?;
        if !ArtifactStore::verify(&data, &entry.checksum) {
            return Err(QueueError::Artifact(format!(
                "checksum mismatch for {}",
                entry.local_path.display()
            )));
        }

        self.backend
            .upload_file(UploadRequest {
                context: entry.context.clone(),
                campaign_id: entry.campaign_id,
                file_name: entry.file_name.clone(),
                data,
            })
            .await
            .map_err(|e| QueueError::Upload(e.to_string()))
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            tracing::info!("Upload queue paused");
        }
    }

    /// Lift the pause and run one pass immediately
    pub async fn resume(&self) -> QueueResult<ProcessReport> {
        if self.paused.swap(false, Ordering::SeqCst) {
            tracing::info!("Upload queue resumed");
        }
        self.process_queue().await
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Drop every entry and reset the statistics. Local artifacts stay on disk.
    pub async fn clear(&self) -> QueueResult<usize> {
        let dropped = {
            let mut entries = self.entries.write();
            let count = entries.len();
            entries.clear();
            count
        };
        *self.stats.write() = QueueStats::default();
        self.persist().await?;
        Ok(dropped)
    }

    pub fn entry(&self, file_id: &str) -> Option<UploadQueueEntry> {
        self.entries
            .read()
            .iter()
            .find(|e| e.file_id == file_id)
            .cloned()
    }

    pub fn entries(&self) -> Vec<UploadQueueEntry> {
        self.entries.read().clone()
    }

    pub fn pending_for(&self, device_id: DeviceId) -> Vec<UploadQueueEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.device_id == device_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        self.stats.read().clone()
    }

    async fn persist(&self) -> QueueResult<()> {
        let _ordered = self.persist_lock.lock().await;
        let entries = self.entries();
        let stats = self.stats();
        save_json(self.store.as_ref(), ENTRIES_KEY, &entries).await?;
        save_json(self.store.as_ref(), STATS_KEY, &stats).await?;
        metrics::set_queue_depth(entries.len());
        Ok(())
    }
}
