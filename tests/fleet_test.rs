use fieldsync::device::{DeviceId, DeviceIdentity, HardwareAddress};
use fieldsync::error::FleetError;
use fieldsync::events::NotificationLevel;
use fieldsync::queue::upload::ENTRIES_KEY;
use fieldsync::queue::UploadQueueEntry;
use fieldsync::session::ConnectionStatus;
use fieldsync::sim::{RecordingSink, SimBackend, SimBulk, SimRadio};
use fieldsync::store::{load_json, KeyValueStore, MemoryStore};
use fieldsync::transfer::{TransferPhase, TransferProgress, TransferRequest};
use fieldsync::transport::TransportKind;
use fieldsync::{Fleet, FleetBuilder, FleetConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const RECORDER_42: &str = "54:32:04:01:E6:41";
const RECORDER_43: &str = "54:32:04:01:E6:42";

struct Harness {
    _dir: TempDir,
    fleet: Fleet,
    radio: Arc<SimRadio>,
    backend: Arc<SimBackend>,
    sink: Arc<RecordingSink>,
    store: Arc<MemoryStore>,
}

fn address(raw: &str) -> HardwareAddress {
    raw.parse().unwrap()
}

/// Two recorders on campaign 7: 42 holds two 2 KiB files, 43 holds one.
fn seeded_radio() -> Arc<SimRadio> {
    let radio = Arc::new(SimRadio::new());
    radio.set_scan_duration(Duration::from_millis(20));

    radio.add_device(address(RECORDER_42), "GNSS-42", -55);
    radio.add_file(address(RECORDER_42), 7, "day1.ubx", vec![0xA5; 2048]);
    radio.add_file(address(RECORDER_42), 7, "day2.ubx", vec![0x5A; 2048]);

    radio.add_device(address(RECORDER_43), "GNSS-43", -70);
    radio.add_file(address(RECORDER_43), 7, "site.obs", vec![1; 512]);
    radio
}

async fn harness_with(config: FleetConfig, dir: TempDir, bulk: bool) -> Harness {
    let radio = seeded_radio();
    let backend = Arc::new(SimBackend::new());
    let sink = Arc::new(RecordingSink::new());
    let store = Arc::new(MemoryStore::new());

    let mut builder = FleetBuilder::new(config, radio.clone(), backend.clone())
        .sink(sink.clone())
        .store(store.clone());
    if bulk {
        builder = builder.bulk(Arc::new(SimBulk::new(radio.clone())));
    }
    let fleet = builder.build().await.unwrap();
    fleet.register_devices([
        DeviceIdentity::new(42u64, address(RECORDER_42)).with_site(3),
        DeviceIdentity::new(43u64, address(RECORDER_43)),
    ]);

    Harness {
        _dir: dir,
        fleet,
        radio,
        backend,
        sink,
        store,
    }
}

async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let config = FleetConfig::ephemeral(dir.path());
    harness_with(config, dir, false).await
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_connect_probe_transfer_end_to_end() {
    let h = harness().await;
    let device = DeviceId(42);

    h.fleet.connect(device).await.unwrap();
    let summary = h.fleet.probe(device, 7).await.unwrap();
    assert_eq!(summary.file_count, 2);
    assert_eq!(summary.total_size, 4096);

    let job = h
        .fleet
        .run_transfer(TransferRequest::campaign(42u64, 7))
        .await
        .unwrap();
    assert_eq!(job.phase, TransferPhase::Completed);
    assert_eq!(job.file_count, 2);
    assert_eq!(job.total_bytes, 4096);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.transport, Some(TransportKind::Ble));

    let persisted: Vec<UploadQueueEntry> = load_json(h.store.as_ref(), ENTRIES_KEY)
        .await
        .unwrap()
        .unwrap_or_default();
    assert_eq!(persisted.iter().filter(|e| e.device_id == device).count(), 0);

    let uploads = h.backend.uploads();
    assert_eq!(uploads.len(), 2);
    assert!(uploads.iter().all(|u| u.context.site_id == Some(3)));
    assert!(h.radio.remote_files(address(RECORDER_42), 7).is_empty());

    let session = h.fleet.session(device).unwrap();
    assert_eq!(session.status, ConnectionStatus::Connected);
    assert!(session.activity.is_none());
}

#[tokio::test]
async fn test_transfer_reports_progress_at_phase_boundaries() {
    let h = harness().await;
    let seen: Arc<Mutex<Vec<TransferProgress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    let job = h
        .fleet
        .run_transfer_with_progress(
            TransferRequest::campaign(42u64, 7),
            Arc::new(move |p| sink.lock().push(p)),
        )
        .await
        .unwrap();
    assert_eq!(job.phase, TransferPhase::Completed);

    let seen = seen.lock();
    let phases: Vec<TransferPhase> = seen.iter().map(|p| p.phase).collect();
    let mut distinct = phases.clone();
    distinct.dedup();
    assert_eq!(
        distinct,
        vec![
            TransferPhase::Initializing,
            TransferPhase::Connecting,
            TransferPhase::Probing,
            TransferPhase::Downloading,
            TransferPhase::Storing,
            TransferPhase::Uploading,
            TransferPhase::Cleanup,
            TransferPhase::Completed,
        ]
    );
    let last = seen.last().unwrap();
    assert_eq!(last.files_done, 2);
    assert_eq!(last.bytes_done, 4096);
}

#[tokio::test]
async fn test_bulk_transport_preferred_when_reachable() {
    let dir = TempDir::new().unwrap();
    let config = FleetConfig::ephemeral(dir.path());
    let h = harness_with(config, dir, true).await;

    let job = h
        .fleet
        .run_transfer(TransferRequest::campaign(42u64, 7))
        .await
        .unwrap();
    assert_eq!(job.phase, TransferPhase::Completed);
    assert_eq!(job.transport, Some(TransportKind::Wifi));
    assert_eq!(h.radio.read_calls(), 0);
    assert_eq!(h.backend.uploads().len(), 2);
}

#[tokio::test]
async fn test_jobs_on_different_devices_run_in_parallel() {
    let h = harness().await;

    let (a, b) = tokio::join!(
        h.fleet.run_transfer(TransferRequest::campaign(42u64, 7)),
        h.fleet.run_transfer(TransferRequest::campaign(43u64, 7)),
    );
    assert_eq!(a.unwrap().phase, TransferPhase::Completed);
    assert_eq!(b.unwrap().phase, TransferPhase::Completed);
    assert_eq!(h.backend.uploads().len(), 3);
    assert!(h.fleet.queue().is_empty());
}

#[tokio::test]
async fn test_conflicting_operations_are_busy() {
    let h = harness().await;
    h.fleet.connect(DeviceId(42)).await.unwrap();
    h.radio.set_request_latency(Duration::from_millis(200));

    let job_id = h
        .fleet
        .spawn_transfer(TransferRequest::campaign(42u64, 7))
        .unwrap();

    let err = h
        .fleet
        .spawn_transfer(TransferRequest::campaign(42u64, 7))
        .unwrap_err();
    assert!(matches!(err, FleetError::Busy { .. }));

    eventually("job to start probing", || {
        h.fleet
            .session(DeviceId(42))
            .is_some_and(|s| s.activity.is_some())
    })
    .await;
    let err = h.fleet.probe(DeviceId(42), 7).await.unwrap_err();
    assert!(matches!(err, FleetError::Busy { .. }));
    assert!(h.fleet.synchronizer().is_busy());

    let orchestrator = h.fleet.orchestrator().clone();
    eventually("job to finish", || {
        orchestrator
            .job(job_id)
            .is_some_and(|job| job.phase.is_terminal())
    })
    .await;
    assert_eq!(
        h.fleet.orchestrator().job(job_id).unwrap().phase,
        TransferPhase::Completed
    );

    let sync = h.fleet.synchronizer().clone();
    eventually("activity flag to drop", || !sync.is_busy()).await;
    assert_eq!(h.sink.busy_history(), vec![true, false]);
}

#[tokio::test]
async fn test_exhausted_job_notifies_and_keeps_uploads() {
    let dir = TempDir::new().unwrap();
    let config = FleetConfig {
        max_retries: 0,
        ..FleetConfig::ephemeral(dir.path())
    };
    let h = harness_with(config, dir, false).await;
    h.backend.fail_file("day2.ubx");

    let job = h
        .fleet
        .run_transfer(TransferRequest::campaign(42u64, 7))
        .await
        .unwrap();
    assert_eq!(job.phase, TransferPhase::Error);
    assert!(matches!(job.error, Some(FleetError::UploadFailed(_))));

    let pending: Vec<String> = h
        .fleet
        .queue()
        .entries()
        .into_iter()
        .map(|e| e.file_name)
        .collect();
    assert_eq!(pending, vec!["day2.ubx".to_string()]);

    let errors: Vec<_> = h
        .sink
        .notifications()
        .into_iter()
        .filter(|n| n.level == NotificationLevel::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].requires_ack);

    // Backend recovers; the queue delivers without touching the device
    h.backend.clear_failures();
    let report = h.fleet.process_uploads().await.unwrap();
    assert_eq!(report.uploaded.len(), 1);
    assert!(h.fleet.queue().is_empty());
    assert!(h.fleet.orchestrator().acknowledge(job.id));
}

#[tokio::test]
async fn test_logout_cascades_teardown() {
    let dir = TempDir::new().unwrap();
    let config = FleetConfig {
        max_retries: 0,
        ..FleetConfig::ephemeral(dir.path())
    };
    let h = harness_with(config, dir, false).await;
    h.backend.fail_all_uploads(true);

    h.fleet.connect(DeviceId(43)).await.unwrap();
    let job = h
        .fleet
        .run_transfer(TransferRequest::campaign(42u64, 7))
        .await
        .unwrap();
    assert_eq!(job.phase, TransferPhase::Error);
    assert_eq!(h.fleet.queue().len(), 2);

    h.fleet.logout();

    let registry = h.fleet.registry().clone();
    eventually("sessions to be torn down", || registry.sessions().is_empty()).await;
    let queue = h.fleet.queue().clone();
    eventually("queue to be cleared", || queue.is_empty()).await;
    assert!(!h.radio.is_connected(address(RECORDER_42)));
    assert!(!h.radio.is_connected(address(RECORDER_43)));

    let sink = h.sink.clone();
    eventually("logout toast", || {
        sink.notifications()
            .iter()
            .any(|n| n.level == NotificationLevel::Info && !n.requires_ack)
    })
    .await;

    // Persisted queue is empty too
    let persisted: Vec<UploadQueueEntry> = load_json(h.store.as_ref(), ENTRIES_KEY)
        .await
        .unwrap()
        .unwrap_or_default();
    assert!(persisted.is_empty());
    assert!(h.store.get(ENTRIES_KEY).await.unwrap().is_some());
}

#[tokio::test]
async fn test_logout_during_download_cancels_job() {
    let h = harness().await;
    h.radio.set_request_latency(Duration::from_millis(100));

    let job_id = h
        .fleet
        .spawn_transfer(TransferRequest::campaign(42u64, 7))
        .unwrap();
    let orchestrator = h.fleet.orchestrator().clone();
    eventually("job to start downloading", || {
        orchestrator
            .job(job_id)
            .is_some_and(|job| job.phase == TransferPhase::Downloading)
    })
    .await;

    h.fleet.logout();
    eventually("job to stop", || {
        orchestrator
            .job(job_id)
            .is_some_and(|job| job.phase.is_terminal())
    })
    .await;

    let job = orchestrator.job(job_id).unwrap();
    assert_eq!(job.phase, TransferPhase::Error);
    assert!(matches!(job.error, Some(FleetError::Cancelled(_))));
    assert_eq!(job.retry_count, 0);

    // Give a retry every chance to show up
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.radio.connect_calls(), 1);
    assert!(!h.radio.is_connected(address(RECORDER_42)));
    assert!(h.backend.uploads().is_empty());
    assert!(h.fleet.queue().is_empty());
    assert_eq!(h.radio.remote_files(address(RECORDER_42), 7).len(), 2);
    assert!(h.sink.notifications().iter().all(|n| !n.requires_ack));
}

#[tokio::test]
async fn test_queue_pass_during_job_upload_delivers_once() {
    let h = harness().await;
    h.backend.set_upload_latency(Duration::from_millis(100));

    let job_id = h
        .fleet
        .spawn_transfer(TransferRequest::campaign(42u64, 7))
        .unwrap();
    let orchestrator = h.fleet.orchestrator().clone();
    eventually("job to start uploading", || {
        orchestrator
            .job(job_id)
            .is_some_and(|job| job.phase == TransferPhase::Uploading)
    })
    .await;

    h.fleet.process_uploads().await.unwrap();
    eventually("job to finish", || {
        orchestrator
            .job(job_id)
            .is_some_and(|job| job.phase.is_terminal())
    })
    .await;

    let job = orchestrator.job(job_id).unwrap();
    assert_eq!(job.phase, TransferPhase::Completed);
    assert!(job.error.is_none());

    let mut names = h.backend.uploaded_names();
    names.sort();
    assert_eq!(names, vec!["day1.ubx", "day2.ubx"]);
    assert_eq!(h.backend.upload_attempts(), 2);
    assert!(h.fleet.queue().is_empty());
    assert_eq!(h.fleet.queue().stats().total_uploaded, 2);
}

#[tokio::test]
async fn test_upload_queue_survives_restart_on_sqlite() {
    let dir = TempDir::new().unwrap();
    let config = FleetConfig {
        max_retries: 0,
        artifact_dir: dir.path().join("artifacts"),
        store_path: format!("sqlite://{}?mode=rwc", dir.path().join("fleet.db").display()),
        ..FleetConfig::default()
    };

    let radio = seeded_radio();
    {
        let backend = Arc::new(SimBackend::new());
        backend.fail_all_uploads(true);
        let fleet = FleetBuilder::new(config.clone(), radio.clone(), backend)
            .build()
            .await
            .unwrap();
        fleet.register_device(DeviceIdentity::new(42u64, address(RECORDER_42)));

        let job = fleet
            .run_transfer(TransferRequest::campaign(42u64, 7))
            .await
            .unwrap();
        assert_eq!(job.phase, TransferPhase::Error);
        assert_eq!(fleet.queue().len(), 2);
        fleet.shutdown().await;
    }

    let backend = Arc::new(SimBackend::new());
    let fleet = FleetBuilder::new(config, radio.clone(), backend.clone())
        .build()
        .await
        .unwrap();
    assert_eq!(fleet.queue().pending_for(DeviceId(42)).len(), 2);
    assert_eq!(fleet.queue().stats().total_enqueued, 2);

    let report = fleet.process_uploads().await.unwrap();
    assert_eq!(report.uploaded, 2);
    assert!(fleet.queue().is_empty());
    let mut names = backend.uploaded_names();
    names.sort();
    assert_eq!(names, vec!["day1.ubx".to_string(), "day2.ubx".to_string()]);
    // The device was never contacted again
    assert_eq!(radio.read_calls(), 2);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = FleetConfig {
        backoff_base_ms: 60_000,
        backoff_max_ms: 1_000,
        ..FleetConfig::ephemeral(dir.path())
    };
    let result = FleetBuilder::new(
        config,
        Arc::new(SimRadio::new()),
        Arc::new(SimBackend::new()),
    )
    .build()
    .await;
    assert!(result.is_err());
}
