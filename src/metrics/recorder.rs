//! Metrics recorder for device sessions and transfer jobs

use crate::transport::TransportKind;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    // Sessions
    describe_counter!(
        "fieldsync_connect_attempts_total",
        "Connection attempts issued to the radio"
    );
    describe_counter!(
        "fieldsync_connect_failures_total",
        "Connection attempts that ended in error"
    );
    describe_counter!("fieldsync_probes_total", "File probes by outcome");
    describe_histogram!(
        "fieldsync_probe_files",
        "Number of files reported by a successful probe"
    );

    // Retrieval
    describe_counter!(
        "fieldsync_files_downloaded_total",
        "Files retrieved from devices"
    );
    describe_counter!(
        "fieldsync_bytes_downloaded_total",
        "Bytes retrieved from devices"
    );
    describe_counter!("fieldsync_uploads_total", "Backend uploads by outcome");
    describe_counter!(
        "fieldsync_bytes_uploaded_total",
        "Bytes accepted by the backend"
    );

    // Jobs
    describe_counter!("fieldsync_jobs_started_total", "Transfer jobs started");
    describe_counter!(
        "fieldsync_jobs_completed_total",
        "Transfer jobs that completed"
    );
    describe_counter!(
        "fieldsync_jobs_failed_total",
        "Transfer jobs that ended in error"
    );
    describe_counter!("fieldsync_job_retries_total", "Transfer job re-attempts");
    describe_gauge!("fieldsync_active_jobs", "Transfer jobs currently running");
    describe_histogram!(
        "fieldsync_job_duration_seconds",
        "Wall time of a transfer job, retries included"
    );

    describe_gauge!("fieldsync_queue_depth", "Entries waiting in the upload queue");
}

// ============== Sessions ==============

pub fn record_connect_attempt() {
    counter!("fieldsync_connect_attempts_total").increment(1);
}

pub fn record_connect_failed(kind: &str) {
    counter!("fieldsync_connect_failures_total", "kind" => kind.to_string()).increment(1);
}

pub fn record_probe(ok: bool, file_count: usize) {
    let outcome = if ok { "ok" } else { "failed" };
    counter!("fieldsync_probes_total", "outcome" => outcome).increment(1);
    if ok {
        histogram!("fieldsync_probe_files").record(file_count as f64);
    }
}

// ============== Retrieval ==============

pub fn record_download(transport: TransportKind, bytes: u64) {
    let transport = transport.to_string();
    counter!("fieldsync_files_downloaded_total", "transport" => transport.clone()).increment(1);
    counter!("fieldsync_bytes_downloaded_total", "transport" => transport).increment(bytes);
}

pub fn record_upload(ok: bool, bytes: u64) {
    let outcome = if ok { "ok" } else { "failed" };
    counter!("fieldsync_uploads_total", "outcome" => outcome).increment(1);
    if ok {
        counter!("fieldsync_bytes_uploaded_total").increment(bytes);
    }
}

// ============== Jobs ==============

pub fn record_job_started() {
    counter!("fieldsync_jobs_started_total").increment(1);
    gauge!("fieldsync_active_jobs").increment(1.0);
}

pub fn record_job_completed(duration: Duration) {
    counter!("fieldsync_jobs_completed_total").increment(1);
    gauge!("fieldsync_active_jobs").decrement(1.0);
    histogram!("fieldsync_job_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_job_failed(kind: &str, duration: Duration) {
    counter!("fieldsync_jobs_failed_total", "kind" => kind.to_string()).increment(1);
    gauge!("fieldsync_active_jobs").decrement(1.0);
    histogram!("fieldsync_job_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_job_retry() {
    counter!("fieldsync_job_retries_total").increment(1);
}

// ============== Queue ==============

pub fn set_queue_depth(depth: usize) {
    gauge!("fieldsync_queue_depth").set(depth as f64);
}
