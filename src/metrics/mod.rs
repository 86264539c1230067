//! Metrics and observability
//!
//! Prometheus-compatible metrics for device sessions and transfers.
//!
//! Key metrics exposed:
//! - Connection attempts and failures
//! - Probes and discovered file counts
//! - Files and bytes retrieved per transport
//! - Backend uploads and queue depth
//! - Transfer job outcomes and active job count

pub mod exporter;
pub mod recorder;

pub use exporter::{render_metrics, start_metrics_server, MetricsConfig, MetricsError};
pub use recorder::{
    init_metrics, record_connect_attempt, record_connect_failed, record_download,
    record_job_completed, record_job_failed, record_job_retry, record_job_started, record_probe,
    record_upload, set_queue_depth,
};
