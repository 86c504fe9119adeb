//! Metrics module
//!
//! Prometheus counters for uploads, provider requests and aborts. Batch runs
//! can dump them in the text exposition format with [`write_textfile`].

use crate::upload::Provider;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use std::path::Path;

lazy_static! {
    // Upload metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "presign_uploads_total",
        "Total number of uploads",
        &["provider", "status"]
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: CounterVec = register_counter_vec!(
        "presign_upload_bytes_total",
        "Total bytes uploaded",
        &["provider"]
    ).unwrap();

    pub static ref UPLOAD_DURATION: HistogramVec = register_histogram_vec!(
        "presign_upload_duration_seconds",
        "Upload duration in seconds",
        &["provider"],
        vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0, 14400.0]
    ).unwrap();

    // Provider request metrics
    pub static ref PROVIDER_REQUESTS: CounterVec = register_counter_vec!(
        "presign_provider_requests_total",
        "Requests sent to the storage provider",
        &["provider", "operation", "status_code"]
    ).unwrap();

    // Abort metrics
    pub static ref ABORTS_TOTAL: CounterVec = register_counter_vec!(
        "presign_aborts_total",
        "Abort attempts by outcome",
        &["provider", "status"]
    ).unwrap();
}

/// Record a successful upload
pub fn record_upload_success(provider: Provider, bytes: u64, duration_secs: f64) {
    UPLOADS_TOTAL
        .with_label_values(&[provider.as_str(), "success"])
        .inc();
    UPLOAD_BYTES_TOTAL
        .with_label_values(&[provider.as_str()])
        .inc_by(bytes as f64);
    UPLOAD_DURATION
        .with_label_values(&[provider.as_str()])
        .observe(duration_secs);
}

/// Record a failed upload
pub fn record_upload_failure(provider: Provider) {
    UPLOADS_TOTAL
        .with_label_values(&[provider.as_str(), "failure"])
        .inc();
}

/// Record one provider response
pub fn record_request(provider: Provider, operation: &str, status_code: u16) {
    let status = status_code.to_string();
    PROVIDER_REQUESTS
        .with_label_values(&[provider.as_str(), operation, status.as_str()])
        .inc();
}

/// Record an abort attempt
pub fn record_abort(provider: Provider, success: bool) {
    let status = if success { "success" } else { "failure" };
    ABORTS_TOTAL
        .with_label_values(&[provider.as_str(), status])
        .inc();
}

/// Encode every registered metric in the Prometheus text format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Write metrics for a node_exporter textfile collector
pub fn write_textfile(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, gather_text())
}
