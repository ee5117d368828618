//! Metrics for observability.
//!
//! Emits Prometheus-compatible metrics through the `metrics` facade for:
//! - Backup streams served (accepted / rejected / completed / failed)
//! - Backup uploads taken by the client
//! - Clone outcomes per source kind
//! - Configuration runs and engine retries
//!
//! The binary does not install an exporter; an embedding process may.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `sidecar_`:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a backup trigger outcome at the lock: `accepted` or `rejected`.
pub fn record_backup_trigger(accepted: bool) {
    let status = if accepted { "accepted" } else { "rejected" };
    counter!("sidecar_backup_triggers_total", "status" => status).increment(1);
}

/// Whether this node is currently producing a backup.
pub fn record_backup_in_progress(in_progress: bool) {
    gauge!("sidecar_backup_in_progress").set(if in_progress { 1.0 } else { 0.0 });
}

/// Record the end of a served backup stream.
pub fn record_backup_served(success: bool, bytes: u64, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("sidecar_backups_served_total", "status" => status).increment(1);
    counter!("sidecar_backup_bytes_served_total").increment(bytes);
    histogram!("sidecar_backup_serve_duration_seconds").record(duration.as_secs_f64());
}

/// Record a backup upload (take-backup-to) outcome.
pub fn record_backup_upload(stage: Option<&str>, bytes: u64, duration: Duration) {
    let status = stage.unwrap_or("success").to_string();
    counter!("sidecar_backup_uploads_total", "status" => status).increment(1);
    counter!("sidecar_backup_bytes_uploaded_total").increment(bytes);
    histogram!("sidecar_backup_upload_duration_seconds").record(duration.as_secs_f64());
}

/// Record a clone attempt outcome.
pub fn record_clone(source_kind: &str, success: bool, bytes: u64, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "sidecar_clones_total",
        "source" => source_kind.to_string(),
        "status" => status
    )
    .increment(1);
    counter!("sidecar_clone_bytes_total").increment(bytes);
    histogram!("sidecar_clone_duration_seconds", "source" => source_kind.to_string())
        .record(duration.as_secs_f64());
}

/// Record a configure pass, with the number of statements actually issued.
pub fn record_configure(success: bool, statements: usize) {
    let status = if success { "success" } else { "failure" };
    counter!("sidecar_configure_runs_total", "status" => status).increment(1);
    histogram!("sidecar_configure_statements").record(statements as f64);
}

/// Record a retried operation.
pub fn record_retry(operation: &str) {
    counter!("sidecar_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a peer probe during donor discovery.
pub fn record_peer_probe(peer: &str, accepted: bool) {
    let status = if accepted { "accepted" } else { "rejected" };
    counter!("sidecar_peer_probes_total", "peer" => peer.to_string(), "status" => status)
        .increment(1);
}
