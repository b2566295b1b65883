// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Replication of new copies (count, bytes, failures)
//! - Disown transitions
//! - Cleaner passes and reclaimed copies
//! - Lifecycle loop runs
//! - Circuit breaker calls
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `backup_`:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track durations in `_seconds`
//!
//! The crate never installs a recorder; without one every call is a no-op.
//!
//! # Usage
//!
//! ```rust,no_run
//! use object_backup::metrics;
//! use std::time::Duration;
//!
//! metrics::record_object_replicated(1024, Duration::from_millis(12));
//! metrics::record_cleaner_pass(10, 0, Duration::from_millis(80));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a successfully replicated copy.
pub fn record_object_replicated(size: u64, duration: Duration) {
    counter!("backup_objects_replicated_total").increment(1);
    counter!("backup_bytes_replicated_total").increment(size);
    histogram!("backup_replication_duration_seconds").record(duration.as_secs_f64());
}

/// Record a failed replication, labelled by error kind.
pub fn record_replication_failure(error_kind: &str) {
    counter!("backup_replication_failures_total", "error_type" => error_kind.to_string()).increment(1);
}

/// Record a CREATED event whose source object was already gone.
pub fn record_source_missing() {
    counter!("backup_source_missing_total").increment(1);
}

/// Record a disown attempt (`disowned`, `already_disowned`, `absent`).
pub fn record_disown(outcome: &str) {
    counter!("backup_disown_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record copies pruned because an object exceeded its copy limit.
pub fn record_copies_pruned(count: usize) {
    counter!("backup_copies_pruned_total").increment(count as u64);
}

/// Record an incoming event and how it was handled.
pub fn record_event(event_type: &str, outcome: &str) {
    counter!(
        "backup_events_total",
        "event_type" => event_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a completed cleaner pass.
pub fn record_cleaner_pass(reclaimed: usize, failed: usize, duration: Duration) {
    counter!("backup_cleaner_passes_total").increment(1);
    counter!("backup_copies_reclaimed_total").increment(reclaimed as u64);
    if failed > 0 {
        counter!("backup_reclaim_failures_total").increment(failed as u64);
    }
    histogram!("backup_cleaner_pass_duration_seconds").record(duration.as_secs_f64());
}

/// Record where a single reclaim failed (`blob`, `record`, `circuit`).
pub fn record_reclaim_failure(stage: &str) {
    counter!("backup_reclaim_stage_failures_total", "stage" => stage.to_string()).increment(1);
}

/// Record a finished lifecycle loop run.
pub fn record_lifecycle_run(final_state: &str, passes: u32, duration: Duration) {
    counter!("backup_lifecycle_runs_total", "state" => final_state.to_string()).increment(1);
    histogram!("backup_lifecycle_passes").record(f64::from(passes));
    histogram!("backup_lifecycle_duration_seconds").record(duration.as_secs_f64());
}

/// Record a store call that hit its deadline.
pub fn record_store_timeout(operation: &str) {
    counter!("backup_store_timeouts_total", "operation" => operation.to_string()).increment(1);
}

/// Record metadata SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn metadata_retries_total(operation: &str) {
    counter!("backup_metadata_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Gauge for service state.
pub fn set_service_state(state: &str) {
    // Numeric encoding for alerting
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        "Failed" => 4.0,
        _ => -1.0,
    };
    gauge!("backup_service_state").set(value);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "backup_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}
