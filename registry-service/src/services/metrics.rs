//! Prometheus metrics for registry-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Authorization decisions by action and outcome.
pub static AUTHZ_DECISIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "registry_authz_decisions_total",
        "Total number of authorization decisions",
        &["action", "outcome"]
    )
    .expect("Failed to register AUTHZ_DECISIONS")
});

/// Histogram for database query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "registry_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Reconciliation outcomes by entity kind.
pub static RECONCILE_ENTRIES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "registry_reconcile_entries_total",
        "Edge cache entries seen by reconciliation",
        &["kind", "outcome"]
    )
    .expect("Failed to register RECONCILE_ENTRIES")
});

/// Edge cache write-through failures by operation.
pub static MIRROR_FAILURES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "registry_cache_mirror_failures_total",
        "Edge cache mirror failures",
        &["operation"]
    )
    .expect("Failed to register MIRROR_FAILURES")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&AUTHZ_DECISIONS);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&RECONCILE_ENTRIES);
    Lazy::force(&MIRROR_FAILURES);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_authz_decision(action: &str, outcome: &str) {
    AUTHZ_DECISIONS.with_label_values(&[action, outcome]).inc();
}

pub fn record_reconcile_entry(kind: &str, outcome: &str) {
    RECONCILE_ENTRIES.with_label_values(&[kind, outcome]).inc();
}

pub fn record_mirror_failure(operation: &str) {
    MIRROR_FAILURES.with_label_values(&[operation]).inc();
}
