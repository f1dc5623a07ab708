//! Prometheus metrics for the lookaside cache
//!
//! Counters mirror [`crate::cache::CacheStats`] but live in the global
//! registry so a host process can scrape every cache it runs.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

lazy_static! {
    /// Counter: cache operations (hit, miss, coalesced, ...)
    pub static ref CACHE_OPERATIONS: CounterVec = register_counter_vec!(
        "chatter_cache_operations_total",
        "Lookaside cache operations by type",
        &["operation"]
    )
    .expect("Failed to create cache_operations metric");

    /// Counter: storage errors by operation (read, write)
    pub static ref STORAGE_ERRORS: CounterVec = register_counter_vec!(
        "chatter_cache_storage_errors_total",
        "Persistent storage failures by operation",
        &["operation"]
    )
    .expect("Failed to create storage_errors metric");

    /// Histogram: external lookup latency (seconds)
    pub static ref LOOKUP_DURATION: HistogramVec = register_histogram_vec!(
        "chatter_cache_lookup_duration_seconds",
        "Duration of external profile lookups",
        &["outcome"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("Failed to create lookup_duration metric");
}

pub fn record_cache_op(operation: &str) {
    CACHE_OPERATIONS.with_label_values(&[operation]).inc();
}

pub fn record_storage_error(operation: &str) {
    STORAGE_ERRORS.with_label_values(&[operation]).inc();
}

/// Record a finished lookup; `outcome` is "ok" or "error"
pub fn record_lookup_duration(outcome: &str, duration_secs: f64) {
    LOOKUP_DURATION
        .with_label_values(&[outcome])
        .observe(duration_secs);
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> crate::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| crate::CacheError::Other(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| crate::CacheError::Other(format!("Metrics are not UTF-8: {}", e)))
}
