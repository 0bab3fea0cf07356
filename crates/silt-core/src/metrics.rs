//! Prometheus metrics for the compaction engine.
//!
//! Metrics are registered lazily on first access using once_cell::Lazy.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
    Encoder, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, TextEncoder,
};

// ===== Compaction Metrics =====

/// Plans by trigger and terminal outcome (completed, failed)
pub static COMPACTION_PLANS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "silt_compaction_plans_total",
        "Total number of compaction plans by trigger and outcome",
        &["trigger", "outcome"]
    )
    .expect("Failed to register compaction plan counter")
});

/// Plan execution duration
pub static COMPACTION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "silt_compaction_duration_seconds",
        "Compaction plan execution duration in seconds",
        &["kind"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]
    )
    .expect("Failed to register compaction duration histogram")
});

/// Rows and delete records physically removed by compaction
pub static COMPACTION_REMOVED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "silt_compaction_removed_total",
        "Rows and delete records physically removed by compaction",
        &["what"]
    )
    .expect("Failed to register compaction removed counter")
});

/// Plans currently executing
pub static COMPACTION_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "silt_compaction_in_flight",
        "Number of compaction plans currently executing"
    )
    .expect("Failed to register in-flight gauge")
});

// ===== Catalog Metrics =====

/// Segments tracked by the catalog, by state
pub static CATALOG_SEGMENTS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "silt_catalog_segments",
        "Number of segments in the catalog by state",
        &["state"]
    )
    .expect("Failed to register catalog segment gauge")
});

/// Render every registered metric in the Prometheus text format.
pub fn export_text() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
