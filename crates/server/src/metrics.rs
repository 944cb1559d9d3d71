//! Prometheus metrics for observability.
//!
//! This module provides metrics for monitoring the galadriel process:
//! - HTTP request metrics for the status endpoint
//! - Run progress gauges (collected dynamically from the run status)
//! - Everything exported by `galadriel_core::metrics`

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

use crate::state::AppState;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "galadriel_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("galadriel_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

// =============================================================================
// Run Metrics (collected dynamically)
// =============================================================================

/// Run loop state (1 = running, 0 = stopped).
pub static RUN_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "galadriel_run_active",
        "Whether the run loop is running (1) or stopped (0)",
    )
    .unwrap()
});

/// Races by current status.
pub static RACES_BY_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("galadriel_races_by_status", "Current race count by status"),
        &["status"],
    )
    .unwrap()
});

/// Worker tasks alive.
pub static WORKERS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("galadriel_workers_active", "Number of live worker tasks").unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();

    // Run
    registry.register(Box::new(RUN_ACTIVE.clone())).unwrap();
    registry.register(Box::new(RACES_BY_STATUS.clone())).unwrap();
    registry.register(Box::new(WORKERS_ACTIVE.clone())).unwrap();

    // Core metrics (admission, workers, persistence)
    for metric in galadriel_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Update run gauges from the latest published run status.
pub fn collect_dynamic_metrics(state: &AppState) {
    let status = state.run_status();
    RUN_ACTIVE.set(if status.running { 1 } else { 0 });
    WORKERS_ACTIVE.set(status.active_workers as i64);
    for (race_status, count) in &status.races {
        RACES_BY_STATUS
            .with_label_values(&[race_status.as_str()])
            .set(*count as i64);
    }
}
