//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Admission (slots granted, deferred, active per kind, memory reading)
//! - Race lifecycle (terminal outcomes, retries)
//! - Watching (snapshots persisted, poll failures, session reopens)
//! - Persistence sink failures

use once_cell::sync::Lazy;
use prometheus::{Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts};

// =============================================================================
// Admission Metrics
// =============================================================================

/// Slots granted by kind.
pub static SLOTS_GRANTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("galadriel_slots_granted_total", "Total worker slots granted"),
        &["kind"], // "preparation", "watch"
    )
    .unwrap()
});

/// Admission deferrals by kind and reason.
pub static SLOTS_DEFERRED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "galadriel_slots_deferred_total",
            "Admission requests deferred to a later tick",
        ),
        &["kind", "reason"], // reason: "capacity", "memory", "duplicate", "retired"
    )
    .unwrap()
});

/// Slots currently held by kind.
pub static ACTIVE_SLOTS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("galadriel_active_slots", "Worker slots currently held"),
        &["kind"],
    )
    .unwrap()
});

/// Last sampled memory utilization.
pub static MEMORY_PERCENT: Lazy<Gauge> = Lazy::new(|| {
    Gauge::new(
        "galadriel_memory_utilization_percent",
        "Memory utilization at the last admission check",
    )
    .unwrap()
});

// =============================================================================
// Race Lifecycle Metrics
// =============================================================================

/// Races reaching a terminal status, by status and phase.
pub static RACE_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("galadriel_race_outcomes_total", "Races reaching a terminal status"),
        &["status", "phase"],
    )
    .unwrap()
});

/// Retry attempts by phase.
pub static RETRY_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("galadriel_retry_attempts_total", "Total retry attempts"),
        &["phase"], // "preparation", "watch", "persistence"
    )
    .unwrap()
});

/// Time spent preparing a race, in seconds.
pub static PREPARATION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "galadriel_preparation_duration_seconds",
            "Duration of race preparation",
        )
        .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        &["result"], // "ready", "errored", "cancelled"
    )
    .unwrap()
});

// =============================================================================
// Watch Metrics
// =============================================================================

/// Odds snapshots appended to the sink.
pub static SNAPSHOTS_PERSISTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "galadriel_snapshots_persisted_total",
        "Total odds snapshots persisted",
    )
    .unwrap()
});

/// Failed odds polls.
pub static POLL_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("galadriel_poll_failures_total", "Total failed odds polls").unwrap()
});

/// Watch sessions reopened after consecutive failures.
pub static SESSION_REOPENS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "galadriel_session_reopens_total",
        "Watch sessions reopened after repeated poll failures",
    )
    .unwrap()
});

// =============================================================================
// Persistence Metrics
// =============================================================================

/// Records dropped after exhausting persistence retries.
pub static PERSISTENCE_DROPS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "galadriel_persistence_drops_total",
            "Records dropped after persistence retries were exhausted",
        ),
        &["record"], // "race", "status", "snapshot"
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Admission
        Box::new(SLOTS_GRANTED.clone()),
        Box::new(SLOTS_DEFERRED.clone()),
        Box::new(ACTIVE_SLOTS.clone()),
        Box::new(MEMORY_PERCENT.clone()),
        // Lifecycle
        Box::new(RACE_OUTCOMES.clone()),
        Box::new(RETRY_ATTEMPTS.clone()),
        Box::new(PREPARATION_DURATION.clone()),
        // Watch
        Box::new(SNAPSHOTS_PERSISTED.clone()),
        Box::new(POLL_FAILURES.clone()),
        Box::new(SESSION_REOPENS.clone()),
        // Persistence
        Box::new(PERSISTENCE_DROPS.clone()),
    ]
}
