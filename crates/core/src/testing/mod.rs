//! Testing utilities and mock implementations.
//!
//! This module provides substitutes for every collaborator of the run
//! coordinator, so a whole run can be driven without a real provider,
//! database or host memory readings.
//!
//! # Example
//!
//! ```rust,ignore
//! use galadriel_core::testing::{fixtures, FixedMemoryMonitor, MockDataSource, MockSink};
//!
//! let source = MockDataSource::new();
//! let sink = MockSink::new();
//! let memory = FixedMemoryMonitor::new(40.0);
//!
//! source.set_schedule(vec![fixtures::race_in("r1", chrono::Duration::minutes(5))]).await;
//! memory.set(95.0); // defer all admissions
//! ```

mod mock_data_source;
mod mock_sink;

pub use mock_data_source::MockDataSource;
pub use mock_sink::{MockSink, RecordedStatus};

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::admission::{MemoryError, MemoryMonitor};

/// Memory monitor with a reading set by the test.
#[derive(Debug)]
pub struct FixedMemoryMonitor {
    bits: AtomicU32,
    unavailable: AtomicBool,
}

impl FixedMemoryMonitor {
    pub fn new(percent: f32) -> Self {
        Self {
            bits: AtomicU32::new(percent.to_bits()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set(&self, percent: f32) {
        self.bits.store(percent.to_bits(), Ordering::SeqCst);
    }

    /// Make samples fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl MemoryMonitor for FixedMemoryMonitor {
    fn sample(&self) -> Result<f32, MemoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MemoryError::Unavailable("monitor disabled".to_string()));
        }
        Ok(f32::from_bits(self.bits.load(Ordering::SeqCst)))
    }
}

/// Test fixtures and helper functions.
pub mod fixtures {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use crate::orchestrator::OrchestratorConfig;
    use crate::race::{MarketType, OddsSnapshot, Race};

    /// A race posting `offset` from now.
    pub fn race_in(id: &str, offset: Duration) -> Race {
        Race::scheduled(id, "belmont-park", 1, Utc::now() + offset)
    }

    /// `count` races posting a minute apart, the first one a minute from now.
    pub fn day_schedule(count: u32) -> Vec<Race> {
        (1..=count)
            .map(|n| {
                Race::scheduled(
                    format!("bel-{}", n),
                    "belmont-park",
                    n,
                    Utc::now() + Duration::minutes(n as i64),
                )
                .with_country("USA")
            })
            .collect()
    }

    /// A win-market snapshot captured now.
    pub fn win_snapshot(race_id: &str) -> OddsSnapshot {
        OddsSnapshot::new(
            race_id,
            MarketType::Win,
            Utc::now(),
            json!({ "1": "3/1", "2": "9/2", "3": "6/1" }),
        )
    }

    /// Orchestrator settings with millisecond timings for tests.
    pub fn fast_config() -> OrchestratorConfig {
        let mut config = OrchestratorConfig {
            tick_interval_ms: 20,
            preparation_lead_secs: 3600,
            shutdown_grace_ms: 1000,
            ..OrchestratorConfig::default()
        };
        config.preparation.initial_delay_ms = 5;
        config.preparation.max_delay_ms = 20;
        config.watch.poll_interval_ms = 10;
        config.watch.initial_backoff_ms = 5;
        config.watch.max_backoff_ms = 20;
        config.persistence.retry_delay_ms = 1;
        config
    }
}
