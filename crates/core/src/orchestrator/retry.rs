//! Backoff policy and bounded retry for sink writes.

use std::time::Duration;

use tracing::warn;

use super::config::PersistenceConfig;
use crate::metrics;
use crate::sink::PersistenceError;

/// Exponential backoff between consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: multiplier.max(1.0),
        }
    }

    /// Delay to wait after the `failures`-th consecutive failure (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Run a sink write, retrying a bounded number of times.
///
/// Returns `false` when every attempt failed and the record was dropped.
/// Dropped records are logged and counted, never escalated.
pub async fn persist_with_retry<F>(
    config: &PersistenceConfig,
    record: &'static str,
    race_id: &str,
    mut write: F,
) -> bool
where
    F: FnMut() -> Result<(), PersistenceError>,
{
    let max_attempts = config.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match write() {
            Ok(()) => return true,
            Err(e) if attempt < max_attempts => {
                warn!(
                    race_id = %race_id,
                    record,
                    attempt,
                    error = %e,
                    "Persistence failed, retrying"
                );
                metrics::RETRY_ATTEMPTS.with_label_values(&["persistence"]).inc();
                tokio::time::sleep(config.retry_delay()).await;
            }
            Err(e) => {
                warn!(
                    race_id = %race_id,
                    record,
                    attempts = max_attempts,
                    error = %e,
                    "Persistence failed, dropping record"
                );
                metrics::PERSISTENCE_DROPS.with_label_values(&[record]).inc();
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(1000), 2.0);
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_multiplier_below_one_is_flat() {
        let policy = RetryPolicy::new(Duration::from_millis(50), Duration::from_secs(1), 0.5);
        assert_eq!(policy.delay_for(3), Duration::from_millis(50));
    }

    fn fast() -> PersistenceConfig {
        PersistenceConfig {
            max_attempts: 3,
            retry_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_persist_succeeds_after_retry() {
        let mut calls = 0;
        let ok = persist_with_retry(&fast(), "status", "r1", || {
            calls += 1;
            if calls < 3 {
                Err(PersistenceError::Database("locked".to_string()))
            } else {
                Ok(())
            }
        })
        .await;
        assert!(ok);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_persist_drops_after_budget() {
        let mut calls = 0;
        let ok = persist_with_retry(&fast(), "snapshot", "r1", || {
            calls += 1;
            Err(PersistenceError::Database("disk full".to_string()))
        })
        .await;
        assert!(!ok);
        assert_eq!(calls, 3);
    }
}
