//! Orchestrator configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::retry::RetryPolicy;
use super::session::DEFAULT_CLOSE_TIMEOUT;

/// Configuration for the run coordinator and its workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound on the sleep between scheduling ticks (milliseconds).
    /// The coordinator wakes earlier when a race becomes due or a worker reports.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// How long before post time a race becomes due for preparation (seconds).
    #[serde(default = "default_preparation_lead")]
    pub preparation_lead_secs: u64,

    /// How long workers get to exit after cancellation (milliseconds).
    /// Workers still running afterwards are aborted.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Upper bound on a provider session close (milliseconds). A close that
    /// takes longer is abandoned and logged.
    #[serde(default = "default_session_close_timeout")]
    pub session_close_timeout_ms: u64,

    #[serde(default)]
    pub preparation: RetryConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,
}

fn default_tick_interval() -> u64 {
    15_000 // 15 seconds
}

fn default_preparation_lead() -> u64 {
    1800 // 30 minutes
}

fn default_shutdown_grace() -> u64 {
    30_000 // 30 seconds
}

fn default_session_close_timeout() -> u64 {
    DEFAULT_CLOSE_TIMEOUT.as_millis() as u64
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            preparation_lead_secs: default_preparation_lead(),
            shutdown_grace_ms: default_shutdown_grace(),
            session_close_timeout_ms: default_session_close_timeout(),
            preparation: RetryConfig::default(),
            watch: WatchConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn preparation_lead(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.preparation_lead_secs as i64)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn session_close_timeout(&self) -> Duration {
        Duration::from_millis(self.session_close_timeout_ms)
    }
}

/// Retry configuration for race preparation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt in milliseconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between attempts in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Exponential backoff multiplier.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    5_000 // 5 seconds
}

fn default_max_delay() -> u64 {
    60_000 // 1 minute
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.backoff_multiplier,
        )
    }
}

/// Watch worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Delay between successful polls (milliseconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How long after post time to wait for results before giving up (seconds).
    #[serde(default = "default_results_grace")]
    pub results_grace_secs: u64,

    /// Consecutive failed polls after which the race is errored.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Consecutive failed polls after which the session is closed and reopened.
    /// 0 disables reopening.
    #[serde(default = "default_reopen_after_failures")]
    pub reopen_after_failures: u32,

    /// Delay after the first failed poll (milliseconds).
    #[serde(default = "default_watch_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum delay between failed polls (milliseconds).
    #[serde(default = "default_watch_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_poll_interval() -> u64 {
    10_000 // 10 seconds
}

fn default_results_grace() -> u64 {
    1800 // 30 minutes
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_reopen_after_failures() -> u32 {
    3
}

fn default_watch_initial_backoff() -> u64 {
    1_000
}

fn default_watch_max_backoff() -> u64 {
    30_000
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            results_grace_secs: default_results_grace(),
            max_consecutive_failures: default_max_consecutive_failures(),
            reopen_after_failures: default_reopen_after_failures(),
            initial_backoff_ms: default_watch_initial_backoff(),
            max_backoff_ms: default_watch_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl WatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn results_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.results_grace_secs as i64)
    }

    pub fn backoff(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.backoff_multiplier,
        )
    }
}

/// Bounded retry for sink writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_persistence_delay")]
    pub retry_delay_ms: u64,
}

fn default_persistence_delay() -> u64 {
    200
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_persistence_delay(),
        }
    }
}

impl PersistenceConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
