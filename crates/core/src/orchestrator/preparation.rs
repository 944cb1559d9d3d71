//! Preparation worker: readies a race's session ahead of post time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::config::RetryConfig;
use super::session::{SessionGuard, DEFAULT_CLOSE_TIMEOUT};
use super::types::{Cancellation, WorkerOutcome};
use crate::admission::WorkerSlot;
use crate::metrics;
use crate::race::{FailureContext, Phase, Race};
use crate::source::{DataSource, SourceError};

/// Prepares one race while holding a preparation slot.
///
/// Each attempt opens a session, prepares it and closes it again. Transient
/// failures are retried with exponential backoff up to `max_attempts`.
pub struct PreparationWorker {
    race: Race,
    slot: WorkerSlot,
    source: Arc<dyn DataSource>,
    retry: RetryConfig,
    close_timeout: Duration,
    cancel: Cancellation,
}

impl PreparationWorker {
    pub fn new(
        race: Race,
        slot: WorkerSlot,
        source: Arc<dyn DataSource>,
        retry: RetryConfig,
        cancel: Cancellation,
    ) -> Self {
        Self {
            race,
            slot,
            source,
            retry,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            cancel,
        }
    }

    /// Bound each session close to `timeout`.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Run to completion. The slot is released when this returns.
    pub async fn run(self) -> WorkerOutcome {
        let Self {
            race,
            slot,
            source,
            retry,
            close_timeout,
            mut cancel,
        } = self;

        let started = Instant::now();
        let outcome = prepare(&race, &source, &retry, close_timeout, &mut cancel).await;
        metrics::PREPARATION_DURATION
            .with_label_values(&[outcome.label()])
            .observe(started.elapsed().as_secs_f64());

        drop(slot);
        outcome
    }
}

async fn attempt(
    source: &Arc<dyn DataSource>,
    race_id: &str,
    close_timeout: Duration,
) -> Result<(), SourceError> {
    let session = SessionGuard::open(Arc::clone(source), race_id, close_timeout).await?;
    let result = source.prepare_session(session.handle()).await;
    session.close().await;
    result
}

async fn prepare(
    race: &Race,
    source: &Arc<dyn DataSource>,
    retry: &RetryConfig,
    close_timeout: Duration,
    cancel: &mut Cancellation,
) -> WorkerOutcome {
    let max_attempts = retry.max_attempts.max(1);
    let backoff = retry.policy();
    let mut last_error = None;

    for attempt_no in 1..=max_attempts {
        if cancel.is_cancelled() {
            return WorkerOutcome::Cancelled;
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(race_id = %race.id, "Preparation cancelled mid-attempt");
                return WorkerOutcome::Cancelled;
            }
            result = attempt(source, &race.id, close_timeout) => result,
        };

        match result {
            Ok(()) => {
                info!(race_id = %race.id, attempts = attempt_no, "Race prepared");
                return WorkerOutcome::Prepared {
                    attempts: attempt_no,
                };
            }
            Err(e) if e.is_fatal() => return WorkerOutcome::Fatal(e),
            Err(e) => {
                warn!(
                    race_id = %race.id,
                    attempt = attempt_no,
                    max_attempts,
                    error = %e,
                    "Preparation attempt failed"
                );
                last_error = Some(e);
                if attempt_no < max_attempts {
                    metrics::RETRY_ATTEMPTS.with_label_values(&["preparation"]).inc();
                    if cancel.sleep(backoff.delay_for(attempt_no)).await {
                        return WorkerOutcome::Cancelled;
                    }
                }
            }
        }
    }

    let (class, message) = match last_error {
        Some(e) => (e.class(), e.to_string()),
        None => ("transient_provider", "preparation failed".to_string()),
    };
    WorkerOutcome::Errored {
        context: FailureContext::new(Phase::Preparation, class, message),
        attempts: max_attempts,
    }
}
