//! Watch worker: polls a prepared race's odds until results post.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::config::{PersistenceConfig, WatchConfig};
use super::retry::persist_with_retry;
use super::session::{SessionGuard, DEFAULT_CLOSE_TIMEOUT};
use super::types::{Cancellation, WorkerOutcome};
use crate::admission::WorkerSlot;
use crate::metrics;
use crate::race::{FailureContext, OddsSnapshot, Phase, Race};
use crate::sink::PersistenceSink;
use crate::source::{DataSource, PollOutcome, SourceError};

/// Watches one race while holding a watch slot.
///
/// The session is reused across polls and reopened after
/// `reopen_after_failures` consecutive failures. The race errors when
/// `max_consecutive_failures` polls in a row fail, or when results have not
/// posted by post time plus `results_grace_secs`.
pub struct WatchWorker {
    race: Race,
    slot: WorkerSlot,
    source: Arc<dyn DataSource>,
    sink: Arc<dyn PersistenceSink>,
    config: WatchConfig,
    persistence: PersistenceConfig,
    close_timeout: Duration,
    cancel: Cancellation,
}

/// Mutable progress of a single watch.
struct WatchState {
    session: Option<SessionGuard>,
    consecutive_failures: u32,
    total_failures: u32,
    snapshots: usize,
}

impl WatchState {
    async fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}

enum Step {
    Continue,
    Done(WorkerOutcome),
}

impl WatchWorker {
    pub fn new(
        race: Race,
        slot: WorkerSlot,
        source: Arc<dyn DataSource>,
        sink: Arc<dyn PersistenceSink>,
        config: WatchConfig,
        persistence: PersistenceConfig,
        cancel: Cancellation,
    ) -> Self {
        Self {
            race,
            slot,
            source,
            sink,
            config,
            persistence,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            cancel,
        }
    }

    /// Bound each session close to `timeout`.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    fn deadline(&self) -> DateTime<Utc> {
        self.race.post_time + self.config.results_grace()
    }

    /// Run to completion. The session and slot are released when this returns.
    pub async fn run(mut self) -> WorkerOutcome {
        let mut state = WatchState {
            session: None,
            consecutive_failures: 0,
            total_failures: 0,
            snapshots: 0,
        };

        let outcome = loop {
            match self.step(&mut state).await {
                Step::Continue => continue,
                Step::Done(outcome) => break outcome,
            }
        };

        state.close_session().await;
        debug!(
            race_id = %self.race.id,
            outcome = outcome.label(),
            snapshots = state.snapshots,
            "Watch finished"
        );
        drop(self.slot);
        outcome
    }

    async fn step(&mut self, state: &mut WatchState) -> Step {
        if self.cancel.is_cancelled() {
            return Step::Done(WorkerOutcome::Cancelled);
        }

        let now = Utc::now();
        if now >= self.deadline() {
            warn!(
                race_id = %self.race.id,
                post_time = %self.race.post_time,
                "No results before the watch deadline"
            );
            return Step::Done(WorkerOutcome::Errored {
                context: FailureContext::new(
                    Phase::Watch,
                    "timeout",
                    format!("results not posted by {}", self.deadline().to_rfc3339()),
                ),
                attempts: state.total_failures,
            });
        }

        if state.session.is_none() {
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return Step::Done(WorkerOutcome::Cancelled),
                opened = SessionGuard::open(
                    Arc::clone(&self.source),
                    &self.race.id,
                    self.close_timeout,
                ) => opened,
            };
            match opened {
                Ok(session) => state.session = Some(session),
                Err(e) => return self.on_failure(state, e).await,
            }
        }

        let Some(session) = state.session.as_ref() else {
            return Step::Continue;
        };
        let polled = tokio::select! {
            _ = self.cancel.cancelled() => return Step::Done(WorkerOutcome::Cancelled),
            polled = self.source.poll_odds(session.handle()) => polled,
        };

        match polled {
            Ok(PollOutcome::Odds(snapshots)) => {
                state.consecutive_failures = 0;
                state.snapshots += self.persist(snapshots).await;
                if self.cancel.sleep(self.config.poll_interval()).await {
                    return Step::Done(WorkerOutcome::Cancelled);
                }
                Step::Continue
            }
            Ok(PollOutcome::ResultsPosted(final_snapshots)) => {
                state.snapshots += self.persist(final_snapshots).await;
                info!(
                    race_id = %self.race.id,
                    snapshots = state.snapshots,
                    poll_failures = state.total_failures,
                    "Results posted"
                );
                Step::Done(WorkerOutcome::Completed {
                    poll_failures: state.total_failures,
                })
            }
            Err(e) => self.on_failure(state, e).await,
        }
    }

    async fn on_failure(&mut self, state: &mut WatchState, error: SourceError) -> Step {
        if error.is_fatal() {
            return Step::Done(WorkerOutcome::Fatal(error));
        }

        state.consecutive_failures += 1;
        state.total_failures += 1;
        metrics::POLL_FAILURES.inc();

        if state.consecutive_failures >= self.config.max_consecutive_failures {
            warn!(
                race_id = %self.race.id,
                failures = state.consecutive_failures,
                error = %error,
                "Watch failure budget exhausted"
            );
            return Step::Done(WorkerOutcome::Errored {
                context: FailureContext::new(Phase::Watch, error.class(), error.to_string()),
                attempts: state.consecutive_failures,
            });
        }

        warn!(
            race_id = %self.race.id,
            failures = state.consecutive_failures,
            max_failures = self.config.max_consecutive_failures,
            error = %error,
            "Poll failed, retrying"
        );
        metrics::RETRY_ATTEMPTS.with_label_values(&["watch"]).inc();

        let reopen_every = self.config.reopen_after_failures;
        if reopen_every > 0
            && state.consecutive_failures % reopen_every == 0
            && state.session.is_some()
        {
            info!(race_id = %self.race.id, "Reopening session after repeated failures");
            metrics::SESSION_REOPENS.inc();
            state.close_session().await;
        }

        let delay = self.config.backoff().delay_for(state.consecutive_failures);
        if self.cancel.sleep(delay).await {
            return Step::Done(WorkerOutcome::Cancelled);
        }
        Step::Continue
    }

    /// Forward snapshots to the sink. Returns how many were stored.
    async fn persist(&self, snapshots: Vec<OddsSnapshot>) -> usize {
        let mut stored = 0;
        for snapshot in snapshots {
            let sink = Arc::clone(&self.sink);
            let ok = persist_with_retry(&self.persistence, "snapshot", &self.race.id, || {
                sink.append_odds_snapshot(&snapshot)
            })
            .await;
            if ok {
                stored += 1;
                metrics::SNAPSHOTS_PERSISTED.inc();
            }
        }
        stored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionConfig, AdmissionController, SlotKind};
    use crate::testing::{fixtures, FixedMemoryMonitor, MockDataSource, MockSink};
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;
    use tokio::sync::watch;

    struct Harness {
        source: MockDataSource,
        sink: MockSink,
        admission: AdmissionController,
        cancel_tx: watch::Sender<bool>,
        cancel: Cancellation,
    }

    impl Harness {
        fn new() -> Self {
            let (cancel_tx, rx) = watch::channel(false);
            Self {
                source: MockDataSource::new(),
                sink: MockSink::new(),
                admission: AdmissionController::new(
                    AdmissionConfig::default(),
                    Arc::new(FixedMemoryMonitor::new(10.0)),
                ),
                cancel_tx,
                cancel: Cancellation::new(rx),
            }
        }

        fn worker(&self, race: Race, config: WatchConfig) -> WatchWorker {
            let slot = self.admission.try_admit(SlotKind::Watch, &race.id).unwrap();
            WatchWorker::new(
                race,
                slot,
                Arc::new(self.source.clone()),
                Arc::new(self.sink.clone()),
                config,
                fixtures::fast_config().persistence,
                self.cancel.clone(),
            )
        }
    }

    fn config() -> WatchConfig {
        fixtures::fast_config().watch
    }

    #[tokio::test]
    async fn test_completes_when_results_post() {
        let h = Harness::new();
        h.source
            .script_polls(
                "r1",
                vec![
                    Ok(PollOutcome::Odds(vec![fixtures::win_snapshot("r1")])),
                    Ok(PollOutcome::Odds(vec![fixtures::win_snapshot("r1")])),
                    Ok(PollOutcome::ResultsPosted(vec![fixtures::win_snapshot("r1")])),
                ],
            )
            .await;

        let race = fixtures::race_in("r1", ChronoDuration::minutes(1));
        let outcome = h.worker(race, config()).run().await;

        assert_eq!(outcome, WorkerOutcome::Completed { poll_failures: 0 });
        let snapshots = h.sink.snapshots_for("r1");
        assert_eq!(snapshots.len(), 3);
        assert!(snapshots.windows(2).all(|w| w[0].captured_at <= w[1].captured_at));
        assert_eq!(h.admission.active(SlotKind::Watch), 0);
        assert_eq!(h.source.open_sessions().await, 0);
        assert_eq!(h.source.opened_count().await, 1);
    }

    #[tokio::test]
    async fn test_consecutive_failure_budget() {
        let h = Harness::new();
        h.source
            .script_polls("r1", vec![Err(SourceError::TransientProvider("reset".into()))])
            .await;

        let race = fixtures::race_in("r1", ChronoDuration::minutes(1));
        let outcome = h.worker(race, config()).run().await;

        match outcome {
            WorkerOutcome::Errored { context, attempts } => {
                assert_eq!(attempts, 5);
                assert_eq!(context.phase, Phase::Watch);
                assert_eq!(context.error_class, "transient_provider");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(h.source.poll_count("r1").await, 5);
        // Reopened once, after the third failure.
        assert_eq!(h.source.opened_count().await, 2);
        assert_eq!(h.source.open_sessions().await, 0);
        assert_eq!(h.admission.active(SlotKind::Watch), 0);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let h = Harness::new();
        let transient = || Err(SourceError::TransientProvider("reset".into()));
        h.source
            .script_polls(
                "r1",
                vec![
                    transient(),
                    transient(),
                    Ok(PollOutcome::Odds(vec![])),
                    transient(),
                    transient(),
                    Ok(PollOutcome::ResultsPosted(vec![])),
                ],
            )
            .await;

        let mut watch_config = config();
        watch_config.max_consecutive_failures = 3;
        watch_config.reopen_after_failures = 0;

        let race = fixtures::race_in("r1", ChronoDuration::minutes(1));
        let outcome = h.worker(race, watch_config).run().await;
        assert_eq!(outcome, WorkerOutcome::Completed { poll_failures: 4 });
        assert_eq!(h.source.opened_count().await, 1);
    }

    #[tokio::test]
    async fn test_deadline_elapsed_is_timeout_error() {
        let h = Harness::new();
        let mut watch_config = config();
        watch_config.results_grace_secs = 60;

        // Posted two minutes ago with a one minute grace.
        let race = fixtures::race_in("r1", ChronoDuration::minutes(-2));
        let outcome = h.worker(race, watch_config).run().await;

        match outcome {
            WorkerOutcome::Errored { context, .. } => {
                assert_eq!(context.error_class, "timeout");
                assert_eq!(context.phase, Phase::Watch);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(h.source.poll_count("r1").await, 0);
    }

    #[tokio::test]
    async fn test_cancel_releases_session_without_terminal_outcome() {
        let h = Harness::new();
        let race = fixtures::race_in("r1", ChronoDuration::minutes(5));
        let task = tokio::spawn(h.worker(race, config()).run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.source.open_sessions().await, 1);
        h.cancel_tx.send_replace(true);

        let outcome = task.await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Cancelled);
        assert_eq!(h.source.open_sessions().await, 0);
        assert_eq!(h.admission.active(SlotKind::Watch), 0);
    }

    #[tokio::test]
    async fn test_snapshot_persistence_failure_keeps_watching() {
        let h = Harness::new();
        h.sink.fail_snapshots(true);
        h.source
            .script_polls(
                "r1",
                vec![
                    Ok(PollOutcome::Odds(vec![fixtures::win_snapshot("r1")])),
                    Ok(PollOutcome::ResultsPosted(vec![])),
                ],
            )
            .await;

        let race = fixtures::race_in("r1", ChronoDuration::minutes(1));
        let outcome = h.worker(race, config()).run().await;

        assert_eq!(outcome, WorkerOutcome::Completed { poll_failures: 0 });
        assert_eq!(h.sink.snapshot_count(), 0);
    }

    #[tokio::test]
    async fn test_authentication_failure_is_fatal() {
        let h = Harness::new();
        h.source
            .script_polls("r1", vec![Err(SourceError::Authentication("session revoked".into()))])
            .await;

        let race = fixtures::race_in("r1", ChronoDuration::minutes(1));
        let outcome = h.worker(race, config()).run().await;
        assert!(matches!(outcome, WorkerOutcome::Fatal(_)));
        assert_eq!(h.source.open_sessions().await, 0);
    }
}
