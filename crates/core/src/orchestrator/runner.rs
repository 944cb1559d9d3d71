//! Run coordinator implementation.
//!
//! Drives one operating day:
//! - Startup: fetch and ingest the schedule, record every race
//! - Tick loop: admit due races into the watch and preparation pools
//! - Shutdown: cancel workers, wait out the grace period, record leftovers

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::admission::{AdmissionController, Deferral, SlotKind, WorkerSlot};
use crate::metrics;
use crate::race::{CalendarError, FailureContext, Phase, Race, RaceCalendar, RaceStatus, Transition};
use crate::sink::PersistenceSink;
use crate::source::{DataSource, SourceError};

use super::config::OrchestratorConfig;
use super::preparation::PreparationWorker;
use super::retry::persist_with_retry;
use super::types::{
    Cancellation, RunError, RunStatus, RunSummary, StatusHandle, StopHandle, WorkerEvent,
    WorkerOutcome,
};
use super::watch::WatchWorker;

/// Why the tick loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    DayComplete,
    Stopped,
    Fatal,
}

/// The run coordinator - owns the calendar and dispatches workers.
pub struct RunCoordinator {
    config: OrchestratorConfig,
    source: Arc<dyn DataSource>,
    sink: Arc<dyn PersistenceSink>,
    admission: AdmissionController,

    // Runtime state
    calendar: RaceCalendar,
    workers: HashMap<String, JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    stop_tx: Arc<watch::Sender<bool>>,
    cancel_tx: watch::Sender<bool>,
    status_tx: watch::Sender<RunStatus>,
    fatal: Option<SourceError>,
    run_id: String,
    started_at: DateTime<Utc>,
}

impl RunCoordinator {
    /// Create a new coordinator.
    pub fn new(
        config: OrchestratorConfig,
        source: Arc<dyn DataSource>,
        sink: Arc<dyn PersistenceSink>,
        admission: AdmissionController,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        let (cancel_tx, _) = watch::channel(false);
        let (status_tx, _) = watch::channel(RunStatus::default());

        Self {
            config,
            source,
            sink,
            admission,
            calendar: RaceCalendar::new(),
            workers: HashMap::new(),
            events_tx,
            events_rx,
            stop_tx: Arc::new(stop_tx),
            cancel_tx,
            status_tx,
            fatal: None,
            run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
        }
    }

    /// Handle for requesting a graceful stop from another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(Arc::clone(&self.stop_tx))
    }

    /// Handle for observing the run's progress.
    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle::new(self.status_tx.subscribe())
    }

    /// Run the day to completion or until stopped.
    ///
    /// Fails before any worker starts when the schedule cannot be fetched or
    /// is rejected, and after shutdown when the provider rejected our
    /// credentials mid-run.
    pub async fn run(mut self) -> Result<RunSummary, RunError> {
        self.started_at = Utc::now();
        info!(run_id = %self.run_id, source = self.source.name(), "Starting run");

        let races = self.source.fetch_day_schedule().await.map_err(|e| match e {
            e @ SourceError::Authentication(_) => RunError::Authentication(e),
            e => RunError::ScheduleUnavailable(e),
        })?;
        let count = self.calendar.ingest(races)?;
        info!(races = count, "Schedule ingested");
        self.restore_finished();

        let scheduled: Vec<Race> = self.calendar.non_terminal().cloned().collect();
        for race in &scheduled {
            let sink = &self.sink;
            persist_with_retry(&self.config.persistence, "race", &race.id, || {
                sink.record_race(race)
            })
            .await;
        }

        let exit = self.tick_loop().await;
        info!(reason = ?exit, "Run loop finished, shutting down");

        let summary = self.shutdown(exit).await;
        match self.fatal.take() {
            Some(e @ SourceError::ScheduleUnavailable(_)) => Err(RunError::ScheduleUnavailable(e)),
            Some(e) => Err(RunError::Authentication(e)),
            None => Ok(summary),
        }
    }

    /// Skip races an earlier run against the same sink already finished.
    fn restore_finished(&mut self) {
        let finished = match self.sink.terminal_races() {
            Ok(finished) => finished,
            Err(e) => {
                warn!(error = %e, "Could not read finished races, collecting the whole schedule");
                return;
            }
        };

        let mut restored = 0;
        for (race_id, status) in finished {
            if self.calendar.restore_finished(&race_id, status).is_some() {
                self.admission.retire(&race_id);
                restored += 1;
            }
        }
        if restored > 0 {
            info!(races = restored, "Skipping races finished by an earlier run");
        }
    }

    async fn tick_loop(&mut self) -> LoopExit {
        let mut stop_rx = self.stop_tx.subscribe();

        loop {
            while let Ok(event) = self.events_rx.try_recv() {
                self.handle_event(event).await;
            }

            if self.fatal.is_some() {
                return LoopExit::Fatal;
            }
            if self.calendar.is_day_complete() {
                return LoopExit::DayComplete;
            }
            if *stop_rx.borrow_and_update() {
                return LoopExit::Stopped;
            }

            let now = Utc::now();
            self.expire_stale(now).await;
            if self.calendar.is_day_complete() {
                return LoopExit::DayComplete;
            }

            // Watch first: races closest to post time get capacity first.
            self.dispatch_due(SlotKind::Watch, now).await;
            self.dispatch_due(SlotKind::Preparation, now).await;
            self.publish_status(false);

            let wait = self.next_wake(now);
            debug!(wait_ms = wait.as_millis() as u64, workers = self.workers.len(), "Tick done");

            let event = tokio::select! {
                _ = stop_rx.changed() => None,
                event = self.events_rx.recv() => event,
                _ = tokio::time::sleep(wait) => None,
            };
            if let Some(event) = event {
                self.handle_event(event).await;
            }
        }
    }

    /// Time until the next meaningful event: the next race due for
    /// preparation or the fixed tick, whichever is sooner.
    fn next_wake(&self, now: DateTime<Utc>) -> Duration {
        let tick = self.config.tick_interval();
        match self.calendar.next_preparation_due(self.config.preparation_lead()) {
            Some(due) if due > now => (due - now).to_std().map_or(tick, |until| until.min(tick)),
            _ => tick,
        }
    }

    /// Error races whose results window closed before they were dispatched.
    async fn expire_stale(&mut self, now: DateTime<Utc>) {
        for race in self
            .calendar
            .expire_stale(now, self.config.watch.results_grace())
        {
            self.persist_status(&race).await;
            self.finish_race(&race);
        }
    }

    /// Try to start a worker for every due candidate of `kind`.
    async fn dispatch_due(&mut self, kind: SlotKind, now: DateTime<Utc>) {
        let candidates: Vec<Race> = match kind {
            SlotKind::Watch => self.calendar.due_for_watching().cloned().collect(),
            SlotKind::Preparation => self
                .calendar
                .due_for_preparation(now, self.config.preparation_lead())
                .cloned()
                .collect(),
        };

        for race in candidates {
            match self.admission.admit(kind, &race.id) {
                Ok(slot) => self.start_worker(race, slot).await,
                Err(deferral @ (Deferral::Capacity | Deferral::Memory { .. })) => {
                    debug!(
                        race_id = %race.id,
                        kind = %kind,
                        reason = deferral.reason(),
                        "Admission deferred"
                    );
                    break;
                }
                Err(deferral) => {
                    debug!(
                        race_id = %race.id,
                        kind = %kind,
                        reason = deferral.reason(),
                        "Candidate skipped"
                    );
                }
            }
        }
    }

    async fn start_worker(&mut self, race: Race, slot: WorkerSlot) {
        let kind = slot.kind();
        let transition = match kind {
            SlotKind::Preparation => Transition::StartPreparing,
            SlotKind::Watch => Transition::StartWatching,
        };

        let race = match self.calendar.record_outcome(&race.id, transition) {
            Ok(race) => race,
            Err(e) => {
                drop(slot);
                self.invariant_violation(&race.id, e).await;
                return;
            }
        };
        info!(race_id = %race.id, status = %race.status, post_time = %race.post_time, "Race dispatched");
        self.persist_status(&race).await;

        let cancel = Cancellation::new(self.cancel_tx.subscribe());
        let source = Arc::clone(&self.source);
        let race_id = race.id.clone();
        match kind {
            SlotKind::Preparation => {
                let worker = PreparationWorker::new(
                    race,
                    slot,
                    source,
                    self.config.preparation.clone(),
                    cancel,
                )
                .with_close_timeout(self.config.session_close_timeout());
                self.spawn_worker(race_id, kind, worker.run());
            }
            SlotKind::Watch => {
                let worker = WatchWorker::new(
                    race,
                    slot,
                    source,
                    Arc::clone(&self.sink),
                    self.config.watch.clone(),
                    self.config.persistence.clone(),
                    cancel,
                )
                .with_close_timeout(self.config.session_close_timeout());
                self.spawn_worker(race_id, kind, worker.run());
            }
        }
    }

    fn spawn_worker<F>(&mut self, race_id: String, kind: SlotKind, worker: F)
    where
        F: Future<Output = WorkerOutcome> + Send + 'static,
    {
        let events_tx = self.events_tx.clone();
        let event_race_id = race_id.clone();
        let handle = tokio::spawn(async move {
            let outcome = worker.await;
            // The coordinator may already be gone during an abandoned shutdown.
            let _ = events_tx.send(WorkerEvent {
                race_id: event_race_id,
                kind,
                outcome,
            });
        });
        self.workers.insert(race_id, handle);
    }

    async fn handle_event(&mut self, event: WorkerEvent) {
        self.workers.remove(&event.race_id);

        let transition = match event.outcome {
            WorkerOutcome::Prepared { attempts } => Transition::Prepared { attempts },
            WorkerOutcome::Completed { poll_failures } => Transition::Completed { poll_failures },
            WorkerOutcome::Errored { context, attempts } => Transition::Errored { context, attempts },
            WorkerOutcome::Cancelled => {
                debug!(race_id = %event.race_id, kind = %event.kind, "Worker cancelled");
                return;
            }
            WorkerOutcome::Fatal(e) => {
                error!(
                    race_id = %event.race_id,
                    kind = %event.kind,
                    error = %e,
                    "Fatal provider error, stopping the run"
                );
                self.fatal.get_or_insert(e);
                return;
            }
        };

        match self.calendar.record_outcome(&event.race_id, transition) {
            Ok(race) => {
                self.persist_status(&race).await;
                if race.status.is_terminal() {
                    self.finish_race(&race);
                } else {
                    info!(race_id = %race.id, status = %race.status, "Race advanced");
                }
            }
            Err(e) => self.invariant_violation(&event.race_id, e).await,
        }
    }

    fn finish_race(&self, race: &Race) {
        let phase = race
            .failure
            .as_ref()
            .map_or(Phase::Watch.as_str(), |failure| failure.phase.as_str());
        metrics::RACE_OUTCOMES
            .with_label_values(&[race.status.as_str(), phase])
            .inc();
        self.admission.retire(&race.id);

        match &race.failure {
            Some(failure) => warn!(
                race_id = %race.id,
                phase = %failure.phase,
                error_class = %failure.error_class,
                error = %failure.message,
                "Race errored"
            ),
            None => info!(race_id = %race.id, status = %race.status, "Race finished"),
        }
    }

    /// A rejected transition means dispatch went wrong. The race is marked
    /// Errored and the run continues.
    async fn invariant_violation(&mut self, race_id: &str, e: CalendarError) {
        error!(race_id = %race_id, error = %e, "Invalid race transition");
        self.admission.retire(race_id);

        let context = FailureContext::new(Phase::Scheduling, "invalid_transition", e.to_string());
        if let Some(race) = self.calendar.force_error(race_id, context) {
            self.persist_status(&race).await;
            self.finish_race(&race);
        }
    }

    async fn persist_status(&self, race: &Race) {
        let sink = &self.sink;
        let failure = match race.status {
            RaceStatus::Errored => race.failure.as_ref(),
            _ => None,
        };
        persist_with_retry(&self.config.persistence, "status", &race.id, || {
            sink.update_race_status(&race.id, race.status, failure)
        })
        .await;
    }

    fn publish_status(&self, shutting_down: bool) {
        let races = self
            .calendar
            .status_counts()
            .into_iter()
            .map(|(status, count)| (status.to_string(), count))
            .collect();
        self.status_tx.send_replace(RunStatus {
            run_id: Some(self.run_id.clone()),
            running: true,
            shutting_down,
            started_at: Some(self.started_at),
            races,
            active_workers: self.workers.len(),
            admission: Some(self.admission.status()),
        });
    }

    async fn shutdown(&mut self, exit: LoopExit) -> RunSummary {
        self.cancel_tx.send_replace(true);
        self.publish_status(true);

        if !self.workers.is_empty() {
            info!(
                workers = self.workers.len(),
                grace_ms = self.config.shutdown_grace_ms,
                "Waiting for workers to exit"
            );
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace();
        while !self.workers.is_empty() {
            match tokio::time::timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(event)) => self.handle_event(event).await,
                Ok(None) | Err(_) => break,
            }
        }

        if !self.workers.is_empty() {
            warn!(
                workers = self.workers.len(),
                "Workers still running after the grace period, abandoning them"
            );
            let (race_ids, handles): (Vec<String>, Vec<JoinHandle<()>>) =
                self.workers.drain().unzip();
            for handle in &handles {
                handle.abort();
            }
            // Dropping the aborted task's future releases its slot.
            let joined = futures::future::join_all(handles).await;
            for (race_id, result) in race_ids.iter().zip(joined) {
                if let Err(e) = result {
                    if !e.is_cancelled() {
                        error!(race_id = %race_id, error = %e, "Worker task panicked");
                    }
                }
            }
        }

        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event).await;
        }

        let incomplete: Vec<String> = self
            .calendar
            .non_terminal()
            .map(|race| race.id.clone())
            .collect();
        for race in self.calendar.non_terminal() {
            warn!(
                target: "missing_races",
                race_id = %race.id,
                track = %race.track,
                country = race.country.as_deref().unwrap_or("-"),
                post_time = %race.post_time,
                status = %race.status,
                "Race left incomplete"
            );
        }
        if !incomplete.is_empty() {
            let sink = &self.sink;
            persist_with_retry(&self.config.persistence, "incomplete", "-", || {
                sink.mark_incomplete(&incomplete)
            })
            .await;
        }

        let counts = self.calendar.status_counts();
        let summary = RunSummary {
            run_id: self.run_id.clone(),
            total: self.calendar.len(),
            completed: counts.get(RaceStatus::Completed.as_str()).copied().unwrap_or(0),
            errored: counts.get(RaceStatus::Errored.as_str()).copied().unwrap_or(0),
            incomplete,
            stopped_early: exit != LoopExit::DayComplete,
            started_at: self.started_at,
            finished_at: Utc::now(),
        };

        let mut status = self.status_tx.borrow().clone();
        status.running = false;
        status.shutting_down = false;
        status.active_workers = 0;
        status.races = counts
            .into_iter()
            .map(|(status, count)| (status.to_string(), count))
            .collect();
        self.status_tx.send_replace(status);

        info!(
            run_id = %self.run_id,
            total = summary.total,
            completed = summary.completed,
            errored = summary.errored,
            incomplete = summary.incomplete.len(),
            "Run finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionConfig;
    use crate::testing::{fixtures, FixedMemoryMonitor, MockDataSource, MockSink};
    use chrono::Duration as ChronoDuration;

    fn coordinator(sink: &MockSink) -> RunCoordinator {
        RunCoordinator::new(
            fixtures::fast_config(),
            Arc::new(MockDataSource::new()),
            Arc::new(sink.clone()),
            AdmissionController::new(
                AdmissionConfig::default(),
                Arc::new(FixedMemoryMonitor::new(10.0)),
            ),
        )
    }

    #[tokio::test]
    async fn test_out_of_order_outcome_marks_race_errored() {
        let sink = MockSink::new();
        let mut coordinator = coordinator(&sink);
        coordinator
            .calendar
            .ingest(vec![fixtures::race_in("r1", ChronoDuration::minutes(5))])
            .unwrap();

        // Completed while the race is still Upcoming.
        coordinator
            .handle_event(WorkerEvent {
                race_id: "r1".to_string(),
                kind: SlotKind::Watch,
                outcome: WorkerOutcome::Completed { poll_failures: 0 },
            })
            .await;

        assert!(coordinator.calendar.is_terminal("r1"));
        let failure = sink.failure_for("r1").unwrap();
        assert_eq!(failure.phase, Phase::Scheduling);
        assert_eq!(failure.error_class, "invalid_transition");
        assert!(coordinator.admission.try_admit(SlotKind::Preparation, "r1").is_none());
    }

    #[tokio::test]
    async fn test_cancelled_outcome_leaves_race_untouched() {
        let sink = MockSink::new();
        let mut coordinator = coordinator(&sink);
        coordinator
            .calendar
            .ingest(vec![fixtures::race_in("r1", ChronoDuration::minutes(5))])
            .unwrap();

        coordinator
            .handle_event(WorkerEvent {
                race_id: "r1".to_string(),
                kind: SlotKind::Preparation,
                outcome: WorkerOutcome::Cancelled,
            })
            .await;

        assert_eq!(coordinator.calendar.get("r1").unwrap().status, RaceStatus::Upcoming);
        assert!(sink.status_updates().is_empty());
    }

    #[test]
    fn test_next_wake_prefers_earlier_due_time() {
        let sink = MockSink::new();
        let mut coordinator = coordinator(&sink);
        coordinator.config.tick_interval_ms = 60_000;
        coordinator.config.preparation_lead_secs = 60;
        coordinator
            .calendar
            .ingest(vec![fixtures::race_in("r1", ChronoDuration::seconds(70))])
            .unwrap();

        let wait = coordinator.next_wake(Utc::now());
        assert!(wait <= Duration::from_secs(10));
        assert!(wait > Duration::from_secs(5));
    }

    #[test]
    fn test_next_wake_falls_back_to_tick_when_overdue() {
        let sink = MockSink::new();
        let mut coordinator = coordinator(&sink);
        coordinator.config.tick_interval_ms = 250;
        coordinator
            .calendar
            .ingest(vec![fixtures::race_in("r1", ChronoDuration::minutes(1))])
            .unwrap();

        assert_eq!(coordinator.next_wake(Utc::now()), Duration::from_millis(250));
    }
}
