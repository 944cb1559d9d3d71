//! Types for the run coordinator.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::admission::{AdmissionStatus, SlotKind};
use crate::race::{CalendarError, FailureContext};
use crate::source::SourceError;

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum RunError {
    /// The day's schedule could not be fetched.
    #[error(transparent)]
    ScheduleUnavailable(SourceError),

    /// The fetched schedule was rejected by the calendar.
    #[error(transparent)]
    Configuration(#[from] CalendarError),

    /// The provider rejected our credentials. The run was shut down.
    #[error(transparent)]
    Authentication(SourceError),
}

/// How a worker finished.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    /// Preparation succeeded after `attempts` tries.
    Prepared { attempts: u32 },
    /// Results posted.
    Completed { poll_failures: u32 },
    /// The phase gave up.
    Errored {
        context: FailureContext,
        attempts: u32,
    },
    /// Cancelled before reaching an outcome. The race stays non-terminal.
    Cancelled,
    /// An error that must end the run.
    Fatal(SourceError),
}

impl WorkerOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            WorkerOutcome::Prepared { .. } => "ready",
            WorkerOutcome::Completed { .. } => "completed",
            WorkerOutcome::Errored { .. } => "errored",
            WorkerOutcome::Cancelled => "cancelled",
            WorkerOutcome::Fatal(_) => "fatal",
        }
    }
}

/// Sent by a worker task when it exits. Its slot is already released.
#[derive(Debug)]
pub(crate) struct WorkerEvent {
    pub race_id: String,
    pub kind: SlotKind,
    pub outcome: WorkerOutcome,
}

/// Cooperative cancellation observed by workers between steps.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested (or the coordinator is gone).
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Sleep for `duration`. Returns `true` if cancelled first.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}

/// Requests a graceful stop of a running coordinator.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub(crate) fn new(tx: Arc<watch::Sender<bool>>) -> Self {
        Self { tx }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Live view of a run, published after every tick and worker event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStatus {
    /// Identifier of the current run, set once it starts.
    pub run_id: Option<String>,
    /// Whether the coordinator loop is running.
    pub running: bool,
    /// Set once shutdown has begun.
    pub shutting_down: bool,
    pub started_at: Option<DateTime<Utc>>,
    /// Number of races per status name.
    pub races: BTreeMap<String, usize>,
    /// Worker tasks currently alive.
    pub active_workers: usize,
    pub admission: Option<AdmissionStatus>,
}

/// Read side of [`RunStatus`] updates.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    rx: watch::Receiver<RunStatus>,
}

impl StatusHandle {
    pub(crate) fn new(rx: watch::Receiver<RunStatus>) -> Self {
        Self { rx }
    }

    pub fn current(&self) -> RunStatus {
        self.rx.borrow().clone()
    }

    /// Wait for the next published status.
    pub async fn changed(&mut self) -> Option<RunStatus> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

/// Result of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub total: usize,
    pub completed: usize,
    pub errored: usize,
    /// Races that were still non-terminal when the run ended.
    pub incomplete: Vec<String>,
    /// Whether the run ended on a stop signal rather than a complete day.
    pub stopped_early: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
