//! Mock persistence sink for testing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::race::{FailureContext, OddsSnapshot, Race, RaceStatus};
use crate::sink::{PersistenceError, PersistenceSink};

/// A recorded status update for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedStatus {
    pub race_id: String,
    pub status: RaceStatus,
    pub failure: Option<FailureContext>,
}

#[derive(Debug, Default)]
struct SinkState {
    races: Vec<Race>,
    statuses: Vec<RecordedStatus>,
    snapshots: Vec<OddsSnapshot>,
    incomplete: Vec<String>,
    /// Number of upcoming writes (of any kind) that fail.
    failures_remaining: u32,
    /// Fail every snapshot append.
    fail_snapshots: bool,
}

/// Mock implementation of the PersistenceSink trait.
///
/// Records every call in order and can inject failures.
#[derive(Debug, Clone, Default)]
pub struct MockSink {
    state: Arc<Mutex<SinkState>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next `count` writes.
    pub fn fail_next(&self, count: u32) {
        self.lock().failures_remaining = count;
    }

    /// Fail every snapshot append until reset.
    pub fn fail_snapshots(&self, fail: bool) {
        self.lock().fail_snapshots = fail;
    }

    pub fn recorded_races(&self) -> Vec<Race> {
        self.lock().races.clone()
    }

    pub fn status_updates(&self) -> Vec<RecordedStatus> {
        self.lock().statuses.clone()
    }

    /// Statuses recorded for one race, in order.
    pub fn statuses_for(&self, race_id: &str) -> Vec<RaceStatus> {
        self.lock()
            .statuses
            .iter()
            .filter(|s| s.race_id == race_id)
            .map(|s| s.status)
            .collect()
    }

    /// Failure context recorded with the race's last Errored status.
    pub fn failure_for(&self, race_id: &str) -> Option<FailureContext> {
        self.lock()
            .statuses
            .iter()
            .rev()
            .find(|s| s.race_id == race_id && s.status == RaceStatus::Errored)
            .and_then(|s| s.failure.clone())
    }

    pub fn snapshots_for(&self, race_id: &str) -> Vec<OddsSnapshot> {
        self.lock()
            .snapshots
            .iter()
            .filter(|s| s.race_id == race_id)
            .cloned()
            .collect()
    }

    pub fn snapshot_count(&self) -> usize {
        self.lock().snapshots.len()
    }

    pub fn incomplete(&self) -> Vec<String> {
        self.lock().incomplete.clone()
    }

    fn injected_failure(state: &mut SinkState) -> Result<(), PersistenceError> {
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(PersistenceError::Database("injected failure".to_string()));
        }
        Ok(())
    }
}

impl PersistenceSink for MockSink {
    fn record_race(&self, race: &Race) -> Result<(), PersistenceError> {
        let mut state = self.lock();
        Self::injected_failure(&mut state)?;
        state.races.push(race.clone());
        Ok(())
    }

    fn update_race_status(
        &self,
        race_id: &str,
        status: RaceStatus,
        failure: Option<&FailureContext>,
    ) -> Result<(), PersistenceError> {
        let mut state = self.lock();
        Self::injected_failure(&mut state)?;
        state.statuses.push(RecordedStatus {
            race_id: race_id.to_string(),
            status,
            failure: failure.cloned(),
        });
        Ok(())
    }

    fn append_odds_snapshot(&self, snapshot: &OddsSnapshot) -> Result<(), PersistenceError> {
        let mut state = self.lock();
        if state.fail_snapshots {
            return Err(PersistenceError::Database("snapshots disabled".to_string()));
        }
        Self::injected_failure(&mut state)?;
        state.snapshots.push(snapshot.clone());
        Ok(())
    }

    fn terminal_races(&self) -> Result<Vec<(String, RaceStatus)>, PersistenceError> {
        let state = self.lock();
        let mut latest = BTreeMap::new();
        for update in &state.statuses {
            latest.insert(update.race_id.clone(), update.status);
        }
        Ok(latest
            .into_iter()
            .filter(|(_, status)| status.is_terminal())
            .collect())
    }

    fn mark_incomplete(&self, race_ids: &[String]) -> Result<(), PersistenceError> {
        let mut state = self.lock();
        Self::injected_failure(&mut state)?;
        state.incomplete.extend(race_ids.iter().cloned());
        Ok(())
    }
}
