//! Durable storage for race status and odds snapshots.
//!
//! The orchestration core writes through the [`PersistenceSink`] trait.
//! Implementations must accept concurrent calls from many watch workers.

mod sqlite;

pub use sqlite::{RaceRecord, SqliteRaceStore};

use thiserror::Error;

use crate::race::{FailureContext, OddsSnapshot, Race, RaceStatus};

/// Errors from a persistence sink.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(String),

    #[error("race not recorded: {0}")]
    UnknownRace(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Append-mostly store for the day's races and their odds history.
pub trait PersistenceSink: Send + Sync {
    /// Record a race as ingested from the schedule. A race already stored
    /// with a terminal status is left as it is.
    fn record_race(&self, race: &Race) -> Result<(), PersistenceError>;

    /// Record a status change. `failure` is present for Errored races.
    fn update_race_status(
        &self,
        race_id: &str,
        status: RaceStatus,
        failure: Option<&FailureContext>,
    ) -> Result<(), PersistenceError>;

    /// Append one snapshot. Snapshots are never updated or removed.
    fn append_odds_snapshot(&self, snapshot: &OddsSnapshot) -> Result<(), PersistenceError>;

    /// Races already Completed or Errored, with their stored status.
    ///
    /// Lets a restarted run skip races an earlier run finished.
    fn terminal_races(&self) -> Result<Vec<(String, RaceStatus)>, PersistenceError>;

    /// Flag races that were still non-terminal when the run ended.
    fn mark_incomplete(&self, race_ids: &[String]) -> Result<(), PersistenceError>;
}
