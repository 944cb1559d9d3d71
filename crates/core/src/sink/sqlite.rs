//! SQLite-backed race store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use super::{PersistenceError, PersistenceSink};
use crate::race::{FailureContext, MarketType, OddsSnapshot, Phase, Race, RaceStatus};

/// A race as stored, including run bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct RaceRecord {
    pub id: String,
    pub track: String,
    pub country: Option<String>,
    pub race_number: u32,
    pub post_time: DateTime<Utc>,
    pub status: RaceStatus,
    pub failure: Option<FailureContext>,
    /// Set when the run ended before the race reached a terminal status.
    pub incomplete: bool,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed persistence sink.
pub struct SqliteRaceStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> PersistenceError {
    PersistenceError::Database(e.to_string())
}

fn parse_time(column: &str, value: &str) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            PersistenceError::Serialization(format!("bad {} '{}': {}", column, value, e))
        })
}

const RACE_COLUMNS: &str = "id, track, country, race_number, post_time, status, failure_phase, failure_class, failure_message, incomplete, updated_at";

/// A `races` row before its text columns are decoded.
struct RaceRow {
    id: String,
    track: String,
    country: Option<String>,
    race_number: u32,
    post_time: String,
    status: String,
    failure_phase: Option<String>,
    failure_class: Option<String>,
    failure_message: Option<String>,
    incomplete: bool,
    updated_at: String,
}

impl RaceRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            track: row.get(1)?,
            country: row.get(2)?,
            race_number: row.get(3)?,
            post_time: row.get(4)?,
            status: row.get(5)?,
            failure_phase: row.get(6)?,
            failure_class: row.get(7)?,
            failure_message: row.get(8)?,
            incomplete: row.get::<_, i64>(9)? != 0,
            updated_at: row.get(10)?,
        })
    }

    fn decode(self) -> Result<RaceRecord, PersistenceError> {
        let status = parse_status(&self.status)?;
        let failure = match (self.failure_phase, self.failure_class) {
            (Some(phase), Some(class)) => {
                let phase = Phase::parse(&phase).ok_or_else(|| {
                    PersistenceError::Serialization(format!(
                        "race {} has unknown failure phase '{}'",
                        self.id, phase
                    ))
                })?;
                Some(FailureContext::new(
                    phase,
                    class,
                    self.failure_message.unwrap_or_default(),
                ))
            }
            _ => None,
        };

        Ok(RaceRecord {
            post_time: parse_time("post_time", &self.post_time)?,
            updated_at: parse_time("updated_at", &self.updated_at)?,
            id: self.id,
            track: self.track,
            country: self.country,
            race_number: self.race_number,
            status,
            failure,
            incomplete: self.incomplete,
        })
    }
}

fn parse_status(value: &str) -> Result<RaceStatus, PersistenceError> {
    RaceStatus::parse(value)
        .ok_or_else(|| PersistenceError::Serialization(format!("unknown race status '{}'", value)))
}

impl SqliteRaceStore {
    /// Open (or create) the database file and its tables.
    pub fn new(path: &Path) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), PersistenceError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS races (
                id TEXT PRIMARY KEY,
                track TEXT NOT NULL,
                country TEXT,
                race_number INTEGER NOT NULL,
                post_time TEXT NOT NULL,
                status TEXT NOT NULL,
                failure_phase TEXT,
                failure_class TEXT,
                failure_message TEXT,
                incomplete INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS odds_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                race_id TEXT NOT NULL,
                market TEXT NOT NULL,
                captured_at TEXT NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_races_status ON races(status);
            CREATE INDEX IF NOT EXISTS idx_snapshots_race ON odds_snapshots(race_id, captured_at);
            "#,
        )
        .map_err(db_err)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, PersistenceError> {
        self.conn
            .lock()
            .map_err(|_| PersistenceError::Database("connection mutex poisoned".to_string()))
    }

    /// Fetch a stored race.
    pub fn get_race(&self, race_id: &str) -> Result<Option<RaceRecord>, PersistenceError> {
        let conn = self.conn()?;
        let result = conn.query_row(
            &format!("SELECT {} FROM races WHERE id = ?", RACE_COLUMNS),
            params![race_id],
            RaceRow::from_row,
        );

        match result {
            Ok(row) => row.decode().map(Some),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// All stored races, earliest post time first.
    pub fn list_races(&self) -> Result<Vec<RaceRecord>, PersistenceError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM races ORDER BY post_time ASC, id ASC",
                RACE_COLUMNS
            ))
            .map_err(db_err)?;

        let rows = stmt.query_map([], RaceRow::from_row).map_err(db_err)?;
        let races = rows
            .map(|row| row.map_err(db_err)?.decode())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(races)
    }

    /// Snapshots for a race in the order they were appended.
    pub fn list_snapshots(&self, race_id: &str) -> Result<Vec<OddsSnapshot>, PersistenceError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT race_id, market, captured_at, payload FROM odds_snapshots WHERE race_id = ? ORDER BY id ASC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![race_id], |row| {
                let market: String = row.get(1)?;
                let captured_at: String = row.get(2)?;
                let payload: String = row.get(3)?;
                Ok((row.get::<_, String>(0)?, market, captured_at, payload))
            })
            .map_err(db_err)?;

        let mut snapshots = Vec::new();
        for row in rows {
            let (race_id, market, captured_at, payload) = row.map_err(db_err)?;
            let payload = serde_json::from_str(&payload)
                .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
            snapshots.push(OddsSnapshot::new(
                race_id,
                MarketType::from_name(&market),
                parse_time("captured_at", &captured_at)?,
                payload,
            ));
        }
        Ok(snapshots)
    }
}

impl PersistenceSink for SqliteRaceStore {
    fn record_race(&self, race: &Race) -> Result<(), PersistenceError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO races (id, track, country, race_number, post_time, status, incomplete, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 0, ?)
             ON CONFLICT(id) DO UPDATE SET
                track = excluded.track,
                country = excluded.country,
                race_number = excluded.race_number,
                post_time = excluded.post_time,
                status = excluded.status,
                failure_phase = NULL,
                failure_class = NULL,
                failure_message = NULL,
                incomplete = 0,
                updated_at = excluded.updated_at
             WHERE races.status NOT IN ('completed', 'errored')",
            params![
                race.id,
                race.track,
                race.country,
                race.race_number,
                race.post_time.to_rfc3339(),
                race.status.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn update_race_status(
        &self,
        race_id: &str,
        status: RaceStatus,
        failure: Option<&FailureContext>,
    ) -> Result<(), PersistenceError> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE races SET status = ?, failure_phase = ?, failure_class = ?, failure_message = ?, updated_at = ? WHERE id = ?",
                params![
                    status.as_str(),
                    failure.map(|f| f.phase.as_str()),
                    failure.map(|f| f.error_class.as_str()),
                    failure.map(|f| f.message.as_str()),
                    Utc::now().to_rfc3339(),
                    race_id,
                ],
            )
            .map_err(db_err)?;

        if updated == 0 {
            return Err(PersistenceError::UnknownRace(race_id.to_string()));
        }
        Ok(())
    }

    fn append_odds_snapshot(&self, snapshot: &OddsSnapshot) -> Result<(), PersistenceError> {
        let payload = serde_json::to_string(&snapshot.payload)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO odds_snapshots (race_id, market, captured_at, payload) VALUES (?, ?, ?, ?)",
            params![
                snapshot.race_id,
                snapshot.market.as_str(),
                snapshot.captured_at.to_rfc3339(),
                payload,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn terminal_races(&self) -> Result<Vec<(String, RaceStatus)>, PersistenceError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, status FROM races WHERE status IN ('completed', 'errored') ORDER BY id ASC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(db_err)?;
        let races = rows
            .map(|row| {
                let (id, status) = row.map_err(db_err)?;
                Ok((id, parse_status(&status)?))
            })
            .collect::<Result<Vec<_>, PersistenceError>>()?;
        Ok(races)
    }

    fn mark_incomplete(&self, race_ids: &[String]) -> Result<(), PersistenceError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare("UPDATE races SET incomplete = 1, updated_at = ? WHERE id = ?")
                .map_err(db_err)?;
            let now = Utc::now().to_rfc3339();
            for race_id in race_ids {
                stmt.execute(params![now, race_id]).map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)
    }
}
