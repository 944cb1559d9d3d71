//! The race calendar: canonical owner of every race for the operating day.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use super::types::{FailureContext, Phase, Race, RaceStatus};

/// Errors raised by the calendar.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CalendarError {
    /// The schedule handed to `ingest` cannot be used.
    #[error("invalid schedule: {0}")]
    Configuration(String),

    /// No race with this id was ever ingested.
    #[error("race not found: {0}")]
    RaceNotFound(String),

    /// The requested transition is not legal from the race's current status.
    #[error("invalid transition for race {race_id}: {from} -> {to}")]
    InvalidTransition {
        race_id: String,
        from: RaceStatus,
        to: RaceStatus,
    },
}

/// A status change reported for a race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// A preparation slot was granted.
    StartPreparing,
    /// Preparation finished after `attempts` tries.
    Prepared { attempts: u32 },
    /// A watch slot was granted.
    StartWatching,
    /// Results posted.
    Completed { poll_failures: u32 },
    /// The phase gave up. `attempts` is the attempt or failure count for that phase.
    Errored {
        context: FailureContext,
        attempts: u32,
    },
}

impl Transition {
    /// Status the race lands in.
    pub fn target(&self) -> RaceStatus {
        match self {
            Transition::StartPreparing => RaceStatus::Preparing,
            Transition::Prepared { .. } => RaceStatus::Ready,
            Transition::StartWatching => RaceStatus::Watching,
            Transition::Completed { .. } => RaceStatus::Completed,
            Transition::Errored { .. } => RaceStatus::Errored,
        }
    }
}

/// Holds all races for the day ordered by post time.
///
/// Non-terminal races live in the active set, sorted by `(post_time, id)`.
/// Once a race reaches Completed or Errored it moves to the finished map and
/// never comes back.
#[derive(Debug, Default)]
pub struct RaceCalendar {
    active: Vec<Race>,
    finished: HashMap<String, Race>,
    ingested: bool,
}

impl RaceCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the day's schedule. Can only be called once.
    pub fn ingest(&mut self, races: Vec<Race>) -> Result<usize, CalendarError> {
        if self.ingested {
            return Err(CalendarError::Configuration(
                "schedule already ingested".to_string(),
            ));
        }
        if races.is_empty() {
            return Err(CalendarError::Configuration(
                "schedule contains no races".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(races.len());
        for race in &races {
            if race.id.trim().is_empty() {
                return Err(CalendarError::Configuration(format!(
                    "race #{} at '{}' has an empty id",
                    race.race_number, race.track
                )));
            }
            if race.track.trim().is_empty() {
                return Err(CalendarError::Configuration(format!(
                    "race {} has no track reference",
                    race.id
                )));
            }
            if race.status != RaceStatus::Upcoming {
                return Err(CalendarError::Configuration(format!(
                    "race {} ingested with status {}",
                    race.id, race.status
                )));
            }
            if !seen.insert(race.id.as_str()) {
                return Err(CalendarError::Configuration(format!(
                    "duplicate race id {}",
                    race.id
                )));
            }
        }

        let mut races = races;
        races.sort_by(|a, b| a.post_time.cmp(&b.post_time).then_with(|| a.id.cmp(&b.id)));
        let count = races.len();
        self.active = races;
        self.ingested = true;
        Ok(count)
    }

    /// Upcoming races whose post time is within `lead` of `now`, earliest first.
    ///
    /// The iterator is lazy and can be requested again on every tick.
    pub fn due_for_preparation(
        &self,
        now: DateTime<Utc>,
        lead: Duration,
    ) -> impl Iterator<Item = &Race> + '_ {
        self.active
            .iter()
            .take_while(move |race| race.post_time - now <= lead)
            .filter(|race| race.status == RaceStatus::Upcoming)
    }

    /// Ready races, earliest post time first.
    pub fn due_for_watching(&self) -> impl Iterator<Item = &Race> + '_ {
        self.active
            .iter()
            .filter(|race| race.status == RaceStatus::Ready)
    }

    /// Instant at which the next Upcoming race becomes due for preparation.
    pub fn next_preparation_due(&self, lead: Duration) -> Option<DateTime<Utc>> {
        self.active
            .iter()
            .find(|race| race.status == RaceStatus::Upcoming)
            .map(|race| race.post_time - lead)
    }

    /// Apply a validated transition and return the updated race.
    pub fn record_outcome(
        &mut self,
        race_id: &str,
        transition: Transition,
    ) -> Result<Race, CalendarError> {
        let target = transition.target();

        let Some(idx) = self.active.iter().position(|race| race.id == race_id) else {
            return match self.finished.get(race_id) {
                Some(race) => Err(CalendarError::InvalidTransition {
                    race_id: race_id.to_string(),
                    from: race.status,
                    to: target,
                }),
                None => Err(CalendarError::RaceNotFound(race_id.to_string())),
            };
        };

        let race = &mut self.active[idx];
        if !race.status.can_transition_to(target) {
            return Err(CalendarError::InvalidTransition {
                race_id: race_id.to_string(),
                from: race.status,
                to: target,
            });
        }

        match transition {
            Transition::StartPreparing | Transition::StartWatching => {}
            Transition::Prepared { attempts } => race.preparation_attempts = attempts,
            Transition::Completed { poll_failures } => race.watch_failures = poll_failures,
            Transition::Errored { context, attempts } => {
                match context.phase {
                    Phase::Preparation => race.preparation_attempts = attempts,
                    Phase::Watch => race.watch_failures = attempts,
                    Phase::Scheduling => {}
                }
                race.failure = Some(context);
            }
        }
        race.status = target;

        if target.is_terminal() {
            let race = self.active.remove(idx);
            self.finished.insert(race.id.clone(), race.clone());
            Ok(race)
        } else {
            Ok(race.clone())
        }
    }

    /// Mark a non-terminal race Errored regardless of its current status.
    ///
    /// Used after an invariant violation. Returns `None` when the race is
    /// unknown or already terminal.
    pub fn force_error(&mut self, race_id: &str, context: FailureContext) -> Option<Race> {
        let idx = self.active.iter().position(|race| race.id == race_id)?;
        let mut race = self.active.remove(idx);
        race.status = RaceStatus::Errored;
        race.failure = Some(context);
        self.finished.insert(race.id.clone(), race.clone());
        Some(race)
    }

    /// Carry over a terminal status recorded by an earlier run.
    ///
    /// Only an Upcoming race can be restored. Returns `None` when the race is
    /// unknown, already past Upcoming, or `status` is not terminal.
    pub fn restore_finished(&mut self, race_id: &str, status: RaceStatus) -> Option<Race> {
        if !status.is_terminal() {
            return None;
        }
        let idx = self
            .active
            .iter()
            .position(|race| race.id == race_id && race.status == RaceStatus::Upcoming)?;
        let mut race = self.active.remove(idx);
        race.status = status;
        self.finished.insert(race.id.clone(), race.clone());
        Some(race)
    }

    /// Error every Upcoming race whose collection window closed before it
    /// was ever dispatched.
    ///
    /// A race is stale once `now` is past `post_time + results_grace`; no
    /// session will be opened for it.
    pub fn expire_stale(&mut self, now: DateTime<Utc>, results_grace: Duration) -> Vec<Race> {
        let (stale, active): (Vec<Race>, Vec<Race>) = std::mem::take(&mut self.active)
            .into_iter()
            .partition(|race| {
                race.status == RaceStatus::Upcoming && race.post_time + results_grace < now
            });
        self.active = active;

        stale
            .into_iter()
            .map(|mut race| {
                race.status = RaceStatus::Errored;
                race.failure = Some(FailureContext::new(
                    Phase::Preparation,
                    "timeout",
                    format!(
                        "collection window closed at {} before preparation started",
                        (race.post_time + results_grace).to_rfc3339()
                    ),
                ));
                self.finished.insert(race.id.clone(), race.clone());
                race
            })
            .collect()
    }

    /// True iff every race is Completed or Errored.
    pub fn is_day_complete(&self) -> bool {
        self.active.is_empty()
    }

    pub fn get(&self, race_id: &str) -> Option<&Race> {
        self.active
            .iter()
            .find(|race| race.id == race_id)
            .or_else(|| self.finished.get(race_id))
    }

    pub fn is_terminal(&self, race_id: &str) -> bool {
        self.finished.contains_key(race_id)
    }

    /// Races that have not reached a terminal status, earliest first.
    pub fn non_terminal(&self) -> impl Iterator<Item = &Race> + '_ {
        self.active.iter()
    }

    /// Number of races per status name.
    pub fn status_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts: BTreeMap<&'static str, usize> =
            RaceStatus::ALL.iter().map(|s| (s.as_str(), 0)).collect();
        for race in self.active.iter().chain(self.finished.values()) {
            *counts.entry(race.status.as_str()).or_default() += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.active.len() + self.finished.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 16, 0, 0).unwrap()
    }

    fn race(id: &str, minutes_after_base: i64) -> Race {
        Race::scheduled(id, "belmont", 1, base() + Duration::minutes(minutes_after_base))
    }

    fn calendar(races: Vec<Race>) -> RaceCalendar {
        let mut calendar = RaceCalendar::new();
        calendar.ingest(races).unwrap();
        calendar
    }

    fn ids<'a>(races: impl Iterator<Item = &'a Race>) -> Vec<String> {
        races.map(|r| r.id.clone()).collect()
    }

    fn failure(phase: Phase) -> FailureContext {
        FailureContext::new(phase, "transient_provider", "connection reset")
    }

    #[test]
    fn test_ingest_rejects_empty_schedule() {
        let mut calendar = RaceCalendar::new();
        let err = calendar.ingest(vec![]).unwrap_err();
        assert!(matches!(err, CalendarError::Configuration(_)));
    }

    #[test]
    fn test_ingest_rejects_duplicates_and_blank_ids() {
        let mut calendar = RaceCalendar::new();
        let err = calendar
            .ingest(vec![race("r1", 10), race("r1", 20)])
            .unwrap_err();
        assert_eq!(
            err,
            CalendarError::Configuration("duplicate race id r1".to_string())
        );

        let mut calendar = RaceCalendar::new();
        assert!(calendar.ingest(vec![race(" ", 10)]).is_err());
    }

    #[test]
    fn test_ingest_only_once() {
        let mut calendar = calendar(vec![race("r1", 10)]);
        assert!(calendar.ingest(vec![race("r2", 10)]).is_err());
        assert_eq!(calendar.len(), 1);
    }

    #[test]
    fn test_preparation_window_boundary() {
        // Post at T+30m with a 10 minute lead: due from T+20m, never earlier.
        let calendar = calendar(vec![race("r1", 30)]);
        let lead = Duration::minutes(10);

        let early = base() + Duration::minutes(19) + Duration::seconds(59);
        assert_eq!(calendar.due_for_preparation(early, lead).count(), 0);

        let on_time = base() + Duration::minutes(20);
        assert_eq!(ids(calendar.due_for_preparation(on_time, lead)), vec!["r1"]);

        let late = base() + Duration::minutes(45);
        assert_eq!(ids(calendar.due_for_preparation(late, lead)), vec!["r1"]);
    }

    #[test]
    fn test_due_order_is_post_time_then_id() {
        let calendar = calendar(vec![race("c", 5), race("b", 1), race("a", 5)]);
        let due = ids(calendar.due_for_preparation(base() + Duration::minutes(5), Duration::zero()));
        assert_eq!(due, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_due_listing_is_restartable() {
        let calendar = calendar(vec![race("a", 1), race("b", 2)]);
        let now = base() + Duration::minutes(3);
        let first = ids(calendar.due_for_preparation(now, Duration::zero()));
        let second = ids(calendar.due_for_preparation(now, Duration::zero()));
        assert_eq!(first, second);
    }

    #[test]
    fn test_full_lifecycle_to_completed() {
        let mut calendar = calendar(vec![race("r1", 10), race("r2", 20)]);

        calendar.record_outcome("r1", Transition::StartPreparing).unwrap();
        assert_eq!(
            calendar.due_for_preparation(base() + Duration::hours(1), Duration::zero()).count(),
            1
        );

        let r = calendar
            .record_outcome("r1", Transition::Prepared { attempts: 2 })
            .unwrap();
        assert_eq!(r.status, RaceStatus::Ready);
        assert_eq!(r.preparation_attempts, 2);
        assert_eq!(ids(calendar.due_for_watching()), vec!["r1"]);

        calendar.record_outcome("r1", Transition::StartWatching).unwrap();
        assert_eq!(calendar.due_for_watching().count(), 0);

        let r = calendar
            .record_outcome("r1", Transition::Completed { poll_failures: 1 })
            .unwrap();
        assert_eq!(r.status, RaceStatus::Completed);
        assert_eq!(r.watch_failures, 1);
        assert!(calendar.is_terminal("r1"));
        assert!(!calendar.is_day_complete());
        assert_eq!(calendar.get("r1").unwrap().status, RaceStatus::Completed);
    }

    #[test]
    fn test_cannot_skip_preparation() {
        let mut calendar = calendar(vec![race("r1", 10)]);
        let err = calendar
            .record_outcome("r1", Transition::StartWatching)
            .unwrap_err();
        assert_eq!(
            err,
            CalendarError::InvalidTransition {
                race_id: "r1".to_string(),
                from: RaceStatus::Upcoming,
                to: RaceStatus::Watching,
            }
        );
    }

    #[test]
    fn test_terminal_is_monotonic() {
        let mut calendar = calendar(vec![race("r1", 10)]);
        calendar.record_outcome("r1", Transition::StartPreparing).unwrap();
        calendar
            .record_outcome(
                "r1",
                Transition::Errored {
                    context: failure(Phase::Preparation),
                    attempts: 3,
                },
            )
            .unwrap();

        for transition in [
            Transition::StartPreparing,
            Transition::Prepared { attempts: 1 },
            Transition::StartWatching,
        ] {
            assert!(matches!(
                calendar.record_outcome("r1", transition),
                Err(CalendarError::InvalidTransition { from: RaceStatus::Errored, .. })
            ));
        }

        assert!(calendar.is_day_complete());
        assert_eq!(calendar.get("r1").unwrap().preparation_attempts, 3);
    }

    #[test]
    fn test_unknown_race() {
        let mut calendar = calendar(vec![race("r1", 10)]);
        assert_eq!(
            calendar.record_outcome("nope", Transition::StartPreparing),
            Err(CalendarError::RaceNotFound("nope".to_string()))
        );
    }

    #[test]
    fn test_force_error_marks_non_terminal_race() {
        let mut calendar = calendar(vec![race("r1", 10), race("r2", 20)]);
        calendar.record_outcome("r1", Transition::StartPreparing).unwrap();

        let forced = calendar
            .force_error("r1", failure(Phase::Scheduling))
            .unwrap();
        assert_eq!(forced.status, RaceStatus::Errored);
        assert!(calendar.force_error("r1", failure(Phase::Scheduling)).is_none());
        assert_eq!(ids(calendar.non_terminal()), vec!["r2"]);
    }

    #[test]
    fn test_next_preparation_due_and_counts() {
        let mut calendar = calendar(vec![race("r1", 10), race("r2", 40)]);
        let lead = Duration::minutes(15);
        assert_eq!(
            calendar.next_preparation_due(lead),
            Some(base() - Duration::minutes(5))
        );

        calendar.record_outcome("r1", Transition::StartPreparing).unwrap();
        assert_eq!(
            calendar.next_preparation_due(lead),
            Some(base() + Duration::minutes(25))
        );

        let counts = calendar.status_counts();
        assert_eq!(counts["preparing"], 1);
        assert_eq!(counts["upcoming"], 1);
        assert_eq!(counts["completed"], 0);
    }

    #[test]
    fn test_restore_finished_only_from_upcoming() {
        let mut calendar = calendar(vec![race("r1", 10), race("r2", 20), race("r3", 30)]);
        calendar.record_outcome("r2", Transition::StartPreparing).unwrap();

        let restored = calendar
            .restore_finished("r1", RaceStatus::Completed)
            .unwrap();
        assert_eq!(restored.status, RaceStatus::Completed);
        assert!(calendar.is_terminal("r1"));

        assert!(calendar.restore_finished("r2", RaceStatus::Errored).is_none());
        assert!(calendar.restore_finished("r3", RaceStatus::Ready).is_none());
        assert!(calendar.restore_finished("ghost", RaceStatus::Errored).is_none());
        assert_eq!(ids(calendar.non_terminal()), vec!["r2", "r3"]);

        // Restored races never come back.
        assert!(matches!(
            calendar.record_outcome("r1", Transition::StartPreparing),
            Err(CalendarError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_expire_stale_errors_undispatched_races_only() {
        let mut calendar = calendar(vec![race("old", 0), race("started", 5), race("later", 60)]);
        calendar.record_outcome("started", Transition::StartPreparing).unwrap();

        let now = base() + Duration::minutes(40);
        let expired = calendar.expire_stale(now, Duration::minutes(30));

        assert_eq!(ids(expired.iter()), vec!["old"]);
        let failure = expired[0].failure.as_ref().unwrap();
        assert_eq!(failure.phase, Phase::Preparation);
        assert_eq!(failure.error_class, "timeout");
        assert_eq!(calendar.get("old").unwrap().status, RaceStatus::Errored);
        assert_eq!(ids(calendar.non_terminal()), vec!["started", "later"]);

        // Exactly at the window's end is still collectable.
        assert!(calendar
            .expire_stale(base() + Duration::minutes(90), Duration::minutes(30))
            .is_empty());
    }
}
