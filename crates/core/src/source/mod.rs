//! Data provider abstraction.
//!
//! The orchestration core talks to the odds provider only through the
//! [`DataSource`] trait: fetch the day's schedule, open a scoped session per
//! race, prepare it, poll it for odds, and close it.

mod http;

pub use http::HttpDataSource;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::race::{OddsSnapshot, Race};

/// Errors raised by a data source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// Network, timeout or provider-side failure. Retried locally.
    #[error("transient provider error: {0}")]
    TransientProvider(String),

    /// The provider rejected our credentials. Fatal to the whole run.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The day's schedule could not be fetched. Fatal at startup.
    #[error("schedule unavailable: {0}")]
    ScheduleUnavailable(String),
}

impl SourceError {
    /// Stable class label persisted with errored races.
    pub fn class(&self) -> &'static str {
        match self {
            SourceError::TransientProvider(_) => "transient_provider",
            SourceError::Authentication(_) => "authentication",
            SourceError::ScheduleUnavailable(_) => "schedule_unavailable",
        }
    }

    /// Whether the error ends the run rather than a single race.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SourceError::TransientProvider(_))
    }
}

/// A provider session scoped to one race.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub id: String,
    pub race_id: String,
    pub opened_at: DateTime<Utc>,
}

impl SessionHandle {
    pub fn new(id: impl Into<String>, race_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            race_id: race_id.into(),
            opened_at: Utc::now(),
        }
    }
}

/// Result of a single odds poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Current odds, possibly empty.
    Odds(Vec<OddsSnapshot>),
    /// Results have posted. Carries the final odds tables, if any.
    ResultsPosted(Vec<OddsSnapshot>),
}

/// Capability interface of the odds provider.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// The day's races, all in `Upcoming` status.
    async fn fetch_day_schedule(&self) -> Result<Vec<Race>, SourceError>;

    async fn open_session(&self, race_id: &str) -> Result<SessionHandle, SourceError>;

    /// Ready an open session for close monitoring (race card, runners).
    async fn prepare_session(&self, handle: &SessionHandle) -> Result<(), SourceError>;

    async fn poll_odds(&self, handle: &SessionHandle) -> Result<PollOutcome, SourceError>;

    /// Best effort. Callers log failures and move on.
    async fn close_session(&self, handle: &SessionHandle) -> Result<(), SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            SourceError::TransientProvider("reset".into()).class(),
            "transient_provider"
        );
        assert_eq!(SourceError::Authentication("401".into()).class(), "authentication");
        assert!(!SourceError::TransientProvider("x".into()).is_fatal());
        assert!(SourceError::Authentication("x".into()).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = SourceError::ScheduleUnavailable("HTTP 503".to_string());
        assert_eq!(err.to_string(), "schedule unavailable: HTTP 503");
    }
}
