//! Core race data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a race.
///
/// Races only move forward through
/// `Upcoming -> Preparing -> Ready -> Watching -> {Completed, Errored}`,
/// with `Preparing -> Errored` and `Watching -> Errored` as the failure exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaceStatus {
    Upcoming,
    Preparing,
    Ready,
    Watching,
    Completed,
    Errored,
}

impl RaceStatus {
    /// All statuses in lifecycle order.
    pub const ALL: [RaceStatus; 6] = [
        RaceStatus::Upcoming,
        RaceStatus::Preparing,
        RaceStatus::Ready,
        RaceStatus::Watching,
        RaceStatus::Completed,
        RaceStatus::Errored,
    ];

    /// Stable name used in storage, logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            RaceStatus::Upcoming => "upcoming",
            RaceStatus::Preparing => "preparing",
            RaceStatus::Ready => "ready",
            RaceStatus::Watching => "watching",
            RaceStatus::Completed => "completed",
            RaceStatus::Errored => "errored",
        }
    }

    /// Parse a stored status name.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|status| status.as_str() == s)
    }

    /// Completed and Errored are terminal; nothing leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RaceStatus::Completed | RaceStatus::Errored)
    }

    /// Whether `next` is a legal successor of this status.
    pub fn can_transition_to(&self, next: RaceStatus) -> bool {
        matches!(
            (self, next),
            (RaceStatus::Upcoming, RaceStatus::Preparing)
                | (RaceStatus::Preparing, RaceStatus::Ready)
                | (RaceStatus::Preparing, RaceStatus::Errored)
                | (RaceStatus::Ready, RaceStatus::Watching)
                | (RaceStatus::Watching, RaceStatus::Completed)
                | (RaceStatus::Watching, RaceStatus::Errored)
        )
    }
}

impl std::fmt::Display for RaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monitoring phase a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Preparation,
    Watch,
    /// Raised by the coordinator itself (invariant violations).
    Scheduling,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Preparation => "preparation",
            Phase::Watch => "watch",
            Phase::Scheduling => "scheduling",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "preparation" => Some(Phase::Preparation),
            "watch" => Some(Phase::Watch),
            "scheduling" => Some(Phase::Scheduling),
            _ => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic context kept with an errored race.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureContext {
    /// Phase the race was in when it failed.
    pub phase: Phase,
    /// Error class label (e.g. `transient_provider`, `timeout`).
    pub error_class: String,
    /// Last error message.
    pub message: String,
}

impl FailureContext {
    pub fn new(phase: Phase, error_class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            phase,
            error_class: error_class.into(),
            message: message.into(),
        }
    }
}

/// A scheduled race tracked through the preparation/watch lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Race {
    /// Provider-unique race identifier.
    pub id: String,
    /// Track reference as known to the provider.
    pub track: String,
    /// Country code of the track, when the provider reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// Race number within the meet.
    pub race_number: u32,
    /// Scheduled post time.
    pub post_time: DateTime<Utc>,
    /// Current lifecycle status.
    #[serde(default = "default_status")]
    pub status: RaceStatus,
    /// Preparation attempts made so far.
    #[serde(default)]
    pub preparation_attempts: u32,
    /// Failed polls recorded while watching.
    #[serde(default)]
    pub watch_failures: u32,
    /// Context of the failure that errored this race.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureContext>,
}

fn default_status() -> RaceStatus {
    RaceStatus::Upcoming
}

impl Race {
    /// Create a freshly scheduled race in `Upcoming` state.
    pub fn scheduled(
        id: impl Into<String>,
        track: impl Into<String>,
        race_number: u32,
        post_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            track: track.into(),
            country: None,
            race_number,
            post_time,
            status: RaceStatus::Upcoming,
            preparation_attempts: 0,
            watch_failures: 0,
            failure: None,
        }
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }
}

/// Wagering market an odds snapshot belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    Win,
    Place,
    Show,
    Exacta,
    Quinella,
    Trifecta,
    Superfecta,
    Double,
    Pick3,
    Pick4,
    Pick5,
    Pick6,
    Willpays,
    PoolTotals,
    Payouts,
    /// Anything the provider reports that has no dedicated variant.
    Other(String),
}

impl MarketType {
    pub fn as_str(&self) -> &str {
        match self {
            MarketType::Win => "win",
            MarketType::Place => "place",
            MarketType::Show => "show",
            MarketType::Exacta => "exacta",
            MarketType::Quinella => "quinella",
            MarketType::Trifecta => "trifecta",
            MarketType::Superfecta => "superfecta",
            MarketType::Double => "double",
            MarketType::Pick3 => "pick_3",
            MarketType::Pick4 => "pick_4",
            MarketType::Pick5 => "pick_5",
            MarketType::Pick6 => "pick_6",
            MarketType::Willpays => "willpays",
            MarketType::PoolTotals => "pool_totals",
            MarketType::Payouts => "payouts",
            MarketType::Other(name) => name,
        }
    }

    /// Map a stored or provider market name back to a market type.
    pub fn from_name(name: &str) -> Self {
        match name {
            "win" => MarketType::Win,
            "place" => MarketType::Place,
            "show" => MarketType::Show,
            "exacta" => MarketType::Exacta,
            "quinella" => MarketType::Quinella,
            "trifecta" => MarketType::Trifecta,
            "superfecta" => MarketType::Superfecta,
            "double" => MarketType::Double,
            "pick_3" => MarketType::Pick3,
            "pick_4" => MarketType::Pick4,
            "pick_5" => MarketType::Pick5,
            "pick_6" => MarketType::Pick6,
            "willpays" => MarketType::Willpays,
            "pool_totals" => MarketType::PoolTotals,
            "payouts" => MarketType::Payouts,
            other => MarketType::Other(other.to_string()),
        }
    }
}

/// One captured odds table for a race. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsSnapshot {
    pub race_id: String,
    pub market: MarketType,
    pub captured_at: DateTime<Utc>,
    /// Raw provider payload for the market.
    pub payload: serde_json::Value,
}

impl OddsSnapshot {
    pub fn new(
        race_id: impl Into<String>,
        market: MarketType,
        captured_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            race_id: race_id.into(),
            market,
            captured_at,
            payload,
        }
    }
}
