//! Races, odds snapshots and the day calendar that owns them.

mod calendar;
mod types;

pub use calendar::{CalendarError, RaceCalendar, Transition};
pub use types::{FailureContext, MarketType, OddsSnapshot, Phase, Race, RaceStatus};
