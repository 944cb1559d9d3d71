//! Mock data source for testing.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::race::Race;
use crate::source::{DataSource, PollOutcome, SessionHandle, SourceError};

#[derive(Debug, Default)]
struct MockState {
    schedule: Vec<Race>,
    schedule_error: Option<SourceError>,
    open_errors: HashMap<String, VecDeque<SourceError>>,
    prepare_script: HashMap<String, VecDeque<Result<(), SourceError>>>,
    /// The last entry of a poll script repeats once the rest is consumed.
    poll_script: HashMap<String, VecDeque<Result<PollOutcome, SourceError>>>,
    open_sessions: HashMap<String, String>,
    session_counter: u32,
    opened: u32,
    closed: u32,
    fail_closes: bool,
    prepare_delay: Duration,
    poll_delay: Duration,
    close_delay: Duration,
    active_prepares: usize,
    max_active_prepares: usize,
    prepare_attempts: HashMap<String, u32>,
    poll_counts: HashMap<String, u32>,
}

/// Mock implementation of the DataSource trait.
///
/// Provides controllable behavior for testing:
/// - Scripted schedule, preparation results and odds polls per race
/// - Injected open/close failures and artificial latency
/// - Session accounting for leak assertions
///
/// # Example
///
/// ```rust,ignore
/// let source = MockDataSource::new();
/// source.set_schedule(vec![fixtures::race_in("r1", Duration::minutes(5))]).await;
///
/// // Two empty polls, then results
/// source.script_polls("r1", vec![
///     Ok(PollOutcome::Odds(vec![])),
///     Ok(PollOutcome::ResultsPosted(vec![])),
/// ]).await;
///
/// // ... run the coordinator ...
/// assert_eq!(source.open_sessions().await, 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockDataSource {
    state: Arc<RwLock<MockState>>,
}

impl MockDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the schedule returned by `fetch_day_schedule`.
    pub async fn set_schedule(&self, races: Vec<Race>) {
        self.state.write().await.schedule = races;
    }

    /// Make `fetch_day_schedule` fail.
    pub async fn fail_schedule(&self, error: SourceError) {
        self.state.write().await.schedule_error = Some(error);
    }

    /// Fail the next `errors.len()` session opens for a race.
    pub async fn fail_opens(&self, race_id: &str, errors: Vec<SourceError>) {
        self.state
            .write()
            .await
            .open_errors
            .insert(race_id.to_string(), errors.into());
    }

    /// Results of successive `prepare_session` calls. Unscripted calls succeed.
    pub async fn script_prepare(&self, race_id: &str, results: Vec<Result<(), SourceError>>) {
        self.state
            .write()
            .await
            .prepare_script
            .insert(race_id.to_string(), results.into());
    }

    /// Results of successive polls. The last result repeats forever;
    /// an unscripted race returns empty odds.
    pub async fn script_polls(&self, race_id: &str, results: Vec<Result<PollOutcome, SourceError>>) {
        self.state
            .write()
            .await
            .poll_script
            .insert(race_id.to_string(), results.into());
    }

    pub async fn fail_closes(&self, fail: bool) {
        self.state.write().await.fail_closes = fail;
    }

    /// Latency added to every `prepare_session` call.
    pub async fn set_prepare_delay(&self, delay: Duration) {
        self.state.write().await.prepare_delay = delay;
    }

    /// Latency added to every `poll_odds` call.
    pub async fn set_poll_delay(&self, delay: Duration) {
        self.state.write().await.poll_delay = delay;
    }

    /// Latency added to every `close_session` call.
    pub async fn set_close_delay(&self, delay: Duration) {
        self.state.write().await.close_delay = delay;
    }

    /// Sessions currently open.
    pub async fn open_sessions(&self) -> usize {
        self.state.read().await.open_sessions.len()
    }

    pub async fn opened_count(&self) -> u32 {
        self.state.read().await.opened
    }

    /// Sessions closed successfully.
    pub async fn closed_count(&self) -> u32 {
        self.state.read().await.closed
    }

    /// Highest number of `prepare_session` calls in flight at once.
    pub async fn max_concurrent_prepares(&self) -> usize {
        self.state.read().await.max_active_prepares
    }

    pub async fn prepare_attempts(&self, race_id: &str) -> u32 {
        self.state
            .read()
            .await
            .prepare_attempts
            .get(race_id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn poll_count(&self, race_id: &str) -> u32 {
        self.state
            .read()
            .await
            .poll_counts
            .get(race_id)
            .copied()
            .unwrap_or(0)
    }

    async fn session_race(&self, handle: &SessionHandle) -> Result<String, SourceError> {
        self.state
            .read()
            .await
            .open_sessions
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| SourceError::TransientProvider(format!("unknown session {}", handle.id)))
    }
}

#[async_trait]
impl DataSource for MockDataSource {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch_day_schedule(&self) -> Result<Vec<Race>, SourceError> {
        let state = self.state.read().await;
        match &state.schedule_error {
            Some(e) => Err(e.clone()),
            None => Ok(state.schedule.clone()),
        }
    }

    async fn open_session(&self, race_id: &str) -> Result<SessionHandle, SourceError> {
        let mut state = self.state.write().await;
        if let Some(e) = state
            .open_errors
            .get_mut(race_id)
            .and_then(|errors| errors.pop_front())
        {
            return Err(e);
        }

        state.session_counter += 1;
        state.opened += 1;
        let id = format!("mock-session-{}", state.session_counter);
        state.open_sessions.insert(id.clone(), race_id.to_string());
        Ok(SessionHandle::new(id, race_id))
    }

    async fn prepare_session(&self, handle: &SessionHandle) -> Result<(), SourceError> {
        let race_id = self.session_race(handle).await?;
        let delay = {
            let mut state = self.state.write().await;
            *state.prepare_attempts.entry(race_id.clone()).or_default() += 1;
            state.active_prepares += 1;
            state.max_active_prepares = state.max_active_prepares.max(state.active_prepares);
            state.prepare_delay
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.write().await;
        state.active_prepares = state.active_prepares.saturating_sub(1);
        state
            .prepare_script
            .get_mut(&race_id)
            .and_then(|script| script.pop_front())
            .unwrap_or(Ok(()))
    }

    async fn poll_odds(&self, handle: &SessionHandle) -> Result<PollOutcome, SourceError> {
        let race_id = self.session_race(handle).await?;
        let delay = self.state.read().await.poll_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.write().await;
        *state.poll_counts.entry(race_id.clone()).or_default() += 1;
        match state.poll_script.get_mut(&race_id) {
            Some(script) if script.len() > 1 => script
                .pop_front()
                .unwrap_or(Ok(PollOutcome::Odds(Vec::new()))),
            Some(script) => script
                .front()
                .cloned()
                .unwrap_or(Ok(PollOutcome::Odds(Vec::new()))),
            None => Ok(PollOutcome::Odds(Vec::new())),
        }
    }

    async fn close_session(&self, handle: &SessionHandle) -> Result<(), SourceError> {
        let delay = self.state.read().await.close_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.write().await;
        // A failed close still ends the session on the provider side.
        state.open_sessions.remove(&handle.id);
        if state.fail_closes {
            return Err(SourceError::TransientProvider("close failed".to_string()));
        }
        state.closed += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::race::{MarketType, OddsSnapshot};
    use chrono::Utc;

    #[tokio::test]
    async fn test_poll_script_repeats_last() {
        let source = MockDataSource::new();
        let snapshot = OddsSnapshot::new("r1", MarketType::Win, Utc::now(), serde_json::json!({}));
        source
            .script_polls(
                "r1",
                vec![
                    Ok(PollOutcome::Odds(vec![snapshot.clone()])),
                    Ok(PollOutcome::ResultsPosted(vec![])),
                ],
            )
            .await;

        let handle = source.open_session("r1").await.unwrap();
        assert_eq!(
            source.poll_odds(&handle).await.unwrap(),
            PollOutcome::Odds(vec![snapshot])
        );
        assert_eq!(
            source.poll_odds(&handle).await.unwrap(),
            PollOutcome::ResultsPosted(vec![])
        );
        assert_eq!(
            source.poll_odds(&handle).await.unwrap(),
            PollOutcome::ResultsPosted(vec![])
        );
        assert_eq!(source.poll_count("r1").await, 3);
    }

    #[tokio::test]
    async fn test_open_failures_then_success() {
        let source = MockDataSource::new();
        source
            .fail_opens("r1", vec![SourceError::TransientProvider("busy".into())])
            .await;

        assert!(source.open_session("r1").await.is_err());
        let handle = source.open_session("r1").await.unwrap();
        assert_eq!(source.open_sessions().await, 1);

        source.close_session(&handle).await.unwrap();
        assert_eq!(source.open_sessions().await, 0);
        assert_eq!(source.opened_count().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_session_is_rejected() {
        let source = MockDataSource::new();
        let handle = SessionHandle::new("nope", "r1");
        assert!(source.poll_odds(&handle).await.is_err());
    }
}
