//! JSON-over-HTTP data provider.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::credentials::Credentials;
use crate::race::{MarketType, OddsSnapshot, Race};

use super::{DataSource, PollOutcome, SessionHandle, SourceError};

#[derive(Debug, Deserialize)]
struct ScheduleEntry {
    id: String,
    track: String,
    #[serde(default)]
    country: Option<String>,
    race_number: u32,
    post_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct OpenSessionResponse {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct MarketEntry {
    market: String,
    #[serde(default)]
    captured_at: Option<DateTime<Utc>>,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OddsResponse {
    #[serde(default)]
    results_posted: bool,
    #[serde(default)]
    markets: Vec<MarketEntry>,
}

impl OddsResponse {
    fn into_outcome(self, race_id: &str) -> PollOutcome {
        let now = Utc::now();
        let snapshots = self
            .markets
            .into_iter()
            .map(|m| {
                OddsSnapshot::new(
                    race_id,
                    MarketType::from_name(&m.market),
                    m.captured_at.unwrap_or(now),
                    m.data,
                )
            })
            .collect();

        if self.results_posted {
            PollOutcome::ResultsPosted(snapshots)
        } else {
            PollOutcome::Odds(snapshots)
        }
    }
}

fn transport_error(e: reqwest::Error) -> SourceError {
    if e.is_timeout() {
        SourceError::TransientProvider("request timed out".to_string())
    } else if e.is_connect() {
        SourceError::TransientProvider(format!("connection failed: {}", e))
    } else {
        SourceError::TransientProvider(e.to_string())
    }
}

/// Map a non-success HTTP status to the error taxonomy.
fn status_error(status: StatusCode, body: &str) -> SourceError {
    let snippet: String = body.chars().take(100).collect();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SourceError::Authentication(format!("HTTP {}", status))
        }
        _ => SourceError::TransientProvider(format!("HTTP {}: {}", status, snippet)),
    }
}

/// Data source backed by the provider's JSON API.
pub struct HttpDataSource {
    client: Client,
    config: ProviderConfig,
    credentials: Option<Credentials>,
}

impl HttpDataSource {
    pub fn new(config: ProviderConfig, credentials: Option<Credentials>) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs as u64))
            .build()
            .map_err(|e| SourceError::TransientProvider(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            credentials,
        })
    }

    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    fn request(&self, method: Method, endpoint: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url(), endpoint);
        let builder = self.client.request(method, url);
        match &self.credentials {
            Some(creds) => builder.basic_auth(&creds.identity, Some(creds.secret.expose_secret())),
            None => builder,
        }
    }

    async fn send(&self, method: Method, endpoint: &str) -> Result<Response, SourceError> {
        let response = self
            .request(method, endpoint)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        Ok(response)
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
    ) -> Result<T, SourceError> {
        let response = self.send(method, endpoint).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| SourceError::TransientProvider(format!("invalid response body: {}", e)))
    }
}

#[async_trait]
impl DataSource for HttpDataSource {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch_day_schedule(&self) -> Result<Vec<Race>, SourceError> {
        let entries: Vec<ScheduleEntry> = self
            .send_json(Method::GET, "/schedule")
            .await
            .map_err(|e| match e {
                SourceError::Authentication(_) => e,
                other => SourceError::ScheduleUnavailable(other.to_string()),
            })?;

        debug!(count = entries.len(), "Fetched day schedule");

        Ok(entries
            .into_iter()
            .map(|entry| {
                let race = Race::scheduled(entry.id, entry.track, entry.race_number, entry.post_time);
                match entry.country {
                    Some(country) => race.with_country(country),
                    None => race,
                }
            })
            .collect())
    }

    async fn open_session(&self, race_id: &str) -> Result<SessionHandle, SourceError> {
        let response: OpenSessionResponse = self
            .send_json(Method::POST, &format!("/races/{}/sessions", urlencoding::encode(race_id)))
            .await?;
        debug!(race_id = %race_id, session_id = %response.session_id, "Opened session");
        Ok(SessionHandle::new(response.session_id, race_id))
    }

    async fn prepare_session(&self, handle: &SessionHandle) -> Result<(), SourceError> {
        self.send(Method::POST, &format!("/sessions/{}/prepare", urlencoding::encode(&handle.id)))
            .await?;
        Ok(())
    }

    async fn poll_odds(&self, handle: &SessionHandle) -> Result<PollOutcome, SourceError> {
        let response: OddsResponse = self
            .send_json(Method::GET, &format!("/sessions/{}/odds", urlencoding::encode(&handle.id)))
            .await?;
        Ok(response.into_outcome(&handle.race_id))
    }

    async fn close_session(&self, handle: &SessionHandle) -> Result<(), SourceError> {
        self.send(Method::DELETE, &format!("/sessions/{}", urlencoding::encode(&handle.id)))
            .await?;
        Ok(())
    }
}
