use chrono::{DateTime, Utc};
use galadriel_core::{RunStatus, StatusHandle};

/// Shared application state
pub struct AppState {
    status: StatusHandle,
    config_hash: String,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(status: StatusHandle, config_hash: impl Into<String>) -> Self {
        Self {
            status,
            config_hash: config_hash.into(),
            started_at: Utc::now(),
        }
    }

    /// Latest status published by the run coordinator.
    pub fn run_status(&self) -> RunStatus {
        self.status.current()
    }

    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}
