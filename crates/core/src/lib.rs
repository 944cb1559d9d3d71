pub mod admission;
pub mod config;
pub mod credentials;
pub mod metrics;
pub mod orchestrator;
pub mod race;
pub mod sink;
pub mod source;
pub mod testing;

pub use admission::{
    AdmissionConfig, AdmissionController, AdmissionStatus, Deferral, MemoryError, MemoryMonitor,
    SlotKind, SystemMemoryMonitor, WorkerSlot,
};
pub use config::{load_config, load_config_from_str, validate_config, Config, ConfigError};
pub use credentials::{CredentialError, CredentialStore, Credentials, FileCredentialStore};
pub use orchestrator::{
    OrchestratorConfig, RunCoordinator, RunError, RunStatus, RunSummary, StatusHandle,
    StopHandle,
};
pub use race::{FailureContext, MarketType, OddsSnapshot, Phase, Race, RaceCalendar, RaceStatus};
pub use sink::{PersistenceError, PersistenceSink, SqliteRaceStore};
pub use source::{DataSource, HttpDataSource, PollOutcome, SessionHandle, SourceError};
