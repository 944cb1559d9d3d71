//! Run orchestration for one operating day.
//!
//! The coordinator drives races through two bounded pools:
//! - **Preparation**: readies a provider session ahead of post time
//! - **Watch**: polls odds until results post, one worker per race
//!
//! Both pools draw their slots from the shared admission controller.

mod config;
mod preparation;
mod retry;
mod runner;
mod session;
mod types;
mod watch;

pub use config::{OrchestratorConfig, PersistenceConfig, RetryConfig, WatchConfig};
pub use preparation::PreparationWorker;
pub use retry::{persist_with_retry, RetryPolicy};
pub use runner::RunCoordinator;
pub use session::{SessionGuard, DEFAULT_CLOSE_TIMEOUT};
pub use types::{
    Cancellation, RunError, RunStatus, RunSummary, StatusHandle, StopHandle, WorkerOutcome,
};
pub use watch::WatchWorker;
