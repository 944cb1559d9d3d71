//! Tracing subscriber setup.
//!
//! Logs go to stderr and, when a directory is configured, to
//! `<dir>/galadriel.log`. Races left incomplete at shutdown are logged under
//! the `missing_races` target, which is also copied to
//! `<dir>/missing_races.log`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    filter::Targets, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// File name used inside the log directory.
pub const LOG_FILE_NAME: &str = "galadriel.log";

/// Per-run list of races that never reached a terminal status.
pub const MISSING_RACES_FILE_NAME: &str = "missing_races.log";

const MISSING_RACES_TARGET: &str = "missing_races";

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `level`. The returned guards flush the
/// file writers when dropped and must live as long as the process logs.
pub fn init_logging(level: &str, dir: Option<&Path>, json: bool) -> Result<Vec<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("{},tower_http=info", level)))
        .with_context(|| format!("Invalid log level '{}'", level))?;

    let mut guards = Vec::new();
    let (main_file, missing_file) = match dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {:?}", dir))?;
            let (main, main_guard) = file_writer(dir, LOG_FILE_NAME)?;
            let (missing, missing_guard) = file_writer(dir, MISSING_RACES_FILE_NAME)?;
            guards.push(main_guard);
            guards.push(missing_guard);
            (Some(main), Some(missing))
        }
        None => (None, None),
    };

    let missing_layer = missing_file.map(|writer| {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(writer)
            .with_filter(Targets::new().with_target(MISSING_RACES_TARGET, Level::WARN))
    });

    let registry = tracing_subscriber::registry().with(filter).with(missing_layer);
    let installed = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(main_file.map(|writer| fmt::layer().json().with_ansi(false).with_writer(writer)))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(main_file.map(|writer| fmt::layer().with_ansi(false).with_writer(writer)))
            .try_init()
    };
    installed.context("Failed to install tracing subscriber")?;

    Ok(guards)
}

/// Append-only file in `dir`, written from a background thread.
fn file_writer(dir: &Path, name: &str) -> Result<(NonBlocking, WorkerGuard)> {
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name)
        .build(dir)
        .with_context(|| format!("Failed to open log file {:?}", dir.join(name)))?;
    Ok(tracing_appender::non_blocking(appender))
}
