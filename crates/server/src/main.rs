use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sha2::{Digest, Sha256};
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use galadriel_core::{
    load_config, validate_config, AdmissionController, Config, CredentialError, CredentialStore,
    Credentials, FileCredentialStore, HttpDataSource, RunCoordinator, SqliteRaceStore,
    StatusHandle, SystemMemoryMonitor,
};
use galadriel_server::api::create_router;
use galadriel_server::logging::init_logging;
use galadriel_server::state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Config file read when `--config` is not given, if it exists.
const DEFAULT_CONFIG: &str = "galadriel.toml";

/// Collects odds for one day of horse races.
#[derive(Debug, Parser)]
#[command(name = "galadriel", version, about)]
struct Args {
    /// SQLite database for races and odds snapshots.
    storage: Option<PathBuf>,

    /// Configuration file.
    #[arg(short, long, env = "GALADRIEL_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for galadriel.log and missing_races.log.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Maximum concurrent preparation workers.
    #[arg(long)]
    max_preparers: Option<usize>,

    /// Maximum concurrent watch workers.
    #[arg(long)]
    max_watchers: Option<usize>,

    /// Memory utilization ceiling in percent. Values above 100 are clamped.
    #[arg(long)]
    max_memory_percent: Option<f32>,

    /// Store provider credentials read from stdin, then exit.
    #[arg(long)]
    setup_credentials: bool,
}

impl Args {
    /// Command line flags win over the config file.
    fn apply(&self, config: &mut Config) {
        if let Some(storage) = &self.storage {
            config.storage.path = storage.clone();
        }
        if let Some(dir) = &self.log_dir {
            config.logging.dir = Some(dir.clone());
        }
        if let Some(max) = self.max_preparers {
            config.admission.max_preparation = max;
        }
        if let Some(max) = self.max_watchers {
            config.admission.max_watch = max;
        }
        if let Some(percent) = self.max_memory_percent {
            config.admission.max_memory_percent = percent.min(100.0);
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config_path = args.config.clone().or_else(|| {
        let default = PathBuf::from(DEFAULT_CONFIG);
        default.exists().then_some(default)
    });
    let mut config = match &config_path {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::default(),
    };
    args.apply(&mut config);

    let _log_guards = init_logging(
        &config.logging.level,
        config.logging.dir.as_deref(),
        config.logging.json,
    )?;

    if args.setup_credentials {
        return setup_credentials(&config.provider.credentials_path);
    }

    validate_config(&config).context("Configuration validation failed")?;

    info!("Starting galadriel {}", VERSION);
    match &config_path {
        Some(path) => info!("Configuration loaded from {:?}", path),
        None => info!("No configuration file, using defaults"),
    }
    info!("Database path: {:?}", config.storage.path);
    info!(
        max_preparation = config.admission.max_preparation,
        max_watch = config.admission.max_watch,
        max_memory_percent = config.admission.max_memory_percent,
        "Admission limits"
    );

    let config_json = serde_json::to_string(&config).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    let config_hash_short = config_hash[..16].to_string();

    let store = Arc::new(
        SqliteRaceStore::new(&config.storage.path).context("Failed to open race store")?,
    );
    info!("Race store initialized");

    let credentials = load_credentials(&config.provider.credentials_path)?;
    let source = Arc::new(
        HttpDataSource::new(config.provider.clone(), credentials)
            .context("Failed to create provider client")?,
    );
    info!("Provider client for {}", config.provider.base_url);

    let admission = AdmissionController::new(
        config.admission.clone(),
        Arc::new(SystemMemoryMonitor::new()),
    );
    let coordinator = RunCoordinator::new(config.orchestrator.clone(), source, store, admission);

    let stop = coordinator.stop_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Stop requested, finishing the run");
        stop.stop();
    });

    let server = if config.server.enabled {
        let addr = SocketAddr::new(config.server.host, config.server.port);
        Some(spawn_status_server(addr, coordinator.status_handle(), config_hash_short).await?)
    } else {
        None
    };

    let result = coordinator.run().await;

    if let Some((server_stop, server_task)) = server {
        let _ = server_stop.send(());
        if let Err(e) = server_task.await {
            warn!("Status server task failed: {}", e);
        }
    }

    let summary = result.context("Run failed")?;
    info!(
        run_id = %summary.run_id,
        total = summary.total,
        completed = summary.completed,
        errored = summary.errored,
        incomplete = summary.incomplete.len(),
        stopped_early = summary.stopped_early,
        "Run complete"
    );
    Ok(())
}

/// Read credentials once. A missing file is allowed for providers that
/// need no authentication.
fn load_credentials(path: &Path) -> Result<Option<Credentials>> {
    match FileCredentialStore::new(path).get_credentials() {
        Ok(credentials) => {
            info!("Loaded credentials for {}", credentials.identity);
            Ok(Some(credentials))
        }
        Err(CredentialError::NotFound(_)) => {
            warn!(
                "No credentials at {:?}; run with --setup-credentials if the provider needs them",
                path
            );
            Ok(None)
        }
        Err(e) => Err(e).context("Failed to read credentials"),
    }
}

/// Prompt for identity and secret on stdin and store them.
fn setup_credentials(path: &Path) -> Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut prompt = |label: &str| -> Result<String> {
        eprint!("{}: ", label);
        io::stderr().flush().context("Failed to write prompt")?;
        let line = lines
            .next()
            .context("stdin closed before credentials were entered")?
            .context("Failed to read stdin")?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    };

    let identity = prompt("Identity")?;
    let secret = prompt("Secret")?;
    let credentials = Credentials::new(identity, secret).context("Invalid credentials")?;

    FileCredentialStore::new(path)
        .save(&credentials)
        .with_context(|| format!("Failed to store credentials at {:?}", path))?;
    info!("Credentials stored at {:?}", path);
    Ok(())
}

async fn spawn_status_server(
    addr: SocketAddr,
    status: StatusHandle,
    config_hash: String,
) -> Result<(oneshot::Sender<()>, tokio::task::JoinHandle<()>)> {
    let state = Arc::new(AppState::new(status, config_hash));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Status server listening on {}", addr);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = stop_rx.await;
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("Status server error: {}", e);
        }
    });
    Ok((stop_tx, task))
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
