//! # Harbor Agent
//!
//! Headless process that pairs the terminal, keeps the local replica in step
//! with the backend and delivers queued orders.
//!
//! ## Environment
//! - `HARBOR_DB_PATH` - SQLite file (default: platform data dir / harbor.db)
//! - `HARBOR_CONFIG` - sync.toml location (default: platform config dir)
//! - `HARBOR_*` - per-setting overrides, see `harbor_sync::config`
//! - `RUST_LOG` - log filter (default: `info,harbor=debug,sqlx=warn`)

use directories::ProjectDirs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use harbor_db::{Database, DbConfig};
use harbor_sync::{
    DatasetSyncEngine, DeviceIdentityManager, HostFingerprint, HttpBackend, HttpProbe,
    OrderQueue, RunExit, SyncConfig, SyncError, SyncScheduler, SystemClock,
};

/// Pause before asking the backend for a new device code after a failure.
const PAIRING_RETRY: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    info!("Starting Harbor agent...");

    let config = SyncConfig::load(std::env::var_os("HARBOR_CONFIG").map(PathBuf::from))?;
    info!(
        backend = %config.backend.base_url,
        interval_secs = config.sync.interval_secs,
        "Configuration loaded"
    );

    let db_path = database_path()?;
    info!(?db_path, "Database path determined");
    let device_id_path = db_path.with_file_name("device.id");
    let db = Database::new(DbConfig::new(db_path)).await?;

    let backend = Arc::new(HttpBackend::new(&config)?);
    let probe = Arc::new(HttpProbe::new(&config)?);
    let clock = Arc::new(SystemClock);

    let identity = Arc::new(DeviceIdentityManager::new(
        &config,
        backend.clone(),
        db.credentials(),
        Arc::new(HostFingerprint::new().with_fallback(device_id_path)),
        clock.clone(),
    ));
    let engine = DatasetSyncEngine::new(backend.clone(), db.datasets(), db.versions(), clock.clone());
    let queue = Arc::new(OrderQueue::new(
        &config,
        backend,
        db.orders(),
        db.versions(),
        clock.clone(),
    ));
    let scheduler = SyncScheduler::new(
        &config,
        identity.clone(),
        engine,
        queue,
        db.versions(),
        probe,
        clock,
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    // The first cycle resolves identity. The scheduler hands control back
    // whenever the device needs pairing, at startup or after the backend
    // forgets it.
    while scheduler.run(shutdown.clone()).await == RunExit::PairingRequired {
        match pair(&identity, &shutdown).await {
            Ok(true) => {}
            Ok(false) => {
                info!("Agent stopped before pairing completed");
                break;
            }
            Err(e) => {
                db.close().await;
                return Err(e.into());
            }
        }
    }

    db.close().await;

    info!("Agent shutdown complete");
    Ok(())
}

/// Runs the device-code flow until approval. Returns `false` on shutdown.
async fn pair(
    identity: &DeviceIdentityManager,
    shutdown: &CancellationToken,
) -> Result<bool, SyncError> {
    loop {
        let authorization = match identity.start_pairing().await {
            Ok(authorization) => authorization,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Could not start pairing");
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(false),
                    _ = tokio::time::sleep(PAIRING_RETRY) => continue,
                }
            }
            Err(e) => return Err(e),
        };

        info!(
            user_code = %authorization.user_code,
            verification_uri = %authorization.verification_uri,
            expires_in = authorization.expires_in,
            "Pair this terminal: enter the code at the verification address"
        );

        match identity.poll_for_credential(&authorization, shutdown).await {
            Ok(session) => {
                info!(device_id = %session.device_id(), "Terminal paired");
                return Ok(true);
            }
            Err(SyncError::PairingCancelled) => return Ok(false),
            Err(SyncError::PairingExpired) => {
                warn!("Pairing code expired; requesting a new one");
            }
            Err(e) => {
                error!(error = %e, "Pairing failed");
                return Err(e);
            }
        }
    }
}

/// Initializes the tracing subscriber.
///
/// - `RUST_LOG=debug` - everything at debug
/// - `RUST_LOG=harbor_sync=trace` - request-level tracing for the sync layer
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,harbor=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::TRACE)
        .init();
}

/// Database location, overridable with `HARBOR_DB_PATH`.
///
/// - **Linux**: `~/.local/share/pos/harbor.db`
/// - **macOS**: `~/Library/Application Support/com.harbor.pos/harbor.db`
/// - **Windows**: `%APPDATA%\harbor\pos\data\harbor.db`
fn database_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Ok(path) = std::env::var("HARBOR_DB_PATH") {
        return Ok(PathBuf::from(path));
    }

    let proj_dirs =
        ProjectDirs::from("com", "harbor", "pos").ok_or("Could not determine app data directory")?;
    let data_dir = proj_dirs.data_dir();
    std::fs::create_dir_all(data_dir)?;

    Ok(data_dir.join("harbor.db"))
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, finishing the current cycle...");
}
