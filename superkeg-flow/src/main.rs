//! Flow monitor (superkeg-flow) - Main entry point
//!
//! Counts flow-meter pulses on every wired tap, groups them into pours and
//! records finished pours against the tapped keg.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use superkeg_common::config::locate_config_file;
use superkeg_common::db::{init_database, KegStore, SqliteKegStore};
use superkeg_common::events::EventBus;
use superkeg_flow::api::{self, AppContext};
use superkeg_flow::calibration::CalibrationStore;
use superkeg_flow::config::{Config, ConfigOverrides, EdgeSourceKind, FlowSettings, LoggingConfig, TomlConfig};
use superkeg_flow::coordinator::{run_status_log, MultiTapCoordinator};
use superkeg_flow::reconcile::{
    run_publisher, DisplayPublisher, HttpDisplayPublisher, KegApi, KegApiClient, ProgressBoard, VolumeReconciler,
};
use superkeg_flow::sensor::{EdgeSource, SimulatedSource, SysfsGpioSource};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for superkeg-flow
#[derive(Parser, Debug)]
#[command(name = "superkeg-flow")]
#[command(about = "Flow meter monitor for SuperKeg")]
#[command(version)]
struct Args {
    /// Bootstrap TOML file
    #[arg(short, long, env = "SUPERKEG_CONFIG")]
    config: Option<PathBuf>,

    /// Root folder holding the database and calibration files
    #[arg(short, long, env = "SUPERKEG_ROOT")]
    root_folder: Option<PathBuf>,

    /// Database file (overrides the root folder default)
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Port for the control API
    #[arg(short, long, env = "SUPERKEG_FLOW_PORT")]
    port: Option<u16>,

    /// Generate synthetic pulses instead of reading GPIO
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Config file is optional; its absence is reported once logging is up
    let config_file = locate_config_file(args.config.as_deref());
    let toml_config = match &config_file {
        Ok(path) => TomlConfig::load(Some(path.as_path())).context("Failed to load configuration")?,
        Err(_) if args.config.is_none() => TomlConfig::default(),
        Err(e) => return Err(anyhow::anyhow!("{}", e)),
    };

    let config = Config::resolve(
        toml_config,
        ConfigOverrides {
            root_folder: args.root_folder,
            database_path: args.database,
            port: args.port,
            simulate: args.simulate,
        },
    );

    init_logging(&config.logging)?;

    info!(
        "Starting SuperKeg flow monitor v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    match &config_file {
        Ok(path) => info!("Configuration: {}", path.display()),
        Err(_) => warn!("No config file found, using built-in defaults"),
    }
    info!("Root folder: {}", config.root_folder.display());
    info!("Database: {}", config.database_path.display());

    // Database and runtime settings
    let pool = init_database(&config.database_path)
        .await
        .context("Failed to initialize database")?;
    let settings = FlowSettings::load(&pool)
        .await
        .context("Failed to load runtime settings")?;
    info!(
        "Pour timeout {}ms, minimum pour {:.0} mL, debounce {}us",
        settings.pour_timeout_ms, settings.min_pour_ml, settings.debounce_us
    );

    let store: Arc<dyn KegStore> = Arc::new(SqliteKegStore::new(pool.clone()));
    let event_bus = EventBus::new(1000);
    let shutdown = CancellationToken::new();

    // Keg web application clients
    let remote: Option<Arc<dyn KegApi>> = if config.keg_api_url.is_empty() {
        warn!("No keg API URL configured, committing pours to the database only");
        None
    } else {
        let client = KegApiClient::new(config.keg_api_url.as_str(), settings.keg_api_timeout())
            .context("Failed to create keg API client")?;
        info!("Keg API: {}", config.keg_api_url);
        Some(Arc::new(client))
    };
    let display: Option<Arc<dyn DisplayPublisher>> = if config.display_url.is_empty() {
        None
    } else {
        let publisher = HttpDisplayPublisher::new(&config.display_url, settings.display_timeout())
            .context("Failed to create display publisher")?;
        Some(Arc::new(publisher))
    };

    // Progress board and its publisher
    let board = Arc::new(ProgressBoard::new(settings.progress_stale()));
    let publisher_task = tokio::spawn(run_publisher(
        Arc::clone(&board),
        display,
        event_bus.clone(),
        settings.progress_publish_interval(),
        shutdown.child_token(),
    ));

    let reconciler = Arc::new(VolumeReconciler::new(
        remote,
        Arc::clone(&store),
        board,
        event_bus.clone(),
    ));

    let source: Arc<dyn EdgeSource> = match config.edge_source {
        EdgeSourceKind::Sysfs => Arc::new(SysfsGpioSource::new(config.gpio_root.clone())),
        EdgeSourceKind::Simulated => {
            warn!("Simulated edge source: no hardware is read");
            Arc::new(SimulatedSource::default())
        }
    };

    let coordinator = Arc::new(MultiTapCoordinator::new(
        store,
        source,
        reconciler,
        CalibrationStore::new(config.calibration_dir.clone()),
        settings.clone(),
        event_bus.clone(),
        config.taps.clone(),
    ));

    let configured = coordinator.setup_all().await;
    if configured.is_empty() {
        warn!("No kegs tapped; use POST /taps/refresh after tapping a keg");
    }
    coordinator.start_all().await;

    let status_task = tokio::spawn(run_status_log(
        Arc::clone(&coordinator),
        settings.status_log_interval(),
        shutdown.child_token(),
    ));

    // Control API
    let ctx = AppContext {
        coordinator: Arc::clone(&coordinator),
        event_bus,
        port: config.port,
    };
    let server = tokio::spawn(api::run(ctx, shutdown.clone()));

    tokio::select! {
        _ = shutdown_signal() => {}
        result = wait_server(server) => {
            if let Err(e) = result {
                error!("HTTP server failed: {}", e);
            }
        }
    }

    info!("Shutting down");
    shutdown.cancel();

    if let Err(e) = coordinator.stop_all().await {
        error!("Shutdown incomplete: {}", e);
    }
    for task in [publisher_task, status_task] {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }
    pool.close().await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_server(server: tokio::task::JoinHandle<superkeg_flow::Result<()>>) -> Result<()> {
    server.await.context("HTTP server task panicked")??;
    Ok(())
}

/// stderr logging plus an optional plain-text log file
fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let level = &logging.level;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "superkeg_flow={level},superkeg_common={level},tower_http={level}",
            level = level
        )
        .into()
    });

    let file_layer = match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
