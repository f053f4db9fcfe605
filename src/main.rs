//! Routerwatch Binary Entry Point
//!
//! Runs the API server with the poll scheduler, a single sweep, or a key
//! rotation. Core functionality is provided by the `routerwatch` library crate.

use clap::{Parser, Subcommand};
use routerwatch::{
    KeyRing, PollScheduler, Poller, RouterOsConnector, SecretCipher, SessionFactory,
    config::AppConfig,
    poller::DEFAULT_SHUTDOWN_TIMEOUT,
    server::{AppState, create_router},
    sink::MetricsSink,
    storage::{Event, EventKind, EventSeverity, EventWriter, StorageBuilder, StorageHandles, sources},
};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Routerwatch - Router Registry and Telemetry Poller
#[derive(Parser, Debug)]
#[command(name = "routerwatch", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/config.yaml",
        env = "ROUTERWATCH_CONFIG"
    )]
    config: String,

    /// Server bind address (overrides config file)
    #[arg(long, env = "ROUTERWATCH_SERVER_BIND")]
    server_bind: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, env = "ROUTERWATCH_SERVER_PORT")]
    server_port: Option<u16>,

    /// Database path (overrides config file)
    #[arg(long, env = "ROUTERWATCH_DB_PATH")]
    db_path: Option<String>,

    /// Key ring directory (overrides config file)
    #[arg(long, env = "ROUTERWATCH_KEY_DIR")]
    key_dir: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the API server and the poll scheduler (default)
    Serve,
    /// Poll every registered device once and print the summary
    Sweep,
    /// Generate a new key version and re-seal all stored secrets
    RotateKey,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,routerwatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration from file
    tracing::info!("Loading configuration from: {}", cli.config);
    let mut config = AppConfig::load_with_device_path(&cli.config)?;

    // Apply CLI/env overrides (CLI > ENV > config file)
    if let Some(bind) = cli.server_bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.server_port {
        config.server.port = port;
    }
    if let Some(path) = cli.db_path {
        config.database.path = path;
    }
    if let Some(dir) = cli.key_dir {
        config.keys.path = dir;
    }
    config.validate()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await.map(|()| ExitCode::SUCCESS),
        Command::Sweep => sweep(config).await,
        Command::RotateKey => rotate_key(config).await.map(|()| ExitCode::SUCCESS),
    }
}

/// Load the key ring, honoring a pinned active version.
fn load_key_ring(config: &AppConfig) -> Result<KeyRing, Box<dyn std::error::Error>> {
    let ring = KeyRing::load_or_init(&config.keys.path)?;
    Ok(match config.keys.active_version {
        Some(version) => ring.with_active(version)?,
        None => ring,
    })
}

async fn open_storage(
    config: &AppConfig,
    cipher: Arc<SecretCipher>,
) -> Result<StorageHandles, Box<dyn std::error::Error>> {
    tracing::info!("Initializing storage at: {}", config.database.path);
    let handles = StorageBuilder::new(&config.database.path)
        .max_connections(config.database.max_connections)
        .busy_timeout(config.database.busy_timeout)
        .build(cipher)
        .await?;
    tracing::info!("Storage initialized");
    Ok(handles)
}

/// Register configured devices that are not in the registry yet (insert only, no updates).
async fn seed_devices(
    config: &AppConfig,
    handles: &StorageHandles,
) -> Result<(), Box<dyn std::error::Error>> {
    if config.devices.is_empty() {
        return Ok(());
    }

    let mut inserted = 0;
    let mut skipped = 0;
    for device in &config.devices {
        match handles
            .device_store
            .insert_if_not_exists(&device.to_new_device())
            .await?
        {
            Some(id) => {
                tracing::info!("Seeded device: {} ({}, id={})", device.name, device.address, id);
                inserted += 1;
            }
            None => {
                tracing::debug!(
                    "Device already registered, skipping: {} ({})",
                    device.name,
                    device.address
                );
                skipped += 1;
            }
        }
    }

    tracing::info!("Device seeding complete: {} inserted, {} skipped", inserted, skipped);
    Ok(())
}

fn build_poller(config: &AppConfig, handles: &StorageHandles) -> Poller {
    let transport = &config.transport;
    let connector = RouterOsConnector::new()
        .with_default_port(transport.default_port)
        .with_io_timeout(transport.io_timeout)
        .with_exclusive_sessions(transport.exclusive_sessions);

    let sessions = SessionFactory::new(handles.device_store.clone(), Arc::new(connector))
        .with_connect_timeout(transport.connect_timeout);
    let sink: Arc<dyn MetricsSink> = Arc::new(handles.metric_writer.clone());

    Poller::new(sessions, sink)
        .with_events(handles.event_writer.clone())
        .with_retention(handles.storage_admin.clone(), config.database.retention_days)
        .with_settings(config.poller.settings())
}

async fn serve(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Routerwatch - Router Registry and Telemetry Poller");
    tracing::info!(
        "Server: {}:{}, Database: {}",
        config.server.bind,
        config.server.port,
        config.database.path,
    );

    let ring = load_key_ring(&config)?;
    let cipher = Arc::new(SecretCipher::new(&ring)?);
    let handles = open_storage(&config, cipher).await?;
    seed_devices(&config, &handles).await?;

    let poller = build_poller(&config, &handles);

    // Emit service started event
    handles
        .event_writer
        .emit(
            Event::new(sources::SYSTEM, EventKind::System, EventSeverity::Info, "Service started")
                .with_payload("key_version", ring.active_version()),
        )
        .await;

    let scheduler = if config.poller.enabled {
        let mut scheduler = PollScheduler::new(poller.clone(), config.poller.schedule()?).await?;
        scheduler.start().await?;
        Some(scheduler)
    } else {
        tracing::info!("Poll scheduler disabled");
        None
    };

    let app_state = AppState {
        sessions: poller.sessions().clone(),
        metric_reader: handles.metric_reader.clone(),
        event_reader: handles.event_reader.clone(),
        event_writer: handles.event_writer.clone(),
    };

    // Build Axum router
    let app = create_router(app_state);

    // Parse bind address
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;

    tracing::info!("Web server listening on: http://{}", addr);
    tracing::info!("Press Ctrl+C to shutdown");

    // Start server with graceful shutdown
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(handles.event_writer.clone()))
        .await?;

    if let Some(scheduler) = scheduler {
        tracing::info!("Shutting down poll scheduler...");
        if let Err(e) = scheduler.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await {
            tracing::error!("Failed to shutdown poll scheduler: {}", e);
        }
    }

    tracing::info!("Shutting down storage...");
    handles.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Run one sweep; exits non-zero if any device failed.
async fn sweep(config: AppConfig) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let ring = load_key_ring(&config)?;
    let cipher = Arc::new(SecretCipher::new(&ring)?);
    let handles = open_storage(&config, cipher).await?;
    seed_devices(&config, &handles).await?;

    let report = build_poller(&config, &handles).run_sweep_once().await?;
    println!("{}", serde_json::to_string_pretty(&report.summary())?);

    handles.shutdown().await;
    Ok(if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Rotate to a fresh key version and re-seal every stored secret under it.
async fn rotate_key(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(pinned) = config.keys.active_version {
        tracing::warn!(
            pinned,
            "keys.active_version is set; unpin it after rotation or the new key stays unused"
        );
    }

    let mut ring = KeyRing::load_or_init(&config.keys.path)?;
    let previous = ring.active_version();
    let version = ring.rotate()?;

    let cipher = Arc::new(SecretCipher::new(&ring)?);
    let handles = open_storage(&config, cipher).await?;

    let resealed = handles.device_store.reencrypt_all().await?;
    tracing::info!(previous, version, resealed, "Key rotation complete");

    handles
        .event_writer
        .emit(
            Event::new(
                sources::SYSTEM,
                EventKind::Audit,
                EventSeverity::Info,
                format!("Key rotated to version {version}"),
            )
            .with_payload("previous_version", previous)
            .with_payload("version", version)
            .with_payload("resealed", resealed),
        )
        .await;

    println!("key version {version} active, {resealed} secret(s) re-sealed");
    handles.shutdown().await;
    Ok(())
}

/// Setup graceful shutdown signal handler.
async fn shutdown_signal(events: EventWriter) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }

    // Emit service stopping event
    events
        .emit(Event::new(
            sources::SYSTEM,
            EventKind::System,
            EventSeverity::Info,
            "Service stopping",
        ))
        .await;
}
