//! varroa-monitor
//!
//! HTTP control surface for the detection pipeline supervisor.
//! This is the main entry point that initializes the server and handles subcommands.

mod cli;
mod commands;
mod handlers;
mod metrics;
mod state;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::{net::TcpListener, signal};
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, warn};
use varroa_monitor::config::{
    load_config, show_config, validate_effective_config, DEFAULT_BIND_ADDR, DEFAULT_PORT,
};
use varroa_monitor::{Config, JsonlStore, MemoryStore, MetricsStore, StartStatus, Supervisor};

use cli::{Args, Commands};
use commands::{command_config, command_reap, command_replay, command_simulate};
use handlers::{
    health_handler, metrics_handler, metrics_records_handler, sessions_handler, start_handler,
    stats_handler, stop_handler, time_series_handler,
};
use metrics::DetectionMetrics;
use state::{AppState, SharedState};

/// Initializes tracing logging subsystem with configured log level.
fn setup_logging(config: &Config) {
    let level = config.log_level.as_deref().unwrap_or("info");
    let filter = match level.to_ascii_lowercase().as_str() {
        "off" => LevelFilter::OFF,
        "error" => LevelFilter::ERROR,
        "warn" => LevelFilter::WARN,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        _ => LevelFilter::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return;
    }

    info!("Logging initialized with level: {}", level);
}

/// Merges config file and CLI flags (CLI > config file > defaults).
fn resolve_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if args.no_config {
        Config::default()
    } else {
        load_config(args.config.as_deref())?
    };

    if let Some(port) = args.port {
        config.port = Some(port);
    }
    if let Some(bind) = args.bind {
        config.bind = Some(bind.to_string());
    }
    if let Some(level) = args.log_level_name() {
        config.log_level = Some(level.to_string());
    }
    if let Some(command) = &args.pipeline_command {
        config.pipeline.command = command.clone();
    }
    if let Some(path) = &args.store {
        config.store.path = Some(path.clone());
    }

    Ok(config)
}

/// Helper function to load and validate configuration.
/// Exits the process with error code 1 if validation fails.
fn load_validated_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let config = resolve_config(args)?;
    if let Err(e) = validate_effective_config(&config) {
        eprintln!("❌ Configuration invalid: {}", e);
        std::process::exit(1);
    }
    Ok(config)
}

/// Opens the journal when `store.path` is set, otherwise keeps sessions in memory.
fn open_store(config: &Config) -> Result<Arc<dyn MetricsStore>, Box<dyn std::error::Error>> {
    match &config.store.path {
        Some(path) => {
            let store = JsonlStore::open(path, config.store.max_metrics)?;
            info!("Session store: {}", store.path().display());
            Ok(Arc::new(store))
        }
        None => {
            info!("Session store: in memory");
            Ok(Arc::new(MemoryStore::new(config.store.max_metrics)))
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
            info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }
}

/// Main application entry point.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Early config resolution for show/check modes
    if args.show_config || args.check_config {
        let config = resolve_config(&args)?;

        if args.check_config {
            if let Err(e) = validate_effective_config(&config) {
                eprintln!("❌ Configuration invalid: {}", e);
                std::process::exit(1);
            }
            println!("✅ Configuration is valid");
            return Ok(());
        }

        return show_config(&config, args.config_format);
    }

    // Handle subcommands
    if let Some(command) = &args.command {
        // Generating a config and emitting fake output need no validated config
        match command {
            Commands::Config {
                output,
                format,
                commented,
            } => return Ok(command_config(output.clone(), *format, *commented)?),
            Commands::Simulate {
                frames,
                interval_ms,
                seed,
            } => return Ok(command_simulate(*frames, *interval_ms, *seed)?),
            _ => {}
        }

        let config = load_validated_config(&args)?;

        return match command {
            Commands::Reap { dry_run } => Ok(command_reap(*dry_run, &config)?),
            Commands::Replay { file, format } => Ok(command_replay(file, *format, &config)?),
            Commands::Config { .. } | Commands::Simulate { .. } => Ok(()),
        };
    }

    // Load configuration for main server mode
    let config = load_validated_config(&args)?;

    setup_logging(&config);

    info!("Starting varroa-monitor");
    debug!("Pipeline command: {}", config.pipeline.command);

    let bind_ip_str = config.bind.as_deref().unwrap_or(DEFAULT_BIND_ADDR);
    let port = config.port.unwrap_or(DEFAULT_PORT);

    let store = open_store(&config)?;
    let supervisor = Arc::new(Supervisor::new(&config, store.clone()));

    // Clean up whatever a previous crash left behind
    if config.reaper.reap_on_startup && !args.no_startup_reap {
        let sup = supervisor.clone();
        match tokio::task::spawn_blocking(move || sup.reaper().sweep()).await {
            Ok(report) if report.processes() > 0 => {
                warn!(
                    "Startup sweep signaled {} leftover pipeline process(es)",
                    report.processes()
                );
            }
            Ok(_) => debug!("Startup sweep found nothing to reap"),
            Err(e) => error!("Startup sweep failed: {}", e),
        }
    }

    // Initialize Prometheus metrics registry
    let registry = Registry::new();
    let metrics = DetectionMetrics::new(&registry)?;
    debug!("All metrics registered successfully");

    let state: SharedState = Arc::new(AppState {
        supervisor: supervisor.clone(),
        store,
        registry,
        metrics,
        config: Arc::new(config.clone()),
        start_time: Instant::now(),
    });

    if args.autostart {
        let sup = supervisor.clone();
        match tokio::task::spawn_blocking(move || sup.start()).await {
            Ok(Ok(StartStatus::Started)) => info!("Detection autostarted"),
            Ok(Ok(StartStatus::AlreadyRunning)) => debug!("Detection already running"),
            Ok(Err(e)) => error!("Autostart failed: {}", e),
            Err(e) => error!("Autostart task failed: {}", e),
        }
    }

    // Configure HTTP server routes
    let addr: SocketAddr = format!("{}:{}", bind_ip_str, port).parse()?;

    let app = Router::new()
        .route("/start_detection", post(start_handler))
        .route("/stop_detection", post(stop_handler))
        .route("/get_stats", get(stats_handler))
        .route("/get_time_series", get(time_series_handler))
        .route("/api/sessions", get(sessions_handler))
        .route("/api/metrics", get(metrics_records_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!("varroa-monitor listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The pipeline must not outlive the server
    let sup = supervisor.clone();
    match tokio::task::spawn_blocking(move || sup.stop()).await {
        Ok(status) => info!("Supervisor stopped ({:?})", status),
        Err(e) => error!("Stopping supervisor failed: {}", e),
    }

    info!("Server shutdown complete");
    Ok(())
}
