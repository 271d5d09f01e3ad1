//! # Counter Cache Server Main Driver
//!
//! ## Purpose
//! Main entry point for the counter cache service. Wires up storage, the
//! three cache tiers, the invalidation gate, and the warming scheduler, then
//! either serves the HTTP API or runs a single warming pass and exits.
//!
//! ## Input/Output Specification
//! - **Input**: Configuration file, command line arguments, environment variables
//! - **Output**: Running web server, or a one-shot warming pass report
//! - **Scheduling**: An external cron-style trigger invokes `--warm <mode>`;
//!   the service never schedules warming itself
//!
//! ## Architecture Flow
//! 1. Parse command line arguments and load configuration
//! 2. Initialize logging and tracing
//! 3. Open storage and build the cache components
//! 4. Either run one warming pass (`--warm`) or start the API server
//! 5. Handle shutdown signals gracefully, flushing storage

use clap::{Arg, Command};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use council_counters::{
    api::ApiServer,
    calculator::{CounterRegistry, FigureCalculator},
    config::Config,
    errors::{CounterError, Result},
    fast_cache::{MemoryStore, VolatileStore},
    invalidation::InvalidationGate,
    lock::LockManager,
    orchestrator::CounterCache,
    results::ResultStore,
    storage::FigureStore,
    warming::{WarmingOutcome, WarmingScheduler},
    AppState, WarmMode,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let matches = Command::new("counter-cache-server")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Council Finance Team")
        .about("Counter cache and invalidation service for council financial statistics")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Server port")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("warm")
                .long("warm")
                .value_name("MODE")
                .help("Run one warming pass (critical|comprehensive) and exit"),
        )
        .arg(
            Arg::new("force-warm")
                .long("force-warm")
                .help("Clear the warming overlap guard before the pass")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("check-health")
                .long("check-health")
                .help("Run health checks and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    // Load configuration
    let config_path = matches.get_one::<String>("config").unwrap();
    let mut config = Config::from_file(config_path)?;

    if let Some(port) = matches.get_one::<u16>("port") {
        config.server.port = *port;
    }

    let config = Arc::new(config);

    // Initialize logging
    init_logging(&config)?;

    info!("Starting counter cache service v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {}", config_path);

    // Initialize application components
    let app_state = initialize_components(config.clone()).await?;

    // Run health checks if requested
    if matches.get_flag("check-health") {
        return run_health_checks(&app_state).await;
    }

    // One-shot warming pass: the integration point for an external scheduler
    if let Some(mode) = matches.get_one::<String>("warm") {
        let mode: WarmMode = mode.parse()?;
        return run_warming_pass(&app_state, mode, matches.get_flag("force-warm")).await;
    }

    // Start the API server
    let server = ApiServer::new(app_state.clone()).await?;

    info!(
        "Counter cache service started on {}:{}",
        config.server.host, config.server.port
    );

    // The server future is awaited in place; actix-web manages its own
    // worker threads and the future itself is not Send
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        result = server.run() => {
            match result {
                Ok(()) => warn!("Server stopped unexpectedly"),
                Err(e) => error!("Server error: {}", e),
            }
        }
    }

    shutdown_components(&app_state).await?;
    info!("Counter cache service shut down successfully");

    Ok(())
}

/// Initialize logging and tracing
fn init_logging(config: &Config) -> Result<()> {
    let log_level: tracing::Level =
        config.logging.level.parse().map_err(|_| CounterError::Config {
            message: format!("Invalid log level: {}", config.logging.level),
        })?;
    let filter = tracing_subscriber::filter::LevelFilter::from_level(log_level);

    if config.logging.json_format {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .json()
                    .with_filter(filter),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_filter(filter),
            )
            .init();
    }

    info!("Logging initialized with level: {}", config.logging.level);
    Ok(())
}

/// Initialize all application components
async fn initialize_components(config: Arc<Config>) -> Result<AppState> {
    info!("Initializing application components...");

    info!("Opening figure store...");
    let storage = Arc::new(FigureStore::new(config.storage.clone()).await?);
    let results = Arc::new(ResultStore::new(storage.database())?);

    // The volatile substrate backs both the fast cache and the locks
    let fast: Arc<dyn VolatileStore> = Arc::new(MemoryStore::new());
    let locks = Arc::new(LockManager::new(Arc::clone(&fast)));

    let registry = Arc::new(CounterRegistry::with_config(&config.counters));
    let calculator = Arc::new(FigureCalculator::new(
        Arc::clone(&storage),
        Arc::clone(&registry),
    ));

    let counters = Arc::new(CounterCache::new(
        config.cache.clone(),
        fast,
        Arc::clone(&results),
        calculator,
        Arc::clone(&locks),
    ));

    let gate = Arc::new(InvalidationGate::new(
        config.cache.clone(),
        results,
        Arc::clone(&counters),
    ));

    let warming = Arc::new(WarmingScheduler::new(
        config.cache.clone(),
        config.warming.clone(),
        Arc::clone(&registry),
        Arc::clone(&storage),
        Arc::clone(&counters),
        Arc::clone(&gate),
        locks,
    ));

    let app_state = AppState {
        config,
        storage,
        registry,
        counters,
        gate,
        warming,
    };

    verify_component_health(&app_state).await?;

    info!("All components initialized successfully");
    Ok(app_state)
}

/// Verify the health of all components
async fn verify_component_health(app_state: &AppState) -> Result<()> {
    info!("Verifying component health...");

    app_state.storage.health_check().await?;
    info!("✓ Figure store is healthy");

    let stats = app_state.counters.result_stats()?;
    info!(
        "✓ Result store is healthy ({} entries, {} stale)",
        stats.total_entries, stats.stale_entries
    );

    Ok(())
}

/// Run health checks and exit
async fn run_health_checks(app_state: &AppState) -> Result<()> {
    info!("Running health checks...");
    verify_component_health(app_state).await?;
    info!("All health checks passed!");
    Ok(())
}

/// Run one warming pass and report the outcome
async fn run_warming_pass(app_state: &AppState, mode: WarmMode, force: bool) -> Result<()> {
    info!("Running one-shot warming pass ({})", mode);

    let outcome = if force {
        app_state.warming.force_run(mode).await?
    } else {
        app_state.warming.run(mode).await?
    };

    match &outcome {
        WarmingOutcome::Completed(report) => {
            info!(
                "Warming pass complete: {}/{} warmed, {} pending, {} failed",
                report.warmed, report.targets, report.pending, report.failed
            );
        }
        WarmingOutcome::AlreadyRunning => {
            // Distinguishable, but not an error: the other pass does the work
            warn!("Warming pass skipped: another pass is already running");
        }
    }

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    shutdown_components(app_state).await
}

/// Gracefully shutdown all components
async fn shutdown_components(app_state: &AppState) -> Result<()> {
    info!("Shutting down components...");
    app_state.storage.flush().await?;
    info!("All components shut down successfully");
    Ok(())
}
