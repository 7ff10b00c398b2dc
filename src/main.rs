use anyhow::{Context, Result};
use clap::Parser;
use collector_manager::error::ConfigError;
use collector_manager::{Manager, ManagerConfig, Metric};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Command-line arguments for the collector manager
#[derive(Parser)]
#[command(
    name = "collector-manager",
    about = "Metrics collection orchestrator",
    long_about = "Runs the configured metric collectors on a fixed flush interval and prints \
                  every metric batch as one JSON object per line."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,

    /// Collect once, print the metrics and exit
    #[arg(long)]
    once: bool,

    /// Seconds between stats and health reports in the log
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    stats_interval_secs: u64,
}

impl Cli {
    /// Validate the CLI arguments
    ///
    /// Missing config files are not an error here; `load_config` falls back
    /// to defaults for them.
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            if config_path.exists() {
                if !config_path.is_file() {
                    return Err(format!(
                        "Configuration path is not a file: {}",
                        config_path.display()
                    ));
                }

                if let Some(extension) = config_path.extension() {
                    if extension != "toml" {
                        warn!(
                            "Configuration file does not have .toml extension: {}",
                            config_path.display()
                        );
                    }
                }
            }
        }

        if self.stats_interval_secs == 0 {
            return Err("--stats-interval-secs must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Load configuration from file or fall back to defaults
///
/// An unreadable or invalid file is reported and replaced by the defaults so
/// the collector still comes up.
fn load_config(config_path: Option<&Path>) -> ManagerConfig {
    let Some(path) = config_path else {
        info!("Using default configuration");
        return ManagerConfig::default();
    };

    info!("Loading configuration from: {}", path.display());
    match ManagerConfig::from_file(path) {
        Ok(config) => config,
        Err(ConfigError::ReadError(_)) => {
            warn!(
                "Configuration file '{}' not found or unreadable, using defaults",
                path.display()
            );
            ManagerConfig::default()
        }
        Err(e) => {
            error!("Configuration error in '{}': {}", path.display(), e);
            warn!("Using default configuration due to invalid config file");
            ManagerConfig::default()
        }
    }
}

fn print_batch(batch: &[Metric]) {
    for metric in batch {
        match serde_json::to_string(metric) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Failed to serialize metric {}: {}", metric.name, e),
        }
    }
}

async fn log_stats(manager: &Manager) {
    let stats = manager.stats().await;
    info!(
        "{} collectors ({} enabled): {} metrics, {} errors, {} batches dropped, {} errors dropped",
        stats.collector_count,
        stats.enabled_count,
        stats.total_metrics,
        stats.total_errors,
        stats.dropped_batches,
        stats.dropped_errors
    );
    if let Err(e) = manager.health().await {
        warn!("{}", e);
    }
}

async fn collect_once(manager: &Manager) {
    let batches = match manager.collect_once().await {
        Ok(batches) => batches,
        Err(e) => {
            for failure in &e.failures {
                warn!("{}", failure);
            }
            e.collected
        }
    };

    let mut names: Vec<&String> = batches.keys().collect();
    names.sort();
    for name in names {
        print_batch(&batches[name]);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref());
    let manager = Manager::new(config);
    manager
        .initialize()
        .await
        .context("Failed to initialize collectors")?;

    if cli.once {
        collect_once(&manager).await;
        return Ok(());
    }

    let mut metrics = manager
        .metrics_receiver()
        .context("Metrics receiver already taken")?;
    let mut errors = manager
        .error_receiver()
        .context("Error receiver already taken")?;
    manager
        .start()
        .await
        .context("Failed to start collector manager")?;

    let shutdown = CancellationToken::new();
    let handler_token = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal (SIGINT), shutting down gracefully...");
        handler_token.cancel();
    })
    .context("Error setting SIGINT handler for graceful shutdown")?;

    info!("Collector manager is running. Press Ctrl+C to stop.");

    let mut stats_ticker = tokio::time::interval(Duration::from_secs(cli.stats_interval_secs));
    stats_ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(batch) = metrics.recv() => print_batch(&batch),
            // Already logged by the manager
            Some(err) = errors.recv() => debug!("Received collector error: {}", err),
            _ = stats_ticker.tick() => log_stats(&manager).await,
        }
    }

    let stopped = manager.stop().await;

    // Batches already queued are still printed
    while let Some(batch) = metrics.recv().await {
        print_batch(&batch);
    }
    log_stats(&manager).await;

    stopped.context("Error during shutdown")
}

fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    info!("Starting collector manager");

    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        error!("{:#}", e);
        std::process::exit(1);
    }

    info!("Collector manager shutdown complete");
}
