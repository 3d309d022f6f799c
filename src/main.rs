//! Cerebro Ingest command-line entry point.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result as AnyhowResult};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cerebro_ingest::logging::init_logging;
use cerebro_ingest::transport::{RequestEnvelope, TransportError, TransportResponse};
use cerebro_ingest::{
    HttpTransport, IngestConfig, SnapshotCache, TelemetryTransport, INGEST_FULL_NAME, INGEST_VERSION,
};

// ============================================================================
// CLI ARGUMENT PARSER
// ============================================================================

/// Cerebro Ingest CLI
#[derive(Parser, Debug)]
#[command(
    name = "cerebro-ingest",
    author = "AIOps Team",
    version,
    about = "Rate-limit aware telemetry ingestion for the Cerebro AIOps platform",
    long_about = "Cerebro Ingest pulls entity health metrics from the upstream telemetry \
                  API under strict admission control and keeps a periodically refreshed \
                  snapshot of them on disk for dashboards and analysis."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "cerebro-ingest.toml", env = "CEREBRO_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "CEREBRO_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long, env = "CEREBRO_DEBUG")]
    pub debug: bool,

    /// Subcommand to run (default: run)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Seed from disk and refresh in the background until SIGINT/SIGTERM
    Run,

    /// Run one refresh now and print the diagnosis
    Refresh,

    /// Print the diagnosis of the snapshot on disk, without network access
    Diagnose,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need logging or a runtime cache
    match &cli.command {
        Some(Commands::GenerateConfig { output }) => return handle_generate_config(output.as_deref()),
        Some(Commands::Validate { verbose }) => return handle_validate(&cli.config, *verbose),
        _ => {}
    }

    let config_found = cli.config.exists();
    let config = if config_found {
        IngestConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        IngestConfig::load_from_env().context("Failed to load config from environment")?
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    info!(target: "cerebro::init", version = INGEST_VERSION, "{} starting", INGEST_FULL_NAME);
    if !config_found {
        warn!(
            target: "cerebro::init",
            path = %cli.config.display(),
            "Config file not found, using defaults and environment"
        );
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_service(config).await,
        Commands::Refresh => handle_refresh(config).await,
        Commands::Diagnose => handle_diagnose(config),
        Commands::Validate { .. } | Commands::GenerateConfig { .. } => Ok(()),
    }
}

// ============================================================================
// COMMAND HANDLERS
// ============================================================================

async fn run_service(config: IngestConfig) -> AnyhowResult<()> {
    let cache = network_cache(&config)?;
    seed_from_disk(&cache);

    let shutdown = CancellationToken::new();
    let cycle = {
        let cache = Arc::clone(&cache);
        let shutdown = shutdown.clone();
        let interval = config.cache.refresh_interval;
        tokio::spawn(async move { cache.background_cycle(interval, shutdown).await })
    };

    wait_for_signal().await?;
    shutdown.cancel();
    cycle.await.context("Background refresh task failed")?;

    let diagnosis = cache.diagnose();
    info!(
        target: "cerebro::init",
        state = ?diagnosis.state,
        entities = diagnosis.total_entities,
        refreshes = diagnosis.refresh_count,
        failures = diagnosis.failure_count,
        "Shutdown complete"
    );
    Ok(())
}

async fn handle_refresh(config: IngestConfig) -> AnyhowResult<()> {
    let cache = network_cache(&config)?;
    seed_from_disk(&cache);

    let ok = cache.force_refresh().await;
    let diagnosis = cache.diagnose();
    println!("{}", serde_json::to_string_pretty(&diagnosis)?);

    if ok {
        Ok(())
    } else {
        Err(anyhow!(
            "Refresh failed: {}",
            diagnosis.last_error.unwrap_or_else(|| "unknown error".into())
        ))
    }
}

fn handle_diagnose(config: IngestConfig) -> AnyhowResult<()> {
    let cache = SnapshotCache::build(&config, Arc::new(OfflineTransport));
    seed_from_disk(&cache);
    println!("{}", serde_json::to_string_pretty(&cache.diagnose())?);
    Ok(())
}

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match IngestConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Endpoint: {}", config.upstream.endpoint);
            println!(
                "  • Credentials: {}",
                match config.validate_credentials() {
                    Ok(()) => "present".to_string(),
                    Err(e) => format!("incomplete ({})", e),
                }
            );
            println!(
                "  • Refresh interval: {}",
                humantime::format_duration(config.cache.refresh_interval)
            );
            println!(
                "  • Windows: {}",
                config
                    .catalog
                    .windows
                    .iter()
                    .map(|w| w.label())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            println!("  • Snapshot file: {}", config.cache.snapshot_path.display());
            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(e.into())
        }
    }
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config_str = IngestConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

// ============================================================================
// HELPERS
// ============================================================================

fn network_cache(config: &IngestConfig) -> AnyhowResult<Arc<SnapshotCache>> {
    config
        .validate_credentials()
        .context("Upstream credentials are required for network access")?;
    let transport = HttpTransport::new(&config.upstream)?;
    Ok(SnapshotCache::build(config, Arc::new(transport)))
}

/// An unreadable file is not fatal: the first refresh replaces it.
fn seed_from_disk(cache: &SnapshotCache) {
    if let Err(err) = cache.load_from_disk() {
        warn!(
            target: "cerebro::init",
            error = %err,
            "Ignoring unreadable snapshot file"
        );
    }
}

async fn wait_for_signal() -> AnyhowResult<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for SIGINT")?;
                info!(target: "cerebro::init", "Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!(target: "cerebro::init", "Received SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
        info!(target: "cerebro::init", "Received Ctrl-C");
    }

    Ok(())
}

/// Transport for commands that must not reach the upstream
#[derive(Debug)]
struct OfflineTransport;

#[async_trait]
impl TelemetryTransport for OfflineTransport {
    async fn post(
        &self,
        _envelope: &RequestEnvelope,
        _timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        Err(TransportError::Other("network access disabled for this command".into()))
    }
}
