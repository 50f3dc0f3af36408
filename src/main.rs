// ABOUTME: CLI entry point for change-relay
// ABOUTME: Loads configuration, wires the sync pipeline, and runs the daemon

use anyhow::Context;
use change_relay::config::SyncConfig;
use change_relay::sync::{
    preflight, AmqpPublisher, DaemonConfig, FileWatermarkStore, PostgresChangeReader, SyncDaemon,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "change-relay")]
#[command(about = "Replicates row-level database changes into a durable AMQP queue", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(
        long,
        short = 'c',
        env = "CHANGE_RELAY_CONFIG",
        default_value = "change-relay.toml"
    )]
    config: PathBuf,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the continuous sync loop until interrupted
    Run,
    /// Run a single sync cycle and exit (non-zero when any table failed)
    Once,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&cli.log)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = SyncConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;

    preflight(&config.database_url)
        .await
        .context("Source database preflight failed")?;

    let store = FileWatermarkStore::new(&config.state_dir)
        .await
        .context("Failed to open the watermark store")?;
    let reader = PostgresChangeReader::new(config.database_url.clone());
    let publisher = AmqpPublisher::new(config.amqp.uri(), config.amqp.queue.clone());

    tracing::info!(
        "Relaying {} tables from '{}' ({}) to queue '{}' at {}",
        config.tables.len(),
        config.source_database,
        config.location_code,
        config.amqp.queue,
        config.amqp.redacted_uri()
    );

    let daemon_config = DaemonConfig {
        sync_interval: Duration::from_secs(config.sync_interval_secs),
        staleness_policy: config.staleness_policy,
        tables: config.tables.clone(),
        provenance: config.provenance(),
    };
    let daemon = SyncDaemon::new(daemon_config, store, reader, publisher);

    daemon
        .initialize()
        .await
        .context("Failed to initialize watermarks")?;

    match cli.command {
        Commands::Once => {
            let stats = daemon.run_cycle().await;
            tracing::info!(
                "Cycle completed: {} tables, {} rows in {}ms",
                stats.tables_synced,
                stats.rows_published,
                stats.duration_ms
            );
            if !stats.is_success() {
                anyhow::bail!(
                    "{} of {} tables failed to sync",
                    stats.errors.len(),
                    config.tables.len()
                );
            }
        }
        Commands::Run => {
            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Ctrl-C received, requesting shutdown");
                    let _ = shutdown_tx.send(());
                }
            });
            daemon.run(shutdown_rx).await?;
        }
    }

    Ok(())
}
