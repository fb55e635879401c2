use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod ingest;
mod kafka;
mod lifecycle;
mod pipeline;
mod publisher;
mod telemetry;

use crate::config::Config;
use crate::ingest::{IngestExit, IngestLoop};
use crate::kafka::KafkaSource;
use crate::lifecycle::{ConfigSlot, Lifecycle};
use crate::pipeline::{Decoder, HandoffQueue, StatsRecorder, StatsReporter};
use crate::publisher::Publisher;

#[derive(Parser)]
#[command(name = "metric-mediator")]
#[command(about = "Relays metric events from a Kafka topic to a Kafka sink or a batched HTTP collector")]
struct Cli {
    #[arg(short, long, default_value = "conf/mediator.toml")]
    config: PathBuf,

    /// Used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = Config::load(&cli.config)
        .with_context(|| format!("Invalid configuration in {}", cli.config.display()))?;

    if cli.check {
        check_config(&config)
            .with_context(|| format!("Invalid configuration in {}", cli.config.display()))?;
        info!("Configuration {} is valid", cli.config.display());
        return Ok(());
    }

    info!("Starting metric mediator");

    match run(config, cli.config).await? {
        IngestExit::CircuitOpen => {
            anyhow::bail!("Stopped after repeated source bus errors")
        }
        IngestExit::Shutdown | IngestExit::QueueClosed => {
            info!("Metric mediator stopped");
            Ok(())
        }
    }
}

/// Builds everything `run` derives from the file without touching the buses.
fn check_config(config: &Config) -> Result<()> {
    Decoder::from_config(&config.source).context("Failed to build source decoder")?;
    config.tenant_id()?;
    config.publish_target()?;
    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: Config, config_path: PathBuf) -> Result<IngestExit> {
    telemetry::install(&config.telemetry)?;

    let decoder = Decoder::from_config(&config.source).context("Failed to build source decoder")?;
    let tenant_id = config.tenant_id()?;
    let target = config.publish_target()?;

    let queue = Arc::new(HandoffQueue::from_config(&config.queue));
    let publisher = Publisher::build(&target, Arc::clone(&queue))?;
    let batch_gauge = publisher.in_flight_gauge();

    let source = KafkaSource::connect(&config.source).with_context(|| {
        format!("Failed to connect to source Kafka at {}", config.source.brokers)
    })?;

    let stats = StatsRecorder::new();
    let reporter = StatsReporter::new(
        config.stats.clone(),
        stats.clone(),
        Arc::clone(&queue),
        batch_gauge,
    );

    let settings = Arc::new(ConfigSlot::new(config, config_path));
    let lifecycle = Lifecycle::new(Arc::clone(&settings));
    let shutdown = lifecycle.shutdown_token();

    let mut ingest = IngestLoop::new(
        source,
        decoder,
        tenant_id,
        Arc::clone(&queue),
        stats,
        settings,
    );

    let signal_handle = tokio::spawn(lifecycle.clone().watch_signals());
    let publisher_name = publisher.name();
    let publisher_handle = tokio::spawn(publisher.run());
    let stats_handle = tokio::spawn(reporter.run(shutdown.clone()));
    let ingest_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { ingest.run(shutdown).await }
    });

    info!("All tasks started, {} publisher active", publisher_name);

    let joined = ingest_handle.await;
    lifecycle.request_shutdown(match &joined {
        Ok(IngestExit::Shutdown) => "ingest loop stopped",
        Ok(IngestExit::CircuitOpen) => "source bus circuit breaker",
        Ok(IngestExit::QueueClosed) => "handoff queue closed",
        Err(_) => "ingest task failed",
    });
    queue.close();

    if let Err(e) = publisher_handle.await {
        warn!("Publisher task failed: {}", e);
    }
    if let Err(e) = stats_handle.await {
        warn!("Statistics task failed: {}", e);
    }
    if let Err(e) = signal_handle.await {
        warn!("Signal task failed: {}", e);
    }

    joined.context("Ingest task failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_check_rejects_unparsable_schema() {
        let dir = tempfile::tempdir().unwrap();
        let schema = dir.path().join("schema.json");
        fs::write(&schema, "{ this is not a schema").unwrap();

        let toml = format!(
            r#"
            [source]
            brokers = "localhost:9092"
            format = "avro"
            schema_path = "{}"

            [target]
            product = "pi"
            publish = "rest"
            tenant_id = "pi-tenant"

            [target.rest]
            protocol = "http"
            host = "collector"
            port = 8080
            "#,
            schema.display()
        );
        let config = Config::from_toml_str(&toml).unwrap();
        assert!(check_config(&config).is_err());

        fs::copy("conf/sevone-avro-schema.json", &schema).unwrap();
        assert!(check_config(&config).is_ok());
    }
}
