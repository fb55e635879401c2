use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{debug, info};

use crate::config::TelemetryConfig;

/// Starts the Prometheus scrape endpoint when a listen address is set.
/// Without one the `metrics` macros are no-ops.
pub fn install(config: &TelemetryConfig) -> Result<()> {
    let Some(listen) = &config.prometheus_listen else {
        debug!("Prometheus exporter disabled");
        return Ok(());
    };

    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("Invalid telemetry.prometheus_listen address '{}'", listen))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    describe();
    info!("Prometheus metrics available at http://{}/metrics", addr);
    Ok(())
}

fn describe() {
    describe_counter!("mediator_records_enqueued_total", Unit::Count, "Records handed to the publisher");
    describe_counter!("mediator_decode_errors_total", Unit::Count, "Source messages that failed to decode");
    describe_counter!("mediator_translate_rejects_total", Unit::Count, "Decoded events dropped by translation");
    describe_counter!("mediator_queue_dropped_total", Unit::Count, "Records evicted from a full handoff queue");
    describe_counter!("mediator_publish_failures_total", Unit::Count, "Failed publish attempts");
    describe_counter!("mediator_batches_spilled_total", Unit::Count, "Batches written to the spool after retries ran out");
    describe_counter!("mediator_records_produced_total", Unit::Count, "Records accepted by the sink producer");
    describe_counter!("mediator_records_delivered_total", Unit::Count, "Records acknowledged by the sink bus");
    describe_counter!("mediator_delivery_failures_total", Unit::Count, "Records the sink bus failed to deliver");
    describe_gauge!("mediator_queue_depth", Unit::Count, "Handoff queue depth at the last report");
}
