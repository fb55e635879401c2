pub mod batch;
pub mod http;
pub mod spool;
pub mod streaming;

pub use batch::{retry_publish, BatchHttpPublisher, PublishOutcome, RetryPolicy};
pub use http::{HttpCollector, PayloadSender};
pub use streaming::StreamingPublisher;

use anyhow::{Context, Result};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tracing::info;

use crate::config::PublishTarget;
use crate::kafka::KafkaSink;
use crate::pipeline::{HandoffQueue, NormalizedMetricRecord};

/// Downstream strategy, fixed for the life of the process.
pub enum Publisher {
    Streaming(StreamingPublisher<KafkaSink>),
    BatchHttp(BatchHttpPublisher<HttpCollector>),
}

impl Publisher {
    pub fn build(
        target: &PublishTarget,
        queue: Arc<HandoffQueue<NormalizedMetricRecord>>,
    ) -> Result<Self> {
        match target {
            PublishTarget::Kafka(sink_config) => {
                let sink = KafkaSink::connect(sink_config).with_context(|| {
                    format!("Failed to connect to sink Kafka at {}", sink_config.brokers)
                })?;
                info!("Publishing to Kafka topic {}", sink_config.topic);
                Ok(Publisher::Streaming(StreamingPublisher::new(sink, queue)))
            }
            PublishTarget::Rest(rest) => {
                let collector = HttpCollector::new(rest)
                    .with_context(|| format!("Failed to build HTTP client for {}", rest.url))?;
                info!("Publishing in batches to {}", rest.url);
                Ok(Publisher::BatchHttp(BatchHttpPublisher::new(collector, rest, queue)))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Publisher::Streaming(_) => "streaming",
            Publisher::BatchHttp(_) => "batch-http",
        }
    }

    /// Records held in an unflushed batch; only the HTTP strategy batches.
    pub fn in_flight_gauge(&self) -> Option<Arc<AtomicUsize>> {
        match self {
            Publisher::Streaming(_) => None,
            Publisher::BatchHttp(publisher) => Some(publisher.in_flight_gauge()),
        }
    }

    /// Runs until the queue is closed and drained.
    pub async fn run(self) {
        match self {
            Publisher::Streaming(publisher) => publisher.run().await,
            Publisher::BatchHttp(publisher) => publisher.run().await,
        }
    }
}
