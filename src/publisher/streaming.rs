use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::PublishError;
use crate::kafka::RecordSink;
use crate::pipeline::{HandoffQueue, MetricGroup, NormalizedMetricRecord};

const RECORD_KEY: &str = "key";
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(100);
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Forwards each record as its own single-record group to the sink bus.
/// Delivery failures surface through the producer's callback only.
pub struct StreamingPublisher<S> {
    sink: S,
    queue: Arc<HandoffQueue<NormalizedMetricRecord>>,
}

impl<S: RecordSink + 'static> StreamingPublisher<S> {
    pub fn new(sink: S, queue: Arc<HandoffQueue<NormalizedMetricRecord>>) -> Self {
        Self { sink, queue }
    }

    pub async fn run(self) {
        info!("Streaming publisher started");
        let mut forwarded: u64 = 0;

        while let Some(record) = self.queue.pop().await {
            match MetricGroup::single(&record).to_json() {
                Ok(payload) => {
                    if self.produce(&payload).await.is_ok() {
                        forwarded += 1;
                    }
                }
                Err(e) => error!("Failed to serialize record {}: {}", record.resource_id, e),
            }
            self.sink.poll_deliveries(Duration::ZERO);
        }

        info!("Streaming publisher draining after {} records", forwarded);
        let mut sink = self.sink;
        if let Err(e) =
            tokio::task::spawn_blocking(move || sink.close(CLOSE_FLUSH_TIMEOUT)).await
        {
            error!("Sink close task failed: {}", e);
        }
        info!("Streaming publisher stopped");
    }

    async fn produce(&self, payload: &[u8]) -> Result<(), PublishError> {
        loop {
            match self.sink.produce(RECORD_KEY, payload) {
                Err(PublishError::QueueFull) => {
                    debug!("Producer queue full, waiting for deliveries");
                    self.sink.poll_deliveries(Duration::ZERO);
                    tokio::time::sleep(QUEUE_FULL_BACKOFF).await;
                }
                Err(e) => {
                    metrics::counter!("mediator_publish_failures_total").increment(1);
                    warn!("Failed to produce record: {}", e);
                    return Err(e);
                }
                Ok(()) => {
                    metrics::counter!("mediator_records_produced_total").increment(1);
                    return Ok(());
                }
            }
        }
    }
}
