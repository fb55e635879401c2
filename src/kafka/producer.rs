use rdkafka::client::ClientContext;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{BaseProducer, BaseRecord, DeliveryResult, Producer, ProducerContext};
use rdkafka::Message;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::SinkKafkaConfig;
use crate::error::{BusError, PublishError};
use super::{base_client_config, verify_topic};

/// Fire-and-forget producer to the sink bus.
pub trait RecordSink: Send {
    fn produce(&self, key: &str, payload: &[u8]) -> Result<(), PublishError>;

    /// Serves delivery callbacks for up to `timeout`.
    fn poll_deliveries(&self, timeout: Duration);

    /// Flushes outstanding messages and releases the client.
    fn close(&mut self, timeout: Duration);
}

/// Logs delivery failures; the client's own retry settings apply before that.
pub struct DeliveryLogger;

impl ClientContext for DeliveryLogger {}

impl ProducerContext for DeliveryLogger {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _opaque: Self::DeliveryOpaque) {
        match result {
            Ok(_) => {
                metrics::counter!("mediator_records_delivered_total").increment(1);
            }
            Err((e, message)) => {
                metrics::counter!("mediator_delivery_failures_total").increment(1);
                error!(
                    "Failed to deliver message to {} [{}]: {}",
                    message.topic(),
                    message.partition(),
                    e
                );
            }
        }
    }
}

pub struct KafkaSink {
    producer: Option<BaseProducer<DeliveryLogger>>,
    topic: String,
}

impl KafkaSink {
    pub fn connect(config: &SinkKafkaConfig) -> Result<Self, BusError> {
        let producer: BaseProducer<DeliveryLogger> =
            base_client_config(&config.brokers, config.tls.as_ref())
                .set("client.id", "metric-mediator-producer")
                .set("message.timeout.ms", "5000")
                .set("queue.buffering.max.messages", "100000")
                .set("queue.buffering.max.ms", "5")
                .set("batch.num.messages", "1000")
                .create_with_context(DeliveryLogger)?;

        verify_topic(producer.client(), &config.topic, &config.brokers)?;
        info!("Sink topic {} available on {}", config.topic, config.brokers);

        Ok(Self {
            producer: Some(producer),
            topic: config.topic.clone(),
        })
    }
}

impl RecordSink for KafkaSink {
    fn produce(&self, key: &str, payload: &[u8]) -> Result<(), PublishError> {
        let producer = self
            .producer
            .as_ref()
            .ok_or_else(|| PublishError::Kafka("sink producer is closed".to_string()))?;

        let record = BaseRecord::to(&self.topic).key(key).payload(payload);
        match producer.send(record) {
            Ok(()) => Ok(()),
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                Err(PublishError::QueueFull)
            }
            Err((e, _)) => Err(PublishError::Kafka(e.to_string())),
        }
    }

    fn poll_deliveries(&self, timeout: Duration) {
        if let Some(producer) = &self.producer {
            producer.poll(timeout);
        }
    }

    fn close(&mut self, timeout: Duration) {
        if let Some(producer) = self.producer.take() {
            if let Err(e) = producer.flush(timeout) {
                error!("Failed to flush sink producer: {}", e);
            }
            debug!("Sink producer for {} closed", self.topic);
        }
    }
}
