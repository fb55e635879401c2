use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::Message;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{SourceConfig, WireFormat};
use crate::error::BusError;
use crate::pipeline::RawEvent;
use super::{base_client_config, verify_topic};

/// Outcome of one bounded poll of the source bus.
#[derive(Debug)]
pub enum SourcePoll {
    Message(RawEvent),
    Timeout,
    EndOfPartition(i32),
    Error(String),
}

#[async_trait]
pub trait EventSource: Send {
    async fn poll(&mut self, timeout: Duration) -> SourcePoll;

    fn commit(&mut self) -> Result<(), BusError>;

    /// Releases the client. Later polls report an error.
    fn close(&mut self);
}

pub struct KafkaSource {
    consumer: Option<StreamConsumer>,
    format: WireFormat,
    topic: String,
}

impl KafkaSource {
    pub fn connect(config: &SourceConfig) -> Result<Self, BusError> {
        let mut client_config = base_client_config(&config.brokers, config.tls.as_ref());
        client_config
            .set("group.id", &config.group_id)
            .set("client.id", "metric-mediator-consumer")
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "true")
            .set("session.timeout.ms", "6000")
            .set("socket.timeout.ms", "3000")
            .set("auto.offset.reset", "latest");

        let consumer: StreamConsumer = client_config.create()?;

        verify_topic(consumer.client(), &config.topic, &config.brokers)?;
        consumer.subscribe(&[config.topic.as_str()])?;

        info!("Subscribed to source topic {} on {}", config.topic, config.brokers);

        Ok(Self {
            consumer: Some(consumer),
            format: config.format,
            topic: config.topic.clone(),
        })
    }
}

#[async_trait]
impl EventSource for KafkaSource {
    async fn poll(&mut self, timeout: Duration) -> SourcePoll {
        let Some(consumer) = &self.consumer else {
            return SourcePoll::Error("source consumer is closed".to_string());
        };

        match tokio::time::timeout(timeout, consumer.recv()).await {
            Err(_) => SourcePoll::Timeout,
            Ok(Ok(message)) => SourcePoll::Message(RawEvent {
                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                format: self.format,
                broker_timestamp: message.timestamp().to_millis(),
            }),
            Ok(Err(KafkaError::PartitionEOF(partition))) => SourcePoll::EndOfPartition(partition),
            Ok(Err(e)) => SourcePoll::Error(e.to_string()),
        }
    }

    fn commit(&mut self) -> Result<(), BusError> {
        if let Some(consumer) = &self.consumer {
            consumer.commit_consumer_state(CommitMode::Async)?;
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
            debug!("Source consumer for {} closed", self.topic);
        }
    }
}
