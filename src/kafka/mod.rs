pub mod consumer;
pub mod producer;

pub use consumer::{EventSource, KafkaSource, SourcePoll};
pub use producer::{KafkaSink, RecordSink};

use rdkafka::client::{Client, ClientContext};
use rdkafka::config::ClientConfig;
use std::time::Duration;
use tracing::debug;

use crate::config::TlsConfig;
use crate::error::BusError;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Common client settings for either bus, with SSL when a bundle is given.
pub fn base_client_config(brokers: &str, tls: Option<&TlsConfig>) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", brokers);

    match tls {
        Some(tls) => {
            client_config
                .set("security.protocol", "SSL")
                .set("ssl.ca.location", tls.ca_location.display().to_string())
                .set("ssl.certificate.location", tls.certificate_location.display().to_string())
                .set("ssl.key.location", tls.key_location.display().to_string());
        }
        None => debug!("Kafka connection to {} does not require SSL", brokers),
    }

    client_config
}

/// Fails unless the cluster answers and knows `topic`.
pub fn verify_topic<C: ClientContext>(
    client: &Client<C>,
    topic: &str,
    brokers: &str,
) -> Result<(), BusError> {
    let metadata = client.fetch_metadata(Some(topic), METADATA_TIMEOUT)?;

    let known = metadata
        .topics()
        .iter()
        .any(|t| t.name() == topic && t.error().is_none() && !t.partitions().is_empty());

    if !known {
        return Err(BusError::TopicMissing {
            topic: topic.to_string(),
            brokers: brokers.to_string(),
        });
    }

    debug!("Topic {} available on {}", topic, brokers);
    Ok(())
}
