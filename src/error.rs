use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required property '{property}': {hint}")]
    Missing {
        property: &'static str,
        hint: &'static str,
    },

    #[error("Invalid value for '{property}': {hint}")]
    Invalid {
        property: &'static str,
        hint: String,
    },

    #[error("Unsupported configuration: {0}")]
    Unsupported(String),

    #[error("{what} file not found at {path}")]
    FileNotFound {
        what: &'static str,
        path: String,
    },

    #[error("{bus} SSL requested, but {what} file not found at {path}")]
    TlsFileMissing {
        bus: &'static str,
        what: &'static str,
        path: String,
    },

    #[error("Failed to read configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Failed to parse Avro schema {path}: {message}")]
    Schema {
        path: String,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Avro decode failed: {0}")]
    Avro(String),

    #[error("JSON decode failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Decoded event is not a record: {0}")]
    NotARecord(String),
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("HTTP transport error: {0}")]
    Transport(String),

    #[error("Collector rejected payload with status {status}: {message}")]
    Status {
        status: u16,
        message: String,
    },

    #[error("Kafka producer error: {0}")]
    Kafka(String),

    #[error("Kafka producer queue is full")]
    QueueFull,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Kafka client error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Topic '{topic}' not found on {brokers}")]
    TopicMissing {
        topic: String,
        brokers: String,
    },
}

impl PublishError {
    /// Every failure of a single POST attempt is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Transport(_) | PublishError::Status { .. })
    }
}
