use apache_avro::Schema;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::io::Cursor;
use tracing::{debug, info};

use crate::config::{SourceConfig, WireFormat};
use crate::error::{ConfigError, DecodeError};

/// Bytes of one source-bus message, tagged with the format they were
/// published in.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub payload: Vec<u8>,
    pub format: WireFormat,
    pub broker_timestamp: Option<i64>,
}

impl RawEvent {
    pub fn new(payload: Vec<u8>, format: WireFormat) -> Self {
        Self {
            payload,
            format,
            broker_timestamp: None,
        }
    }

    /// Broker timestamp as UTC text, or `"unknown"` when the bus gave none.
    pub fn broker_time(&self) -> String {
        self.broker_timestamp
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// A decoded source event: named fields to scalar or nested values.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent(Map<String, Value>);

impl DecodedEvent {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Walks nested objects, e.g. `["host", "host"]`.
    pub fn get_path(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        rest.iter()
            .try_fold(self.0.get(*first)?, |value, key| value.get(key))
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }
}

impl From<Map<String, Value>> for DecodedEvent {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for DecodedEvent {
    type Error = DecodeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(DecodeError::NotARecord(other.to_string())),
        }
    }
}

impl fmt::Display for DecodedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

/// Wire-format decoder, chosen once at startup.
#[derive(Debug)]
pub enum Decoder {
    Avro(Schema),
    Json,
}

impl Decoder {
    /// Builds the decoder for the configured format. An unreadable or
    /// unparsable Avro schema is a startup error.
    pub fn from_config(config: &SourceConfig) -> Result<Self, ConfigError> {
        match config.format {
            WireFormat::Json => {
                info!("Source data format is JSON");
                Ok(Decoder::Json)
            }
            WireFormat::Avro => {
                let path = config.schema_path.display().to_string();
                let definition = fs::read_to_string(&config.schema_path).map_err(|_| {
                    ConfigError::FileNotFound {
                        what: "Avro schema",
                        path: path.clone(),
                    }
                })?;
                let decoder = Self::avro_from_str(&definition).map_err(|e| match e {
                    ConfigError::Schema { message, .. } => ConfigError::Schema { path, message },
                    other => other,
                })?;
                info!("Avro schema parsed successfully from {}", config.schema_path.display());
                Ok(decoder)
            }
        }
    }

    pub fn avro_from_str(definition: &str) -> Result<Self, ConfigError> {
        Schema::parse_str(definition)
            .map(Decoder::Avro)
            .map_err(|e| ConfigError::Schema {
                path: "<inline>".to_string(),
                message: e.to_string(),
            })
    }

    pub fn format(&self) -> WireFormat {
        match self {
            Decoder::Avro(_) => WireFormat::Avro,
            Decoder::Json => WireFormat::Json,
        }
    }

    pub fn decode(&self, raw: &RawEvent) -> Result<DecodedEvent, DecodeError> {
        if raw.format != self.format() {
            return Err(DecodeError::NotARecord(format!(
                "event tagged {:?} but decoder expects {:?}",
                raw.format,
                self.format()
            )));
        }

        let value = match self {
            Decoder::Avro(schema) => {
                let mut reader = Cursor::new(raw.payload.as_slice());
                let datum = apache_avro::from_avro_datum(schema, &mut reader, None)
                    .map_err(|e| DecodeError::Avro(e.to_string()))?;
                Value::try_from(datum).map_err(|e| DecodeError::Avro(e.to_string()))?
            }
            Decoder::Json => serde_json::from_slice::<Value>(&raw.payload)?,
        };

        debug!("Decoded event: {}", value);
        DecodedEvent::try_from(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apache_avro::types::Record;
    use serde_json::json;

    const SEVONE_SCHEMA: &str = r#"{
        "type": "record",
        "name": "SevOneMetric",
        "fields": [
            {"name": "deviceName", "type": "string"},
            {"name": "objectName", "type": "string"},
            {"name": "indicatorName", "type": "string"},
            {"name": "value", "type": "string"},
            {"name": "time", "type": "long"}
        ]
    }"#;

    fn avro_bytes(schema: &Schema) -> Vec<u8> {
        let mut record = Record::new(schema).unwrap();
        record.put("deviceName", "router1");
        record.put("objectName", "eth0");
        record.put("indicatorName", "ifInOctets");
        record.put("value", "42.5");
        record.put("time", 1_700_000_000i64);
        apache_avro::to_avro_datum(schema, record).unwrap()
    }

    #[test]
    fn test_avro_decode_yields_record_fields() {
        let decoder = Decoder::avro_from_str(SEVONE_SCHEMA).unwrap();
        let schema = match &decoder {
            Decoder::Avro(schema) => schema.clone(),
            Decoder::Json => unreachable!(),
        };

        let event = decoder
            .decode(&RawEvent::new(avro_bytes(&schema), WireFormat::Avro))
            .unwrap();
        assert_eq!(event.get_str("deviceName"), Some("router1"));
        assert_eq!(event.get_str("value"), Some("42.5"));
        assert_eq!(event.get("time"), Some(&json!(1_700_000_000i64)));
    }

    #[test]
    fn test_broker_time_formatting() {
        let mut raw = RawEvent::new(b"{}".to_vec(), WireFormat::Json);
        assert_eq!(raw.broker_time(), "unknown");

        raw.broker_timestamp = Some(1_700_000_000_123);
        assert_eq!(raw.broker_time(), "2023-11-14 22:13:20.123 UTC");
    }

    #[test]
    fn test_avro_garbage_is_decode_error() {
        let decoder = Decoder::avro_from_str(SEVONE_SCHEMA).unwrap();
        let result = decoder.decode(&RawEvent::new(vec![0xff], WireFormat::Avro));
        assert!(matches!(result, Err(DecodeError::Avro(_))));
    }

    #[test]
    fn test_malformed_schema_is_config_error() {
        let result = Decoder::avro_from_str("{\"type\": \"record\"");
        assert!(matches!(result, Err(ConfigError::Schema { .. })));
    }

    #[test]
    fn test_json_decode_and_nested_path() {
        let payload = br#"{"name":"cpu","host":{"host":"web1"},"value":"3","clock":1700000000}"#;
        let event = Decoder::Json
            .decode(&RawEvent::new(payload.to_vec(), WireFormat::Json))
            .unwrap();
        assert_eq!(event.get_path(&["host", "host"]), Some(&json!("web1")));
        assert_eq!(event.get_path(&["host", "missing"]), None);
    }

    #[test]
    fn test_json_errors() {
        let invalid = Decoder::Json.decode(&RawEvent::new(b"{not json".to_vec(), WireFormat::Json));
        assert!(matches!(invalid, Err(DecodeError::Json(_))));

        let scalar = Decoder::Json.decode(&RawEvent::new(b"42".to_vec(), WireFormat::Json));
        assert!(matches!(scalar, Err(DecodeError::NotARecord(_))));
    }
}
