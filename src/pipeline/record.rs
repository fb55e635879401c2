use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

/// One metric observation in the target products' schema.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMetricRecord {
    pub metric_name: String,
    pub value: f64,
    pub resource_id: String,
    pub attributes: BTreeMap<String, String>,
    pub tenant_id: String,
    pub timestamp_millis: i64,
}

impl NormalizedMetricRecord {
    pub fn accumulators(&self) -> Option<&str> {
        self.attributes.get("accumulators").map(String::as_str)
    }
}

struct SingleMetric<'a> {
    name: &'a str,
    value: f64,
}

impl Serialize for SingleMetric<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.name, &self.value)?;
        map.end()
    }
}

impl Serialize for NormalizedMetricRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("NormalizedMetricRecord", 5)?;
        state.serialize_field("attributes", &self.attributes)?;
        state.serialize_field(
            "metrics",
            &SingleMetric {
                name: &self.metric_name,
                value: self.value,
            },
        )?;
        state.serialize_field("timestamp", &self.timestamp_millis)?;
        state.serialize_field("tenantID", &self.tenant_id)?;
        state.serialize_field("resourceID", &self.resource_id)?;
        state.end()
    }
}

/// Transmission unit: `{"groups": [...]}`.
#[derive(Debug, Serialize)]
pub struct MetricGroup<'a> {
    pub groups: &'a [NormalizedMetricRecord],
}

impl<'a> MetricGroup<'a> {
    pub fn new(groups: &'a [NormalizedMetricRecord]) -> Self {
        Self { groups }
    }

    pub fn single(record: &'a NormalizedMetricRecord) -> Self {
        Self {
            groups: std::slice::from_ref(record),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Records awaiting one HTTP flush.
#[derive(Debug, Default)]
pub struct MetricBatch {
    records: Vec<NormalizedMetricRecord>,
}

impl MetricBatch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, record: NormalizedMetricRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        MetricGroup::new(&self.records).to_json()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
pub(crate) fn sample_record(name: &str, node: &str) -> NormalizedMetricRecord {
    let mut attributes = BTreeMap::new();
    attributes.insert("node".to_string(), node.to_string());
    attributes.insert("interface".to_string(), "eth0".to_string());
    attributes.insert("group".to_string(), "sevone".to_string());
    NormalizedMetricRecord {
        metric_name: name.to_string(),
        value: 1.5,
        resource_id: format!("{}:eth0", node),
        attributes,
        tenant_id: "tenant".to_string(),
        timestamp_millis: 1_700_000_000_000,
    }
}
