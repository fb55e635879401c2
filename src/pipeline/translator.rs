use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

use crate::config::{Config, SourceLayout, TimestampUnit};
use super::decoder::DecodedEvent;
use super::record::NormalizedMetricRecord;

const COMPONENT_TAG: &str = "KafkaSubcomponent";
const METRIC_TAG: &str = "KafkaMetric";

/// Settings the translator captures at construction.
#[derive(Debug, Clone)]
pub struct TranslationRules {
    pub layout: SourceLayout,
    pub timestamp_unit: TimestampUnit,
    pub ignored: HashSet<String>,
    pub counters: HashSet<String>,
    pub metric_group: String,
    pub tenant_id: String,
}

impl TranslationRules {
    pub fn from_config(config: &Config, tenant_id: String) -> Self {
        Self {
            layout: config.source.layout,
            timestamp_unit: config.source.timestamp_unit,
            ignored: config.metric_lists.ignored.clone(),
            counters: config.metric_lists.counters.clone(),
            metric_group: config.target.metric_group.clone(),
            tenant_id,
        }
    }
}

#[derive(Debug)]
pub struct Translator {
    rules: TranslationRules,
}

/// Why an event produced no record.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reject {
    MissingField(&'static str),
    Ignored,
    MissingTags,
    BadValue,
    BadTimestamp,
}

/// Fields of one event after layout-specific resolution.
struct Resolved {
    indicator: String,
    metric_name: String,
    node: String,
    component: String,
    component_key: &'static str,
}

impl Translator {
    pub fn new(rules: TranslationRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &TranslationRules {
        &self.rules
    }

    /// Maps one decoded event to at most one record. Never fails: any
    /// problem is logged and the event is dropped.
    pub fn translate(&self, event: &DecodedEvent) -> Option<NormalizedMetricRecord> {
        match self.try_translate(event) {
            Ok(record) => Some(record),
            Err(Reject::Ignored) => None,
            Err(Reject::MissingTags) => {
                warn!(
                    "Missing either the {} or {} tag, will not process metric: {}",
                    METRIC_TAG, COMPONENT_TAG, event
                );
                None
            }
            Err(reason) => {
                debug!("Will not process metric ({:?}): {}", reason, event);
                None
            }
        }
    }

    fn try_translate(&self, event: &DecodedEvent) -> Result<NormalizedMetricRecord, Reject> {
        let resolved = match self.rules.layout {
            SourceLayout::Sevone => resolve_sevone(event, &self.rules.ignored)?,
            SourceLayout::Zabbix => resolve_zabbix(event, &self.rules.ignored)?,
        };

        let value = event
            .get("value")
            .ok_or(Reject::MissingField("value"))
            .and_then(coerce_f64)?;

        let time_field = match self.rules.layout {
            SourceLayout::Sevone => "time",
            SourceLayout::Zabbix => "clock",
        };
        let timestamp_millis = event
            .get(time_field)
            .ok_or(Reject::MissingField("time"))
            .and_then(|raw| to_millis(raw, self.rules.timestamp_unit))?;

        let mut attributes = BTreeMap::new();
        attributes.insert("node".to_string(), resolved.node.clone());
        attributes.insert(resolved.component_key.to_string(), resolved.component.clone());
        attributes.insert("group".to_string(), self.rules.metric_group.clone());
        if self.rules.counters.contains(&resolved.indicator) {
            attributes.insert("accumulators".to_string(), resolved.indicator.clone());
        }

        Ok(NormalizedMetricRecord {
            metric_name: resolved.metric_name,
            value,
            resource_id: format!("{}:{}", resolved.node, resolved.component),
            attributes,
            tenant_id: self.rules.tenant_id.clone(),
            timestamp_millis,
        })
    }
}

fn resolve_sevone(event: &DecodedEvent, ignored: &HashSet<String>) -> Result<Resolved, Reject> {
    let indicator = event
        .get_str("indicatorName")
        .ok_or(Reject::MissingField("indicatorName"))?;
    if ignored.contains(indicator) {
        return Err(Reject::Ignored);
    }
    let node = event
        .get_str("deviceName")
        .ok_or(Reject::MissingField("deviceName"))?;
    let component = event
        .get_str("objectName")
        .ok_or(Reject::MissingField("objectName"))?;

    Ok(Resolved {
        indicator: indicator.to_string(),
        metric_name: indicator.to_string(),
        node: node.to_string(),
        component: component.to_string(),
        component_key: "interface",
    })
}

fn resolve_zabbix(event: &DecodedEvent, ignored: &HashSet<String>) -> Result<Resolved, Reject> {
    let indicator = event.get_str("name").ok_or(Reject::MissingField("name"))?;
    if ignored.contains(indicator) {
        return Err(Reject::Ignored);
    }
    let node = event
        .get_path(&["host", "host"])
        .and_then(Value::as_str)
        .ok_or(Reject::MissingField("host"))?;

    let tags = event
        .get("item_tags")
        .and_then(Value::as_array)
        .ok_or(Reject::MissingTags)?;
    let tag_value = |wanted: &str| {
        tags.iter()
            .filter(|tag| tag.get("tag").and_then(Value::as_str) == Some(wanted))
            .filter_map(|tag| tag.get("value").and_then(Value::as_str))
            .last()
    };
    let (Some(component), Some(metric_name)) = (tag_value(COMPONENT_TAG), tag_value(METRIC_TAG))
    else {
        return Err(Reject::MissingTags);
    };

    Ok(Resolved {
        indicator: indicator.to_string(),
        metric_name: metric_name.to_string(),
        node: node.to_string(),
        component: component.to_string(),
        component_key: "component",
    })
}

fn coerce_f64(value: &Value) -> Result<f64, Reject> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite()).ok_or(Reject::BadValue)
}

fn to_millis(value: &Value, unit: TimestampUnit) -> Result<i64, Reject> {
    let raw = coerce_f64(value).map_err(|_| Reject::BadTimestamp)?;
    let millis = match unit {
        TimestampUnit::Seconds => raw * 1000.0,
        TimestampUnit::Millis => raw,
    };
    if millis < 0.0 || millis > i64::MAX as f64 {
        return Err(Reject::BadTimestamp);
    }
    Ok(millis as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules(layout: SourceLayout) -> TranslationRules {
        TranslationRules {
            layout,
            timestamp_unit: TimestampUnit::Seconds,
            ignored: ["ignoredMetric".to_string()].into_iter().collect(),
            counters: ["ifInOctets".to_string()].into_iter().collect(),
            metric_group: "sevone".to_string(),
            tenant_id: "tenant-a".to_string(),
        }
    }

    fn sevone_event() -> serde_json::Map<String, Value> {
        json!({
            "deviceName": "router1",
            "objectName": "eth0",
            "indicatorName": "ifOutOctets",
            "value": "12.5",
            "time": 1_700_000_000i64
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn zabbix_event() -> serde_json::Map<String, Value> {
        json!({
            "name": "Interface eth0: Bits received",
            "host": {"host": "web1", "name": "Web 1"},
            "item_tags": [
                {"tag": "KafkaSubcomponent", "value": "eth0"},
                {"tag": "KafkaMetric", "value": "bitsIn"}
            ],
            "value": 1024,
            "clock": 1_700_000_000i64
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_sevone_well_formed_event() {
        let translator = Translator::new(rules(SourceLayout::Sevone));
        let record = translator.translate(&sevone_event().into()).unwrap();

        assert_eq!(record.metric_name, "ifOutOctets");
        assert_eq!(record.value, 12.5);
        assert_eq!(record.resource_id, "router1:eth0");
        assert_eq!(record.tenant_id, "tenant-a");
        assert_eq!(record.timestamp_millis, 1_700_000_000_000);
        assert_eq!(record.attributes["node"], "router1");
        assert_eq!(record.attributes["interface"], "eth0");
        assert_eq!(record.attributes["group"], "sevone");
        assert_eq!(record.accumulators(), None);
    }

    #[test]
    fn test_missing_any_required_field_yields_nothing() {
        let translator = Translator::new(rules(SourceLayout::Sevone));
        for field in ["indicatorName", "deviceName", "objectName", "value", "time"] {
            let mut event = sevone_event();
            event.remove(field);
            assert!(
                translator.translate(&event.into()).is_none(),
                "record built without {}",
                field
            );
        }
    }

    #[test]
    fn test_counter_metric_sets_accumulators() {
        let translator = Translator::new(rules(SourceLayout::Sevone));
        let mut event = sevone_event();
        event.insert("indicatorName".into(), json!("ifInOctets"));

        let record = translator.translate(&event.into()).unwrap();
        assert_eq!(record.accumulators(), Some("ifInOctets"));
    }

    #[test]
    fn test_ignored_metric_rejected() {
        let translator = Translator::new(rules(SourceLayout::Sevone));
        let mut event = sevone_event();
        event.insert("indicatorName".into(), json!("ignoredMetric"));
        assert!(translator.translate(&event.into()).is_none());
    }

    #[test]
    fn test_uncoercible_value_rejected() {
        let translator = Translator::new(rules(SourceLayout::Sevone));
        for bad in [json!("n/a"), json!(null), json!({"v": 1}), json!("NaN")] {
            let mut event = sevone_event();
            event.insert("value".into(), bad);
            assert!(translator.translate(&event.into()).is_none());
        }
    }

    #[test]
    fn test_timestamp_units() {
        let mut r = rules(SourceLayout::Sevone);
        let mut event = sevone_event();
        event.insert("time".into(), json!(1_700_000_000.25));
        let record = Translator::new(r.clone()).translate(&event.clone().into()).unwrap();
        assert_eq!(record.timestamp_millis, 1_700_000_000_250);

        r.timestamp_unit = TimestampUnit::Millis;
        event.insert("time".into(), json!(1_700_000_000_123i64));
        let record = Translator::new(r).translate(&event.into()).unwrap();
        assert_eq!(record.timestamp_millis, 1_700_000_000_123);
    }

    #[test]
    fn test_zabbix_event_uses_tags() {
        let translator = Translator::new(rules(SourceLayout::Zabbix));
        let record = translator.translate(&zabbix_event().into()).unwrap();

        assert_eq!(record.metric_name, "bitsIn");
        assert_eq!(record.value, 1024.0);
        assert_eq!(record.resource_id, "web1:eth0");
        assert_eq!(record.attributes["component"], "eth0");
        assert_eq!(record.timestamp_millis, 1_700_000_000_000);
    }

    #[test]
    fn test_zabbix_missing_tags_rejected() {
        let translator = Translator::new(rules(SourceLayout::Zabbix));

        let mut event = zabbix_event();
        event.insert(
            "item_tags".into(),
            json!([{"tag": "KafkaSubcomponent", "value": "eth0"}]),
        );
        assert!(translator.translate(&event.into()).is_none());

        let mut event = zabbix_event();
        event.remove("item_tags");
        assert!(translator.translate(&event.into()).is_none());

        let mut event = zabbix_event();
        event.insert("host".into(), json!({"name": "no host key"}));
        assert!(translator.translate(&event.into()).is_none());
    }

    #[test]
    fn test_zabbix_counter_uses_indicator_name() {
        let mut r = rules(SourceLayout::Zabbix);
        r.counters.insert("Interface eth0: Bits received".to_string());
        let record = Translator::new(r).translate(&zabbix_event().into()).unwrap();
        assert_eq!(record.accumulators(), Some("Interface eth0: Bits received"));
    }
}
