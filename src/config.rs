use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::ConfigError;

/// Tenant the AIOps metric API expects unless told otherwise.
pub const DEFAULT_AIOPS_TENANT: &str = "cfd95b7e-3bc7-4006-a4a8-a73a79c71255";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub source: SourceConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub lists: ListsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(skip)]
    pub metric_lists: MetricLists,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub brokers: String,
    #[serde(default = "default_source_topic")]
    pub topic: String,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default)]
    pub format: WireFormat,
    #[serde(default = "default_schema_path")]
    pub schema_path: PathBuf,
    #[serde(default)]
    pub layout: SourceLayout,
    #[serde(default)]
    pub timestamp_unit: TimestampUnit,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_commit_interval_secs")]
    pub commit_interval_secs: u64,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Avro,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceLayout {
    #[default]
    Sevone,
    Zabbix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampUnit {
    #[default]
    Seconds,
    Millis,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    pub ca_location: PathBuf,
    pub certificate_location: PathBuf,
    pub key_location: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductTarget {
    Pi,
    Aiops,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    Kafka,
    Rest,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    pub product: Option<ProductTarget>,
    pub publish: Option<PublishMode>,
    pub tenant_id: Option<String>,
    #[serde(default = "default_metric_group")]
    pub metric_group: String,
    pub kafka: Option<SinkKafkaConfig>,
    #[serde(default)]
    pub rest: RestConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SinkKafkaConfig {
    #[serde(default)]
    pub brokers: String,
    #[serde(default)]
    pub topic: String,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RestConfig {
    pub protocol: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub route: Option<String>,
    #[serde(default)]
    pub authentication: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub user: Option<String>,
    pub api_key: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_period_secs")]
    pub flush_period_secs: u64,
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    Block,
    DropOldest,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub policy: OverflowPolicy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatsConfig {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u32,
    #[serde(default)]
    pub log_unique_indicators: bool,
    #[serde(default)]
    pub log_unique_resources: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListsConfig {
    #[serde(default = "default_ignore_file")]
    pub ignore_file: PathBuf,
    #[serde(default = "default_counter_file")]
    pub counter_file: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TelemetryConfig {
    pub prometheus_listen: Option<String>,
}

/// Indicator names loaded from the ignore and counter list files.
#[derive(Debug, Clone, Default)]
pub struct MetricLists {
    pub ignored: HashSet<String>,
    pub counters: HashSet<String>,
}

/// Fully resolved publishing strategy.
#[derive(Debug, Clone)]
pub enum PublishTarget {
    Kafka(SinkKafkaConfig),
    Rest(RestTarget),
}

#[derive(Debug, Clone)]
pub struct RestTarget {
    pub url: String,
    pub product: ProductTarget,
    pub tenant_id: String,
    pub auth: RestAuth,
    pub batch_size: usize,
    pub flush_period: Duration,
    pub retry_base_delay: Duration,
    pub max_attempts: u32,
    pub request_timeout: Duration,
    pub accept_invalid_certs: bool,
    pub spool_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestAuth {
    None,
    Basic { username: String, password: String },
    ZenApiKey { user: String, api_key: String },
}

fn default_source_topic() -> String { "sdb".to_string() }
fn default_group_id() -> String { "waiopsMetric-Restgroup".to_string() }
fn default_schema_path() -> PathBuf { PathBuf::from("conf/sevone-avro-schema.json") }
fn default_poll_timeout_ms() -> u64 { 100 }
fn default_commit_interval_secs() -> u64 { 5 }
fn default_max_consecutive_errors() -> u32 { 500 }
fn default_metric_group() -> String { "sevone".to_string() }
fn default_batch_size() -> usize { 10_000 }
fn default_flush_period_secs() -> u64 { 60 }
fn default_retry_base_delay_secs() -> u64 { 3 }
fn default_max_attempts() -> u32 { 4 }
fn default_request_timeout_secs() -> u64 { 30 }
fn default_spool_dir() -> PathBuf { PathBuf::from("log") }
fn default_queue_capacity() -> usize { 100_000 }
fn default_interval_minutes() -> u32 { 5 }
fn default_ignore_file() -> PathBuf { PathBuf::from("conf/metrics-ignore.conf") }
fn default_counter_file() -> PathBuf { PathBuf::from("conf/counter-metrics.conf") }

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            protocol: None,
            host: None,
            port: None,
            route: None,
            authentication: false,
            username: None,
            password: None,
            user: None,
            api_key: None,
            batch_size: default_batch_size(),
            flush_period_secs: default_flush_period_secs(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            max_attempts: default_max_attempts(),
            request_timeout_secs: default_request_timeout_secs(),
            accept_invalid_certs: false,
            spool_dir: default_spool_dir(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            policy: OverflowPolicy::default(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            log_unique_indicators: false,
            log_unique_resources: false,
        }
    }
}

impl Default for ListsConfig {
    fn default() -> Self {
        Self {
            ignore_file: default_ignore_file(),
            counter_file: default_counter_file(),
        }
    }
}

impl Config {
    /// Loads the TOML file, applies `MEDIATOR__SECTION__KEY` environment
    /// overrides, validates the result and reads the metric list files.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                what: "Configuration",
                path: path.display().to_string(),
            });
        }

        let layered = ::config::Config::builder()
            .add_source(::config::File::from(path.to_path_buf()).format(::config::FileFormat::Toml))
            .add_source(
                ::config::Environment::with_prefix("MEDIATOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = layered.try_deserialize()?;
        config.finish()?;
        Ok(config)
    }

    #[cfg(test)]
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content).map_err(|e| ConfigError::Invalid {
            property: "configuration",
            hint: e.to_string(),
        })?;
        config.finish()?;
        Ok(config)
    }

    fn finish(&mut self) -> Result<(), ConfigError> {
        self.validate()?;
        self.metric_lists = MetricLists {
            ignored: load_list(&self.lists.ignore_file)?,
            counters: load_list(&self.lists.counter_file)?,
        };

        info!("Metrics to be ignored: {:?}", self.metric_lists.ignored);
        info!("Counter/pegged metrics: {:?}", self.metric_lists.counters);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.brokers.trim().is_empty() {
            return Err(ConfigError::Missing {
                property: "source.brokers",
                hint: "specify at least one source Kafka broker, e.g. \"kafka1:9092,kafka2:9092\"",
            });
        }

        if self.source.format == WireFormat::Avro && !self.source.schema_path.exists() {
            return Err(ConfigError::FileNotFound {
                what: "Avro schema",
                path: self.source.schema_path.display().to_string(),
            });
        }

        if let Some(tls) = &self.source.tls {
            tls.validate("Source Kafka")?;
        }

        if self.stats.interval_minutes == 0 {
            return Err(ConfigError::Invalid {
                property: "stats.interval_minutes",
                hint: "must be a whole number of minutes, at least 1".to_string(),
            });
        }

        if self.queue.capacity == 0 {
            return Err(ConfigError::Invalid {
                property: "queue.capacity",
                hint: "must be greater than 0".to_string(),
            });
        }

        if self.source.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                property: "source.poll_timeout_ms",
                hint: "must be greater than 0".to_string(),
            });
        }

        self.publish_target().map(|_| ())
    }

    pub fn product(&self) -> Result<ProductTarget, ConfigError> {
        self.target.product.ok_or(ConfigError::Missing {
            property: "target.product",
            hint: "must be \"pi\" for Predictive Insights or \"aiops\" for Watson AIOps",
        })
    }

    pub fn publish_mode(&self) -> Result<PublishMode, ConfigError> {
        let product = self.product()?;
        match (product, self.target.publish) {
            (ProductTarget::Aiops, Some(PublishMode::Kafka)) => Err(ConfigError::Unsupported(
                "publish = \"kafka\" with product = \"aiops\"; aiops requires publish = \"rest\"".to_string(),
            )),
            (ProductTarget::Aiops, None) => {
                info!("target.publish not set but product is 'aiops', defaulting to 'rest'");
                Ok(PublishMode::Rest)
            }
            (ProductTarget::Pi, None) => Err(ConfigError::Missing {
                property: "target.publish",
                hint: "must be \"kafka\" or \"rest\"",
            }),
            (_, Some(mode)) => Ok(mode),
        }
    }

    pub fn tenant_id(&self) -> Result<String, ConfigError> {
        match (self.product()?, &self.target.tenant_id) {
            (ProductTarget::Aiops, Some(tenant)) => {
                if tenant != DEFAULT_AIOPS_TENANT {
                    warn!("AIOps tenant id {} is not the default tenant id", tenant);
                }
                Ok(tenant.clone())
            }
            (ProductTarget::Aiops, None) => {
                debug!("target.tenant_id not set, using default AIOps tenant");
                Ok(DEFAULT_AIOPS_TENANT.to_string())
            }
            (ProductTarget::Pi, Some(tenant)) if !tenant.is_empty() => Ok(tenant.clone()),
            (ProductTarget::Pi, _) => Err(ConfigError::Missing {
                property: "target.tenant_id",
                hint: "set it to the Predictive Insights topic name",
            }),
        }
    }

    pub fn publish_target(&self) -> Result<PublishTarget, ConfigError> {
        let product = self.product()?;
        let tenant_id = self.tenant_id()?;

        match self.publish_mode()? {
            PublishMode::Kafka => {
                let kafka = self.target.kafka.clone().ok_or(ConfigError::Missing {
                    property: "target.kafka",
                    hint: "add a [target.kafka] table with brokers and topic",
                })?;
                if kafka.brokers.trim().is_empty() {
                    return Err(ConfigError::Missing {
                        property: "target.kafka.brokers",
                        hint: "specify at least one sink Kafka broker",
                    });
                }
                if kafka.topic.trim().is_empty() {
                    return Err(ConfigError::Missing {
                        property: "target.kafka.topic",
                        hint: "specify the sink topic name",
                    });
                }
                if let Some(tls) = &kafka.tls {
                    tls.validate("Sink Kafka")?;
                }
                Ok(PublishTarget::Kafka(kafka))
            }
            PublishMode::Rest => {
                let rest = &self.target.rest;
                let (url, auth) = match product {
                    ProductTarget::Pi => (rest.pi_url()?, rest.basic_auth()?),
                    ProductTarget::Aiops => (rest.aiops_url()?, rest.zen_auth()?),
                };
                rest.validate_thresholds()?;

                Ok(PublishTarget::Rest(RestTarget {
                    url,
                    product,
                    tenant_id,
                    auth,
                    batch_size: rest.batch_size,
                    flush_period: Duration::from_secs(rest.flush_period_secs),
                    retry_base_delay: Duration::from_secs(rest.retry_base_delay_secs),
                    max_attempts: rest.max_attempts,
                    request_timeout: Duration::from_secs(rest.request_timeout_secs),
                    accept_invalid_certs: rest.accept_invalid_certs,
                    spool_dir: rest.spool_dir.clone(),
                }))
            }
        }
    }
}

impl SourceConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_secs(self.commit_interval_secs)
    }
}

impl StatsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.interval_minutes) * 60)
    }
}

impl RestConfig {
    fn pi_url(&self) -> Result<String, ConfigError> {
        let protocol = self.protocol.as_deref().unwrap_or_default().to_lowercase();
        if protocol != "http" && protocol != "https" {
            return Err(ConfigError::Invalid {
                property: "target.rest.protocol",
                hint: "must be \"http\" or \"https\"".to_string(),
            });
        }
        let host = self.host.as_deref().filter(|h| !h.is_empty()).ok_or(ConfigError::Missing {
            property: "target.rest.host",
            hint: "set the Predictive Insights REST mediation host",
        })?;
        let port = self.port.ok_or(ConfigError::Missing {
            property: "target.rest.port",
            hint: "set the Predictive Insights REST mediation port",
        })?;
        Ok(format!("{}://{}:{}/metrics/api/1.0/metrics", protocol, host, port))
    }

    fn aiops_url(&self) -> Result<String, ConfigError> {
        self.route
            .clone()
            .filter(|r| !r.is_empty())
            .ok_or(ConfigError::Missing {
                property: "target.rest.route",
                hint: "should be in the form https://<cluster>/aiops/api/app/metric-api/v1/metrics",
            })
    }

    fn basic_auth(&self) -> Result<RestAuth, ConfigError> {
        if !self.authentication {
            return Ok(RestAuth::None);
        }
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Ok(RestAuth::Basic {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => Err(ConfigError::Missing {
                property: "target.rest.username/password",
                hint: "REST authentication requested but credentials are not configured",
            }),
        }
    }

    fn zen_auth(&self) -> Result<RestAuth, ConfigError> {
        let api_key = self.api_key.clone().ok_or(ConfigError::Missing {
            property: "target.rest.api_key",
            hint: "create an API key and configure it",
        })?;
        let user = self.user.clone().ok_or(ConfigError::Missing {
            property: "target.rest.user",
            hint: "configure the user that owns the API key",
        })?;
        Ok(RestAuth::ZenApiKey { user, api_key })
    }

    fn validate_thresholds(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                property: "target.rest.batch_size",
                hint: "must be greater than 0".to_string(),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                property: "target.rest.max_attempts",
                hint: "must be at least 1".to_string(),
            });
        }
        if self.flush_period_secs == 0 {
            return Err(ConfigError::Invalid {
                property: "target.rest.flush_period_secs",
                hint: "must be at least 1 second".to_string(),
            });
        }
        Ok(())
    }
}

impl TlsConfig {
    fn validate(&self, bus: &'static str) -> Result<(), ConfigError> {
        for (what, path) in [
            ("root CA", &self.ca_location),
            ("certificate", &self.certificate_location),
            ("key", &self.key_location),
        ] {
            if !path.exists() {
                return Err(ConfigError::TlsFileMissing {
                    bus,
                    what,
                    path: path.display().to_string(),
                });
            }
            debug!("{} SSL {} located at {}", bus, what, path.display());
        }
        Ok(())
    }
}

/// Reads a line-delimited list, skipping blanks and `#` comments. A missing
/// file is an empty list.
pub fn load_list(path: &Path) -> Result<HashSet<String>, ConfigError> {
    if !path.exists() {
        debug!("List file {} not present, treating as empty", path.display());
        return Ok(HashSet::new());
    }

    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}
