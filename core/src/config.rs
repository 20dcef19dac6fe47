use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{BoxError, ConfigError};
use crate::record::Tag;
use crate::source::batch::BatchSettings;
use crate::source::capture::CaptureSettings;
use crate::source::consumer::ConsumerSettings;
use crate::source::resolver::SourceResolver;
use crate::source::timestamp::{Rfc3339Extractor, TimestampExtractor};

const CONFIG_ENV: &str = "INGEST_CONFIG";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    pub version: u32,
    pub sink: SinkConfig,
    #[serde(default)]
    pub flow_listeners: Vec<FlowListenerConfig>,
    #[serde(default)]
    pub kafka_consumers: Vec<KafkaConsumerConfig>,
    /// Capacity of the channel between flow capture loops and the sink.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SinkConfig {
    #[serde(rename = "type")]
    pub target_type: SinkType,
    /// File to append to; stdout when absent.
    pub path: Option<String>,
    /// Overrides the address reported as this process's own source.
    pub source_address: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkType {
    JsonLines,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlowListenerConfig {
    pub name: String,
    pub protocol: FlowProtocol,
    pub bind: String,
    pub tag: String,
    #[serde(default)]
    pub ignore_timestamps: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowProtocol {
    NetflowV5,
    Ipfix,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConsumerConfig {
    pub name: String,
    pub bootstrap_servers: String,
    pub topic: String,
    pub consumer_group: String,
    pub tag: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default)]
    pub ignore_timestamps: bool,
    #[serde(default)]
    pub extract_timestamps: bool,
    pub header_key_as_source: Option<String>,
    #[serde(default)]
    pub key_as_source: bool,
    #[serde(default)]
    pub source_as_text: bool,
    #[serde(default)]
    pub sync_per_batch: bool,
    pub security_protocol: Option<String>,
    pub sasl_mechanisms: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub auto_offset_reset: Option<String>,
    pub session_timeout_ms: Option<u32>,
    pub heartbeat_interval_ms: Option<u32>,
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_batch_size() -> usize {
    512
}

fn default_flush_interval_ms() -> u64 {
    1000
}

impl FlowListenerConfig {
    pub fn capture_settings(&self, tag: Tag) -> CaptureSettings {
        CaptureSettings {
            tag,
            ignore_timestamps: self.ignore_timestamps,
        }
    }
}

impl KafkaConsumerConfig {
    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            name: self.name.clone(),
            topic: self.topic.clone(),
            group: self.consumer_group.clone(),
            tag: self.tag.clone(),
            batch: BatchSettings {
                batch_size: self.batch_size,
                flush_interval: Duration::from_millis(self.flush_interval_ms),
                ignore_timestamps: self.ignore_timestamps,
                sync_per_batch: self.sync_per_batch,
                ..BatchSettings::default()
            },
            resolver: SourceResolver {
                header_key: self.header_key_as_source.clone(),
                key_as_source: self.key_as_source,
                source_as_text: self.source_as_text,
            },
        }
    }

    /// Content timestamp extractor, when enabled.
    pub fn extractor(&self) -> Option<Arc<dyn TimestampExtractor>> {
        self.extract_timestamps
            .then(|| Arc::new(Rfc3339Extractor) as Arc<dyn TimestampExtractor>)
    }
}

pub async fn load_config(config_path: Option<&str>) -> Result<IngestConfig, ConfigError> {
    let config = match config_path {
        Some(path) => IngestConfig::from_file(path)?,
        None => IngestConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

impl IngestConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let load_failed = |error: BoxError| ConfigError::LoadFailed {
            origin: path.to_string(),
            error,
        };
        let content = std::fs::read_to_string(path).map_err(|e| load_failed(e.into()))?;
        serde_yaml::from_str(&content).map_err(|e| load_failed(e.into()))
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let config_str = std::env::var(CONFIG_ENV).map_err(|_| ConfigError::MissingField {
            field: format!("{CONFIG_ENV} environment variable"),
        })?;
        serde_yaml::from_str(&config_str).map_err(|e| ConfigError::LoadFailed {
            origin: CONFIG_ENV.to_string(),
            error: e.into(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flow_listeners.is_empty() && self.kafka_consumers.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "At least one flow listener or kafka consumer must be configured".into(),
            });
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                message: "channel_capacity must be positive".into(),
            });
        }
        if self.sink.path.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::Invalid {
                message: "Sink path cannot be empty".into(),
            });
        }

        let mut names = HashSet::new();
        for listener in &self.flow_listeners {
            require("flow_listeners.name", &listener.name)?;
            require("flow_listeners.bind", &listener.bind)?;
            require("flow_listeners.tag", &listener.tag)?;
            if !names.insert(listener.name.as_str()) {
                return Err(duplicate(&listener.name));
            }
        }

        for consumer in &self.kafka_consumers {
            require("kafka_consumers.name", &consumer.name)?;
            require("kafka_consumers.bootstrap_servers", &consumer.bootstrap_servers)?;
            require("kafka_consumers.topic", &consumer.topic)?;
            require("kafka_consumers.consumer_group", &consumer.consumer_group)?;
            require("kafka_consumers.tag", &consumer.tag)?;
            if consumer.batch_size == 0 {
                return Err(ConfigError::Invalid {
                    message: format!("{}: batch_size must be positive", consumer.name),
                });
            }
            if consumer.flush_interval_ms == 0 {
                return Err(ConfigError::Invalid {
                    message: format!("{}: flush_interval_ms must be positive", consumer.name),
                });
            }
            if !names.insert(consumer.name.as_str()) {
                return Err(duplicate(&consumer.name));
            }
        }
        Ok(())
    }
}

fn require(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField {
            field: field.to_string(),
        });
    }
    Ok(())
}

fn duplicate(name: &str) -> ConfigError {
    ConfigError::ValidationFailed {
        reason: format!("Adapter name {name} is used more than once"),
    }
}
