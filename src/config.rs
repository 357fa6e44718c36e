use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::kafka::ProducerOptions;
use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub producer: ProducerOptions,
    #[serde(default)]
    pub changefeed: ChangefeedId,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u32,
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Bound of the async input queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_error_channel_capacity")]
    pub error_channel_capacity: usize,
}

/// Identity of the changefeed a producer belongs to, carried in every log line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChangefeedId {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_changefeed")]
    pub id: String,
}

impl ChangefeedId {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }
}

impl Default for ChangefeedId {
    fn default() -> Self {
        Self::new(default_namespace(), default_changefeed())
    }
}

impl fmt::Display for ChangefeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

/// Which part of the pipeline owns the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Processor,
    Client,
    #[default]
    Unknown,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Owner => "owner",
            Role::Processor => "processor",
            Role::Client => "client",
            Role::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path.as_ref()))
            .add_source(
                ::config::Environment::with_prefix("KAFKA_SINK")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))
    }
}

impl KafkaConfig {
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_linger_ms() -> u32 {
    10
}

fn default_message_timeout_ms() -> u32 {
    30_000
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_error_channel_capacity() -> usize {
    16
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_changefeed() -> String {
    "kafka-sink".to_string()
}
