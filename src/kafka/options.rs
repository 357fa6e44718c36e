use serde::{Deserialize, Serialize};

/// Topic-level name of the maximum record batch size.
pub const TOPIC_MAX_MESSAGE_BYTES_CONFIG_NAME: &str = "max.message.bytes";

/// Broker-level name of the maximum record batch size. Topics created by the
/// broker inherit it as their `max.message.bytes`.
pub const BROKER_MESSAGE_MAX_BYTES_CONFIG_NAME: &str = "message.max.bytes";

/// Same name at topic and broker level.
pub const MIN_INSYNC_REPLICAS_CONFIG_NAME: &str = "min.insync.replicas";

/// Partition count used when the topic does not exist yet and none was given.
pub const DEFAULT_PARTITION_NUM: i32 = 3;

/// Producer settings that are reconciled against the broker before use.
///
/// Only [`adjust_options`](crate::kafka::adjust_options) mutates these; the
/// producer treats them as read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProducerOptions {
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: i32,
    /// Zero means "not specified".
    #[serde(default)]
    pub partition_num: i32,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,
    #[serde(default = "default_auto_create_topic")]
    pub auto_create_topic: bool,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            max_message_bytes: default_max_message_bytes(),
            partition_num: 0,
            replication_factor: default_replication_factor(),
            auto_create_topic: default_auto_create_topic(),
        }
    }
}

fn default_max_message_bytes() -> i32 {
    10 * 1024 * 1024 // 10MB
}

fn default_replication_factor() -> i32 {
    1
}

fn default_auto_create_topic() -> bool {
    true
}
