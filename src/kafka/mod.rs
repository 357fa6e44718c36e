pub mod client;
pub mod inflight;
pub mod mock;
pub mod options;
pub mod producer;
pub mod rdkafka_client;
pub mod reconcile;
pub mod shutdown;


pub use client::{
    AckStreams, AsyncProducer, Client, ClusterAdminClient, Message, ProducerError,
    ProducerMessage, SyncProducer, TopicDetail,
};
pub use inflight::InflightTracker;
pub use mock::MockCluster;
pub use options::{ProducerOptions, DEFAULT_PARTITION_NUM};
pub use producer::KafkaProducer;
pub use rdkafka_client::{RdKafkaAdmin, RdKafkaClient};
pub use reconcile::{adjust_options, get_topic_config, validate_min_insync_replicas};
pub use shutdown::Shutdown;
