//! Capability surface of the broker client.
//!
//! The producer core never talks to the wire protocol itself. It consumes
//! the traits below, which [`RdKafkaClient`](super::RdKafkaClient) implements
//! over rdkafka and [`MockCluster`](super::MockCluster) implements in memory.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::{Error, Result};

/// A message addressed to one partition of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerMessage {
    pub topic: String,
    pub partition: i32,
    pub key: Bytes,
    pub value: Bytes,
}

/// An encoded payload as handed over by the event encoder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub key: Bytes,
    pub value: Bytes,
}

impl Message {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A terminal delivery failure for one message.
#[derive(Debug)]
pub struct ProducerError {
    pub message: ProducerMessage,
    pub error: Error,
}

/// Acknowledgment streams of an async producer.
///
/// Each accepted message shows up exactly once on one of the two streams.
pub struct AckStreams {
    pub successes: mpsc::Receiver<ProducerMessage>,
    pub errors: mpsc::Receiver<ProducerError>,
}

/// Metadata of one topic as listed by the admin client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicDetail {
    pub num_partitions: i32,
    pub replication_factor: i32,
    /// Topic-level overrides only; inherited values are looked up on the broker.
    pub config_entries: HashMap<String, String>,
}

pub trait AsyncProducer: Send + Sync {
    /// Write handle of the bounded input queue.
    fn input(&self) -> mpsc::Sender<ProducerMessage>;

    /// Hands out the acknowledgment streams. Only the first call succeeds.
    fn take_acks(&mut self) -> Option<AckStreams>;

    fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait SyncProducer: Send + Sync {
    /// Sends `key`/`value` to every partition in `0..partition_num` and waits
    /// for all deliveries.
    async fn send_messages(
        &self,
        topic: &str,
        partition_num: i32,
        key: &[u8],
        value: &[u8],
    ) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait ClusterAdminClient: Send + Sync {
    async fn get_all_topics_meta(&self) -> Result<HashMap<String, TopicDetail>>;

    /// Fails with [`Error::BrokerConfigNotFound`] when the broker hides `name`.
    async fn get_broker_config(&self, name: &str) -> Result<String>;

    fn close(&mut self) -> Result<()>;
}

/// Connection/metadata client that producers are built from.
pub trait Client: Send + Sync {
    fn async_producer(&self) -> Result<Box<dyn AsyncProducer>>;

    fn sync_producer(&self) -> Result<Box<dyn SyncProducer>>;

    fn close(&mut self) -> Result<()>;
}
