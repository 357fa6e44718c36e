use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use rdkafka::admin::{
    AdminClient, AdminOptions, ConfigSource, OwnedResourceSpecifier, ResourceSpecifier,
};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::client::{
    AckStreams, AsyncProducer, Client, ClusterAdminClient, ProducerError, ProducerMessage,
    SyncProducer, TopicDetail,
};
use super::options::ProducerOptions;
use crate::config::KafkaConfig;
use crate::{Error, Result};

const ACK_CHANNEL_CAPACITY: usize = 4096;
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(10);

/// [`Client`] backed by librdkafka.
pub struct RdKafkaClient {
    config: ClientConfig,
    queue_capacity: usize,
    close_timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl RdKafkaClient {
    /// Producer settings are taken from `options`, so build the client after
    /// [`adjust_options`](super::adjust_options) has run.
    pub fn new(kafka: &KafkaConfig, options: &ProducerOptions) -> Self {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", kafka.bootstrap_servers())
            .set("acks", "all")
            .set("compression.type", &kafka.compression)
            .set("linger.ms", kafka.linger_ms.to_string())
            .set("message.timeout.ms", kafka.message_timeout_ms.to_string())
            .set("message.max.bytes", options.max_message_bytes.to_string());

        debug!("rdkafka configuration: {:?}", config);

        Self {
            config,
            queue_capacity: kafka.queue_capacity.max(1),
            close_timeout: Duration::from_secs(kafka.request_timeout_secs),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn create_producer(&self) -> Result<FutureProducer> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(self.config.create()?)
    }
}

impl Client for RdKafkaClient {
    fn async_producer(&self) -> Result<Box<dyn AsyncProducer>> {
        let producer = self.create_producer()?;
        let (input, input_rx) = mpsc::channel(self.queue_capacity);
        let (success_tx, successes) = mpsc::channel(ACK_CHANNEL_CAPACITY);
        let (error_tx, errors) = mpsc::channel(ACK_CHANNEL_CAPACITY);
        let stop = CancellationToken::new();

        tokio::spawn(produce_loop(
            producer.clone(),
            input_rx,
            success_tx,
            error_tx,
            stop.clone(),
        ));

        Ok(Box::new(RdAsyncProducer {
            producer,
            input,
            acks: Some(AckStreams { successes, errors }),
            stop,
            close_timeout: self.close_timeout,
            client_closed: self.closed.clone(),
        }))
    }

    fn sync_producer(&self) -> Result<Box<dyn SyncProducer>> {
        Ok(Box::new(RdSyncProducer {
            producer: self.create_producer()?,
            close_timeout: self.close_timeout,
            client_closed: self.closed.clone(),
        }))
    }

    fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct RdAsyncProducer {
    producer: FutureProducer,
    input: mpsc::Sender<ProducerMessage>,
    acks: Option<AckStreams>,
    stop: CancellationToken,
    close_timeout: Duration,
    client_closed: Arc<AtomicBool>,
}

impl AsyncProducer for RdAsyncProducer {
    fn input(&self) -> mpsc::Sender<ProducerMessage> {
        self.input.clone()
    }

    fn take_acks(&mut self) -> Option<AckStreams> {
        self.acks.take()
    }

    fn close(&mut self) -> Result<()> {
        self.stop.cancel();
        flush_on_close(&self.producer, &self.client_closed, self.close_timeout)
    }
}

/// Flushes `producer` for up to `timeout`. Once the owning client is closed
/// the broker is not waited on: whatever is still queued is abandoned.
fn flush_on_close(
    producer: &FutureProducer,
    client_closed: &AtomicBool,
    timeout: Duration,
) -> Result<()> {
    if !client_closed.load(Ordering::Acquire) {
        return Producer::flush(producer, timeout).map_err(Error::Kafka);
    }

    match Producer::flush(producer, Duration::ZERO) {
        Ok(()) => Ok(()),
        Err(KafkaError::Flush(RDKafkaErrorCode::OperationTimedOut)) => {
            warn!(
                unflushed = producer.in_flight_count(),
                "client closed, abandoning undelivered messages"
            );
            Ok(())
        }
        Err(e) => Err(Error::Kafka(e)),
    }
}

/// Moves messages from the input queue into librdkafka and reports each
/// delivery on exactly one of the two ack streams.
async fn produce_loop(
    producer: FutureProducer,
    mut input: mpsc::Receiver<ProducerMessage>,
    successes: mpsc::Sender<ProducerMessage>,
    errors: mpsc::Sender<ProducerError>,
    stop: CancellationToken,
) {
    let mut deliveries = FuturesUnordered::new();

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            Some((message, delivery)) = deliveries.next(), if !deliveries.is_empty() => {
                report_delivery(message, delivery, &successes, &errors).await;
            }
            next = input.recv() => {
                let Some(message) = next else {
                    break;
                };
                match enqueue(&producer, &message, &stop).await {
                    Ok(delivery) => deliveries.push(async move { (message, delivery.await) }),
                    Err(error) => {
                        let _ = errors.send(ProducerError { message, error }).await;
                    }
                }
            }
        }
    }

    debug!(pending = deliveries.len(), "async produce loop stopped");
}

async fn enqueue(
    producer: &FutureProducer,
    message: &ProducerMessage,
    stop: &CancellationToken,
) -> Result<DeliveryFuture> {
    loop {
        let mut record = FutureRecord::to(&message.topic)
            .key(&message.key[..])
            .payload(&message.value[..]);
        if message.partition >= 0 {
            record = record.partition(message.partition);
        }

        match producer.send_result(record) {
            Ok(delivery) => return Ok(delivery),
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                tokio::select! {
                    _ = stop.cancelled() => return Err(Error::Closed),
                    _ = tokio::time::sleep(QUEUE_FULL_BACKOFF) => {}
                }
            }
            Err((e, _)) => return Err(Error::Kafka(e)),
        }
    }
}

async fn report_delivery<T, M, C>(
    message: ProducerMessage,
    delivery: std::result::Result<std::result::Result<T, (KafkaError, M)>, C>,
    successes: &mpsc::Sender<ProducerMessage>,
    errors: &mpsc::Sender<ProducerError>,
) {
    let error = match delivery {
        Ok(Ok(_)) => {
            let _ = successes.send(message).await;
            return;
        }
        Ok(Err((e, _))) => Error::Kafka(e),
        Err(_) => Error::Broker("delivery report dropped".to_string()),
    };
    let _ = errors.send(ProducerError { message, error }).await;
}

struct RdSyncProducer {
    producer: FutureProducer,
    close_timeout: Duration,
    client_closed: Arc<AtomicBool>,
}

#[async_trait]
impl SyncProducer for RdSyncProducer {
    async fn send_messages(
        &self,
        topic: &str,
        partition_num: i32,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let deliveries = (0..partition_num).map(|partition| {
            let record = FutureRecord::to(topic)
                .partition(partition)
                .key(key)
                .payload(value);
            self.producer.send(record, Timeout::Never)
        });

        for result in futures::future::join_all(deliveries).await {
            result.map_err(|(e, _)| Error::Kafka(e))?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        flush_on_close(&self.producer, &self.client_closed, self.close_timeout)
    }
}

/// [`ClusterAdminClient`] backed by the rdkafka admin API.
pub struct RdKafkaAdmin {
    admin: Option<AdminClient<DefaultClientContext>>,
    timeout: Duration,
}

impl RdKafkaAdmin {
    pub fn new(kafka: &KafkaConfig) -> Result<Self> {
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", kafka.bootstrap_servers())
            .create()?;

        Ok(Self {
            admin: Some(admin),
            timeout: Duration::from_secs(kafka.request_timeout_secs),
        })
    }

    fn admin(&self) -> Result<&AdminClient<DefaultClientContext>> {
        self.admin.as_ref().ok_or(Error::Closed)
    }

    fn options(&self) -> AdminOptions {
        AdminOptions::new().request_timeout(Some(self.timeout))
    }
}

#[async_trait]
impl ClusterAdminClient for RdKafkaAdmin {
    #[instrument(skip(self))]
    async fn get_all_topics_meta(&self) -> Result<HashMap<String, TopicDetail>> {
        let admin = self.admin()?;
        let metadata = admin.inner().fetch_metadata(None, self.timeout)?;

        let mut topics: HashMap<String, TopicDetail> = HashMap::new();
        for topic in metadata.topics() {
            if let Some(err) = topic.error() {
                warn!(topic = %topic.name(), error = ?err, "skipping topic with metadata error");
                continue;
            }
            let replication_factor = topic
                .partitions()
                .first()
                .map(|p| p.replicas().len() as i32)
                .unwrap_or_default();
            topics.insert(
                topic.name().to_string(),
                TopicDetail {
                    num_partitions: topic.partitions().len() as i32,
                    replication_factor,
                    config_entries: HashMap::new(),
                },
            );
        }

        if topics.is_empty() {
            return Ok(topics);
        }

        let names: Vec<String> = topics.keys().cloned().collect();
        let specifiers: Vec<ResourceSpecifier<'_>> =
            names.iter().map(|name| ResourceSpecifier::Topic(name.as_str())).collect();
        let results = admin.describe_configs(&specifiers, &self.options()).await?;

        for result in results {
            let resource = result.map_err(|code| {
                Error::Broker(format!("describe topic configs failed: {}", code))
            })?;
            let OwnedResourceSpecifier::Topic(name) = &resource.specifier else {
                continue;
            };
            let Some(detail) = topics.get_mut(name) else {
                continue;
            };
            // Only overrides; inherited values are resolved on the broker.
            for entry in &resource.entries {
                if entry.source != ConfigSource::DynamicTopic {
                    continue;
                }
                if let Some(value) = &entry.value {
                    detail.config_entries.insert(entry.name.clone(), value.clone());
                }
            }
        }

        debug!(topics = topics.len(), "fetched topic metadata");
        Ok(topics)
    }

    #[instrument(skip(self))]
    async fn get_broker_config(&self, name: &str) -> Result<String> {
        let admin = self.admin()?;
        let metadata = admin.inner().fetch_metadata(None, self.timeout)?;
        let broker_id = metadata.orig_broker_id();

        let results = admin
            .describe_configs(&[ResourceSpecifier::Broker(broker_id)], &self.options())
            .await?;

        for result in results {
            let resource = result.map_err(|code| {
                Error::Broker(format!("describe broker {} configs failed: {}", broker_id, code))
            })?;
            if let Some(value) = resource.get(name).and_then(|entry| entry.value.clone()) {
                return Ok(value);
            }
        }

        Err(Error::BrokerConfigNotFound(name.to_string()))
    }

    fn close(&mut self) -> Result<()> {
        if self.admin.take().is_some() {
            info!("rdkafka admin client dropped");
        }
        Ok(())
    }
}
