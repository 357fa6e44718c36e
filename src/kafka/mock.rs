//! In-memory broker for exercising the producer without a Kafka cluster.
//!
//! [`MockCluster`] hands out a [`Client`] and a [`ClusterAdminClient`] backed
//! by shared state, so a test can stage topic metadata, hold or release
//! acknowledgments, and check which resources were closed and in what order.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use super::client::{
    AckStreams, AsyncProducer, Client, ClusterAdminClient, ProducerError, ProducerMessage,
    SyncProducer, TopicDetail,
};
use crate::{Error, Result};

const ACK_CHANNEL_CAPACITY: usize = 4096;

#[derive(Default)]
struct ClusterState {
    topics: HashMap<String, TopicDetail>,
    broker_configs: HashMap<String, String>,
    topic_listing_error: Option<String>,
    auto_ack: bool,
    input_capacity: usize,
    pending: VecDeque<ProducerMessage>,
    delivered: Vec<ProducerMessage>,
    accepted: usize,
    success_tx: Option<mpsc::Sender<ProducerMessage>>,
    error_tx: Option<mpsc::Sender<ProducerError>>,
    sync_sent: Vec<ProducerMessage>,
    sync_error: Option<String>,
    sync_delay: Option<Duration>,
    producer_creation_error: Option<String>,
    failing_closes: HashSet<&'static str>,
    closed: Vec<&'static str>,
}

/// Shared handle to an in-memory cluster. Clones see the same state.
#[derive(Clone)]
pub struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
    paused: Arc<watch::Sender<bool>>,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    /// A cluster that acknowledges every message as soon as it is accepted.
    pub fn new() -> Self {
        let state = ClusterState {
            auto_ack: true,
            input_capacity: 64,
            ..Default::default()
        };
        let (paused, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(state)),
            paused: Arc::new(paused),
        }
    }

    pub fn client(&self) -> MockClient {
        MockClient {
            cluster: self.clone(),
        }
    }

    pub fn admin(&self) -> MockAdmin {
        MockAdmin {
            cluster: self.clone(),
        }
    }

    pub fn add_topic<'a>(
        &self,
        name: &str,
        num_partitions: i32,
        config_entries: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) {
        let detail = TopicDetail {
            num_partitions,
            replication_factor: 1,
            config_entries: config_entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        self.lock().topics.insert(name.to_string(), detail);
    }

    pub fn set_broker_config(&self, name: &str, value: &str) {
        self.lock()
            .broker_configs
            .insert(name.to_string(), value.to_string());
    }

    pub fn fail_topic_listing(&self, reason: &str) {
        self.lock().topic_listing_error = Some(reason.to_string());
    }

    /// Keeps accepted messages pending until [`ack_pending`](Self::ack_pending)
    /// or [`fail_pending`](Self::fail_pending) is called.
    pub fn hold_acks(&self) {
        self.lock().auto_ack = false;
    }

    /// Bound of the async input queue of producers created afterwards.
    pub fn set_input_capacity(&self, capacity: usize) {
        self.lock().input_capacity = capacity.max(1);
    }

    /// Stops draining the async input queue, so senders block once it is full.
    pub fn pause_input(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume_input(&self) {
        self.paused.send_replace(false);
    }

    pub fn fail_sync_sends(&self, reason: &str) {
        self.lock().sync_error = Some(reason.to_string());
    }

    pub fn delay_sync_sends(&self, delay: Duration) {
        self.lock().sync_delay = Some(delay);
    }

    /// Makes every later `async_producer` and `sync_producer` call fail.
    pub fn fail_producer_creation(&self, reason: &str) {
        self.lock().producer_creation_error = Some(reason.to_string());
    }

    /// Makes `close` of the named resource (`client`, `async_producer`,
    /// `sync_producer` or `admin`) fail.
    pub fn fail_close_of(&self, resource: &'static str) {
        self.lock().failing_closes.insert(resource);
    }

    /// Acknowledges up to `n` pending messages. Returns how many were acked.
    pub fn ack_pending(&self, n: usize) -> usize {
        let mut state = self.lock();
        let mut acked = 0;
        while acked < n {
            let Some(tx) = state.success_tx.clone() else {
                break;
            };
            let Some(message) = state.pending.pop_front() else {
                break;
            };
            let delivered = message.clone();
            if let Err(e) = tx.try_send(message) {
                // Stays pending so a later call can retry it.
                state.pending.push_front(e.into_inner());
                break;
            }
            state.delivered.push(delivered);
            acked += 1;
        }
        acked
    }

    pub fn ack_all_pending(&self) -> usize {
        self.ack_pending(usize::MAX)
    }

    /// Reports the oldest pending message as failed on the error stream.
    pub fn fail_pending(&self, reason: &str) -> bool {
        let mut state = self.lock();
        let Some(tx) = state.error_tx.clone() else {
            return false;
        };
        let Some(message) = state.pending.pop_front() else {
            return false;
        };
        tx.try_send(ProducerError {
            message,
            error: Error::Broker(reason.to_string()),
        })
        .is_ok()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Messages the async producer pulled off its input queue.
    pub fn accepted_count(&self) -> usize {
        self.lock().accepted
    }

    pub fn delivered(&self) -> Vec<ProducerMessage> {
        self.lock().delivered.clone()
    }

    pub fn sync_sent(&self) -> Vec<ProducerMessage> {
        self.lock().sync_sent.clone()
    }

    /// Resources closed so far, in close order.
    pub fn closed(&self) -> Vec<&'static str> {
        self.lock().closed.clone()
    }

    fn record_close(&self, resource: &'static str) -> Result<()> {
        let mut state = self.lock();
        state.closed.push(resource);
        if state.failing_closes.contains(resource) {
            return Err(Error::Broker(format!("{} close failed", resource)));
        }
        Ok(())
    }

    fn check_producer_creation(&self) -> Result<()> {
        match &self.lock().producer_creation_error {
            Some(reason) => Err(Error::Broker(reason.clone())),
            None => Ok(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct MockClient {
    cluster: MockCluster,
}

impl Client for MockClient {
    fn async_producer(&self) -> Result<Box<dyn AsyncProducer>> {
        self.cluster.check_producer_creation()?;
        let capacity = self.cluster.lock().input_capacity;
        let (input, input_rx) = mpsc::channel(capacity);
        let (success_tx, successes) = mpsc::channel(ACK_CHANNEL_CAPACITY);
        let (error_tx, errors) = mpsc::channel(ACK_CHANNEL_CAPACITY);
        {
            let mut state = self.cluster.lock();
            state.success_tx = Some(success_tx);
            state.error_tx = Some(error_tx);
        }

        let worker = tokio::spawn(drain_input(
            self.cluster.clone(),
            input_rx,
            self.cluster.paused.subscribe(),
        ));

        Ok(Box::new(MockAsyncProducer {
            cluster: self.cluster.clone(),
            input,
            acks: Some(AckStreams { successes, errors }),
            worker: Some(worker),
        }))
    }

    fn sync_producer(&self) -> Result<Box<dyn SyncProducer>> {
        self.cluster.check_producer_creation()?;
        Ok(Box::new(MockSyncProducer {
            cluster: self.cluster.clone(),
            closed: false,
        }))
    }

    fn close(&mut self) -> Result<()> {
        self.cluster.record_close("client")
    }
}

async fn drain_input(
    cluster: MockCluster,
    mut input: mpsc::Receiver<ProducerMessage>,
    mut paused: watch::Receiver<bool>,
) {
    loop {
        if paused.wait_for(|paused| !*paused).await.is_err() {
            return;
        }
        let Some(message) = input.recv().await else {
            return;
        };
        debug!(
            topic = %message.topic,
            partition = message.partition,
            "mock broker accepted message"
        );

        let mut state = cluster.lock();
        state.accepted += 1;
        if state.auto_ack {
            if let Some(tx) = state.success_tx.clone() {
                state.delivered.push(message.clone());
                let _ = tx.try_send(message);
            }
        } else {
            state.pending.push_back(message);
        }
    }
}

struct MockAsyncProducer {
    cluster: MockCluster,
    input: mpsc::Sender<ProducerMessage>,
    acks: Option<AckStreams>,
    worker: Option<JoinHandle<()>>,
}

impl AsyncProducer for MockAsyncProducer {
    fn input(&self) -> mpsc::Sender<ProducerMessage> {
        self.input.clone()
    }

    fn take_acks(&mut self) -> Option<AckStreams> {
        self.acks.take()
    }

    fn close(&mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        {
            let mut state = self.cluster.lock();
            state.success_tx = None;
            state.error_tx = None;
        }
        self.cluster.record_close("async_producer")
    }
}

struct MockSyncProducer {
    cluster: MockCluster,
    closed: bool,
}

#[async_trait]
impl SyncProducer for MockSyncProducer {
    async fn send_messages(
        &self,
        topic: &str,
        partition_num: i32,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        let delay = self.cluster.lock().sync_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.cluster.lock();
        if let Some(reason) = &state.sync_error {
            return Err(Error::Broker(reason.clone()));
        }
        for partition in 0..partition_num {
            state.sync_sent.push(ProducerMessage {
                topic: topic.to_string(),
                partition,
                key: key.to_vec().into(),
                value: value.to_vec().into(),
            });
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.cluster.record_close("sync_producer")
    }
}

pub struct MockAdmin {
    cluster: MockCluster,
}

#[async_trait]
impl ClusterAdminClient for MockAdmin {
    async fn get_all_topics_meta(&self) -> Result<HashMap<String, TopicDetail>> {
        let state = self.cluster.lock();
        if let Some(reason) = &state.topic_listing_error {
            return Err(Error::Broker(reason.clone()));
        }
        Ok(state.topics.clone())
    }

    async fn get_broker_config(&self, name: &str) -> Result<String> {
        self.cluster
            .lock()
            .broker_configs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::BrokerConfigNotFound(name.to_string()))
    }

    fn close(&mut self) -> Result<()> {
        self.cluster.record_close("admin")
    }
}
