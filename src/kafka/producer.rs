use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument, Span};

use super::client::{
    AckStreams, AsyncProducer, Client, ClusterAdminClient, Message, ProducerMessage, SyncProducer,
};
use super::inflight::InflightTracker;
use super::options::ProducerOptions;
use super::shutdown::Shutdown;
use crate::config::{ChangefeedId, Role};
use crate::{Error, Result};

/// Broker-facing resources, shared by sends and taken exclusively by `close`.
struct Resources {
    client: Box<dyn Client>,
    async_producer: Box<dyn AsyncProducer>,
    sync_producer: Box<dyn SyncProducer>,
    // Kept open until last: an external metrics collector may query it while
    // the async producer tears down.
    admin: Box<dyn ClusterAdminClient>,
    input: mpsc::Sender<ProducerMessage>,
    released: bool,
}

struct Shared {
    inflight: InflightTracker,
    shutdown: Shutdown,
    id: ChangefeedId,
    role: Role,
    // Carries the changefeed identity; entered by work done on caller tasks.
    span: Span,
}

impl Shared {
    fn stop(&self) {
        if self.shutdown.stop() {
            self.span.in_scope(|| info!("kafka producer closing..."));
        }
    }
}

/// Producer that multiplexes async and sync delivery over one set of broker
/// clients.
///
/// A background task drains the acknowledgment streams. The first delivery
/// error is fatal: it is pushed to the error channel given at construction
/// and the producer moves to closing.
///
/// `async_send_message` and `flush` must be called from one logical owner.
/// Interleaving them from different tasks makes `flush` wait on the wrong
/// messages.
pub struct KafkaProducer {
    resources: RwLock<Resources>,
    shared: Arc<Shared>,
    options: ProducerOptions,
    #[cfg_attr(not(test), allow(dead_code))]
    failpoint_tx: mpsc::Sender<Error>,
}

impl KafkaProducer {
    /// Builds the async and sync producers from `client` and starts the
    /// acknowledgment loop. Must be called inside a Tokio runtime.
    ///
    /// Cancelling `ctx` stops the loop without reporting an error.
    pub fn new(
        ctx: &CancellationToken,
        client: Box<dyn Client>,
        admin: Box<dyn ClusterAdminClient>,
        options: &ProducerOptions,
        err_tx: mpsc::Sender<Error>,
        id: ChangefeedId,
        role: Role,
    ) -> Result<Self> {
        let span = info_span!(
            "kafka_producer",
            namespace = %id.namespace,
            changefeed = %id.id,
            role = %role
        );
        span.in_scope(|| info!(options = ?options, "starting kafka producer"));

        let mut async_producer = client
            .async_producer()
            .map_err(|e| Error::NewProducer(Box::new(e)))?;
        let sync_producer = client
            .sync_producer()
            .map_err(|e| Error::NewProducer(Box::new(e)))?;
        let acks = async_producer.take_acks().ok_or_else(|| {
            Error::NewProducer(Box::new(Error::Broker(
                "acknowledgment streams already taken".to_string(),
            )))
        })?;
        let input = async_producer.input();

        let shared = Arc::new(Shared {
            inflight: InflightTracker::new(),
            shutdown: Shutdown::new(),
            id,
            role,
            span,
        });
        let (failpoint_tx, failpoint_rx) = mpsc::channel(1);

        tokio::spawn(
            run_and_report(shared.clone(), ctx.clone(), acks, failpoint_rx, err_tx)
                .instrument(shared.span.clone()),
        );

        Ok(Self {
            resources: RwLock::new(Resources {
                client,
                async_producer,
                sync_producer,
                admin,
                input,
                released: false,
            }),
            shared,
            options: options.clone(),
            failpoint_tx,
        })
    }

    /// Hands `message` to the async producer.
    ///
    /// Returns `Ok` without sending once the producer is closing; the message
    /// is dropped. Only messages the input queue actually accepted count
    /// towards [`flush`](Self::flush).
    pub async fn async_send_message(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        partition: i32,
        message: Message,
    ) -> Result<()> {
        let resources = self.resources.read().await;

        // Checked under the resource lock so `close` cannot release the
        // producers in between.
        if self.shared.shutdown.is_closing() {
            return Ok(());
        }

        let permit = tokio::select! {
            biased;
            _ = self.shared.shutdown.closed() => return Ok(()),
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            permit = resources.input.reserve() => permit.map_err(|_| Error::Closed)?,
        };

        self.shared
            .span
            .in_scope(|| self.shared.inflight.increment());
        permit.send(ProducerMessage {
            topic: topic.to_string(),
            partition,
            key: message.key,
            value: message.value,
        });
        Ok(())
    }

    /// Sends `message` to every partition of `topic` and waits for all of them.
    pub async fn sync_broadcast_message(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        partition_num: i32,
        message: Message,
    ) -> Result<()> {
        let resources = self.resources.read().await;

        if self.shared.shutdown.is_closing() {
            return Ok(());
        }

        let send = resources
            .sync_producer
            .send_messages(topic, partition_num, &message.key, &message.value)
            .instrument(self.shared.span.clone());

        tokio::select! {
            biased;
            _ = self.shared.shutdown.closed() => Ok(()),
            _ = ctx.cancelled() => Err(Error::Cancelled),
            result = send => result.map_err(|e| Error::SyncSendMessage(Box::new(e))),
        }
    }

    /// Waits until every message accepted by
    /// [`async_send_message`](Self::async_send_message) has been acknowledged.
    ///
    /// Fails with [`Error::FlushUnfinished`] if the producer closes first.
    pub async fn flush(&self, ctx: &CancellationToken) -> Result<()> {
        self.shared
            .inflight
            .await_zero(ctx, self.shared.shutdown.signal())
            .instrument(self.shared.span.clone())
            .await
    }

    /// Stops the producer and releases every broker resource exactly once.
    ///
    /// Release failures are logged, not returned. Calling `close` again is a
    /// no-op.
    #[instrument(
        skip_all,
        fields(
            namespace = %self.shared.id.namespace,
            changefeed = %self.shared.id.id,
            role = %self.shared.role
        )
    )]
    pub async fn close(&self) -> Result<()> {
        info!("stop the kafka producer");
        self.shared.stop();

        let mut resources = self.resources.write().await;
        if resources.released {
            warn!("kafka producer already released");
            return Ok(());
        }
        resources.released = true;

        // The client goes first so the async producer does not spend its
        // close trying to refresh metadata from an unresponsive broker.
        release("kafka client", || resources.client.close());
        release("async producer", || resources.async_producer.close());
        release("sync producer", || resources.sync_producer.close());

        let start = Instant::now();
        match resources.admin.close() {
            Ok(()) => info!(duration = ?start.elapsed(), "kafka cluster admin closed"),
            Err(e) => warn!(
                error = %e,
                duration = ?start.elapsed(),
                "close kafka cluster admin with error"
            ),
        }

        Ok(())
    }

    pub fn is_closing(&self) -> bool {
        self.shared.shutdown.is_closing()
    }

    /// Messages accepted but not yet acknowledged.
    pub fn inflight(&self) -> u64 {
        self.shared.inflight.inflight()
    }

    pub fn options(&self) -> &ProducerOptions {
        &self.options
    }

    /// Simulates a message that reached the input queue but failed to flush.
    #[cfg(test)]
    pub(crate) fn inject_async_send_error(&self, reason: &str) {
        self.shared
            .span
            .in_scope(|| info!(reason, "failpoint error injected"));
        let _ = self.failpoint_tx.try_send(Error::Injected(reason.to_string()));
    }
}

fn release(what: &str, close: impl FnOnce() -> Result<()>) {
    let start = Instant::now();
    match close() {
        Ok(()) => info!(duration = ?start.elapsed(), "{} closed", what),
        Err(e) => error!(error = %e, duration = ?start.elapsed(), "close {} with error", what),
    }
}

async fn run_and_report(
    shared: Arc<Shared>,
    ctx: CancellationToken,
    acks: AckStreams,
    failpoint_rx: mpsc::Receiver<Error>,
    err_tx: mpsc::Sender<Error>,
) {
    let Err(err) = run(&shared, &ctx, acks, failpoint_rx).await else {
        return;
    };
    if err.is_cancelled() || ctx.is_cancelled() {
        return;
    }
    // Never block on error reporting.
    match err_tx.try_send(err) {
        Ok(()) => {}
        Err(TrySendError::Full(err)) | Err(TrySendError::Closed(err)) => {
            error!(error = %err, "error channel is full");
        }
    }
}

async fn run(
    shared: &Shared,
    ctx: &CancellationToken,
    mut acks: AckStreams,
    mut failpoint_rx: mpsc::Receiver<Error>,
) -> Result<()> {
    let result = loop {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => break Err(Error::Cancelled),
            _ = shared.shutdown.closed() => break Ok(()),
            Some(err) = failpoint_rx.recv() => {
                warn!(error = %err, "receive from failpoint chan");
                break Err(err);
            }
            ack = acks.successes.recv() => match ack {
                Some(ack) => {
                    debug!(topic = %ack.topic, partition = ack.partition, "message acknowledged");
                    shared.inflight.decrement();
                }
                None => break Ok(()),
            },
            err = acks.errors.recv() => match err {
                Some(failed) => break Err(Error::AsyncSendMessage {
                    topic: failed.message.topic,
                    partition: failed.message.partition,
                    source: Box::new(failed.error),
                }),
                None => break Ok(()),
            },
        }
    };

    info!("stop the kafka producer");
    shared.stop();
    result
}
