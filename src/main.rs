use anyhow::Context;
use clap::Parser;
use kafka_sink::kafka::{adjust_options, RdKafkaAdmin, RdKafkaClient};
use kafka_sink::{Config, KafkaProducer, Message, Role};
use serde::Deserialize;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "kafka-sink")]
#[command(about = "Delivers newline-delimited change events to Kafka", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, default_value_t = 1000, help = "Flush after this many async sends")]
    flush_every: usize,
}

/// One line of input.
#[derive(Debug, Deserialize)]
struct InputRecord {
    #[serde(default)]
    key: Option<String>,
    value: serde_json::Value,
    /// Unset lets the client pick the partition.
    #[serde(default)]
    partition: Option<i32>,
    /// Sent synchronously to every partition, e.g. resolved-ts markers.
    #[serde(default)]
    broadcast: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting kafka-sink");
    info!("Loading configuration from {:?}", args.config);

    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {:?}", args.config))?;

    info!(
        kafka_brokers = ?config.kafka.brokers,
        kafka_topic = %config.kafka.topic,
        changefeed = %config.changefeed,
        "Configuration summary"
    );

    let topic = config.kafka.topic.clone();
    let admin = RdKafkaAdmin::new(&config.kafka)?;
    let mut options = config.producer.clone();
    adjust_options(&admin, &mut options, &topic)
        .await
        .context("producer options are incompatible with the broker")?;

    let ctx = CancellationToken::new();
    let (err_tx, mut err_rx) = mpsc::channel(config.kafka.error_channel_capacity.max(1));
    let client = RdKafkaClient::new(&config.kafka, &options);
    let producer = KafkaProducer::new(
        &ctx,
        Box::new(client),
        Box::new(admin),
        &options,
        err_tx,
        config.changefeed.clone(),
        Role::Processor,
    )?;

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut unflushed = 0usize;
    let mut outcome = Ok(());

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            Some(err) = err_rx.recv() => {
                error!(error = %err, "kafka producer failed");
                outcome = Err(err.into());
                break;
            }
            line = lines.next() => line,
        };

        let Some(line) = line else {
            break;
        };
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let record: InputRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "skipping malformed input line");
                continue;
            }
        };
        let value = serde_json::to_vec(&record.value)?;
        let message = Message::new(record.key.unwrap_or_default(), value);

        if message.value.len() > options.max_message_bytes as usize {
            warn!(
                size = message.value.len(),
                max_message_bytes = options.max_message_bytes,
                "skipping oversized message"
            );
            continue;
        }

        if record.broadcast {
            producer
                .sync_broadcast_message(&ctx, &topic, options.partition_num, message)
                .await?;
            continue;
        }

        producer
            .async_send_message(&ctx, &topic, record.partition.unwrap_or(-1), message)
            .await?;
        unflushed += 1;
        if unflushed >= args.flush_every {
            producer.flush(&ctx).await?;
            unflushed = 0;
        }
    }

    if outcome.is_ok() && unflushed > 0 {
        if let Err(e) = producer.flush(&ctx).await {
            warn!(error = %e, "final flush did not complete");
        }
    }

    producer.close().await?;
    ctx.cancel();
    info!("kafka-sink stopped");

    outcome
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("kafka_sink=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kafka_sink=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
