//! One-shot reconciliation of [`ProducerOptions`] against live broker metadata.

use std::collections::HashMap;
use tracing::{error, info, instrument, warn};

use super::client::{ClusterAdminClient, TopicDetail};
use super::options::{
    ProducerOptions, BROKER_MESSAGE_MAX_BYTES_CONFIG_NAME, DEFAULT_PARTITION_NUM,
    MIN_INSYNC_REPLICAS_CONFIG_NAME, TOPIC_MAX_MESSAGE_BYTES_CONFIG_NAME,
};
use crate::{Error, Result};

/// Adjusts `options` so the producer never exceeds what the broker accepts
/// for `topic`.
///
/// Settings that can be corrected safely (`max_message_bytes`,
/// `partition_num`) are rewritten in place. A replication factor below the
/// applicable `min.insync.replicas` is rejected, since the producer always
/// waits for acknowledgment from all in-sync replicas.
#[instrument(skip(admin, options), fields(topic = %topic))]
pub async fn adjust_options(
    admin: &dyn ClusterAdminClient,
    options: &mut ProducerOptions,
    topic: &str,
) -> Result<()> {
    let topics = admin.get_all_topics_meta().await?;

    validate_min_insync_replicas(admin, &topics, topic, options.replication_factor).await?;

    if let Some(info) = topics.get(topic) {
        let topic_max_message_bytes = get_topic_config(
            admin,
            info,
            TOPIC_MAX_MESSAGE_BYTES_CONFIG_NAME,
            BROKER_MESSAGE_MAX_BYTES_CONFIG_NAME,
        )
        .await?;
        let topic_max_message_bytes =
            parse_config(TOPIC_MAX_MESSAGE_BYTES_CONFIG_NAME, &topic_max_message_bytes)?;

        if topic_max_message_bytes < options.max_message_bytes {
            warn!(
                max_message_bytes = options.max_message_bytes,
                topic_max_message_bytes,
                "topic's `max.message.bytes` is less than `max-message-bytes`, using the topic's value"
            );
            options.max_message_bytes = topic_max_message_bytes;
        }

        if options.auto_create_topic {
            warn!(detail = ?info, "topic already exists, it will not be created");
        }

        if options.partition_num != 0 && options.partition_num != info.num_partitions {
            warn!(
                partition_num = options.partition_num,
                topic_partitions = info.num_partitions,
                "configured partition count differs from the topic, using the topic's partition count"
            );
        }
        options.partition_num = info.num_partitions;

        return Ok(());
    }

    let broker_message_max_bytes = admin
        .get_broker_config(BROKER_MESSAGE_MAX_BYTES_CONFIG_NAME)
        .await
        .inspect_err(|_| {
            warn!("cannot find `message.max.bytes` in the broker's configuration");
        })?;
    let broker_message_max_bytes =
        parse_config(BROKER_MESSAGE_MAX_BYTES_CONFIG_NAME, &broker_message_max_bytes)?;

    // A topic created later inherits the broker's `message.max.bytes`.
    if broker_message_max_bytes < options.max_message_bytes {
        warn!(
            max_message_bytes = options.max_message_bytes,
            broker_message_max_bytes,
            "broker's `message.max.bytes` is less than `max-message-bytes`, using the broker's value"
        );
        options.max_message_bytes = broker_message_max_bytes;
    }

    if options.partition_num == 0 {
        options.partition_num = DEFAULT_PARTITION_NUM;
        info!(
            partitions = options.partition_num,
            "partition count is not set, using the default partition count"
        );
    }

    Ok(())
}

/// Rejects a replication factor smaller than the topic's (or else the
/// broker's) `min.insync.replicas`. A broker that hides the key passes.
pub async fn validate_min_insync_replicas(
    admin: &dyn ClusterAdminClient,
    topics: &HashMap<String, TopicDetail>,
    topic: &str,
    replication_factor: i32,
) -> Result<()> {
    let (value, config_from) = match topics.get(topic) {
        Some(info) => (
            get_topic_config(
                admin,
                info,
                MIN_INSYNC_REPLICAS_CONFIG_NAME,
                MIN_INSYNC_REPLICAS_CONFIG_NAME,
            )
            .await,
            "topic",
        ),
        None => (
            admin.get_broker_config(MIN_INSYNC_REPLICAS_CONFIG_NAME).await,
            "broker",
        ),
    };

    let value = match value {
        Ok(value) => value,
        // Not visible on some managed Kafka offerings.
        Err(Error::BrokerConfigNotFound(_)) => return Ok(()),
        Err(e) => return Err(e),
    };
    let min_insync_replicas = parse_config(MIN_INSYNC_REPLICAS_CONFIG_NAME, &value)?;

    if replication_factor < min_insync_replicas {
        error!(
            replication_factor,
            min_insync_replicas,
            config_from,
            "`replication-factor` cannot be smaller than `min.insync.replicas`"
        );
        return Err(Error::InvalidConfig(format!(
            "the producer requires acknowledgment from all in-sync replicas and cannot deliver \
             messages when `replication-factor` ({}) is smaller than the `min.insync.replicas` ({}) of {}",
            replication_factor, min_insync_replicas, config_from
        )));
    }

    Ok(())
}

/// Looks up a topic-level override, falling back to the broker's value.
///
/// The two names differ for some settings, e.g. `max.message.bytes` on a
/// topic is `message.max.bytes` on a broker.
pub async fn get_topic_config(
    admin: &dyn ClusterAdminClient,
    detail: &TopicDetail,
    topic_config_name: &str,
    broker_config_name: &str,
) -> Result<String> {
    match detail.config_entries.get(topic_config_name) {
        Some(value) => Ok(value.clone()),
        None => admin.get_broker_config(broker_config_name).await,
    }
}

fn parse_config(name: &str, value: &str) -> Result<i32> {
    value
        .trim()
        .parse::<i32>()
        .map_err(|source| Error::InvalidConfigValue {
            name: name.to_string(),
            value: value.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::MockCluster;

    fn options(
        max_message_bytes: i32,
        partition_num: i32,
        replication_factor: i32,
    ) -> ProducerOptions {
        ProducerOptions {
            max_message_bytes,
            partition_num,
            replication_factor,
            auto_create_topic: true,
        }
    }

    #[tokio::test]
    async fn test_existing_topic_caps_max_message_bytes() {
        let cluster = MockCluster::new();
        cluster.set_broker_config(BROKER_MESSAGE_MAX_BYTES_CONFIG_NAME, "1048576");
        cluster.set_broker_config(MIN_INSYNC_REPLICAS_CONFIG_NAME, "1");
        cluster.add_topic("orders", 2, [(TOPIC_MAX_MESSAGE_BYTES_CONFIG_NAME, "900")]);

        let mut opts = options(1000, 0, 1);
        adjust_options(&cluster.admin(), &mut opts, "orders").await.unwrap();

        assert_eq!(opts.max_message_bytes, 900);
        assert_eq!(opts.partition_num, 2);
    }

    #[tokio::test]
    async fn test_existing_topic_keeps_smaller_max_message_bytes() {
        let cluster = MockCluster::new();
        cluster.set_broker_config(MIN_INSYNC_REPLICAS_CONFIG_NAME, "1");
        cluster.add_topic("orders", 4, [(TOPIC_MAX_MESSAGE_BYTES_CONFIG_NAME, "2048")]);

        let mut opts = options(1000, 0, 1);
        adjust_options(&cluster.admin(), &mut opts, "orders").await.unwrap();

        assert_eq!(opts.max_message_bytes, 1000);
    }

    #[tokio::test]
    async fn test_existing_topic_falls_back_to_broker_max_bytes() {
        let cluster = MockCluster::new();
        cluster.set_broker_config(BROKER_MESSAGE_MAX_BYTES_CONFIG_NAME, "700");
        cluster.set_broker_config(MIN_INSYNC_REPLICAS_CONFIG_NAME, "1");
        cluster.add_topic("orders", 1, std::iter::empty::<(&str, &str)>());

        let mut opts = options(1000, 0, 1);
        adjust_options(&cluster.admin(), &mut opts, "orders").await.unwrap();

        assert_eq!(opts.max_message_bytes, 700);
    }

    #[tokio::test]
    async fn test_existing_topic_overrides_partition_num() {
        let cluster = MockCluster::new();
        cluster.set_broker_config(MIN_INSYNC_REPLICAS_CONFIG_NAME, "1");
        cluster.add_topic("orders", 5, [(TOPIC_MAX_MESSAGE_BYTES_CONFIG_NAME, "4096")]);

        let mut opts = options(1000, 12, 1);
        adjust_options(&cluster.admin(), &mut opts, "orders").await.unwrap();

        assert_eq!(opts.partition_num, 5);
    }

    #[tokio::test]
    async fn test_missing_topic_uses_broker_limit_and_default_partitions() {
        let cluster = MockCluster::new();
        cluster.set_broker_config(BROKER_MESSAGE_MAX_BYTES_CONFIG_NAME, "500");
        cluster.set_broker_config(MIN_INSYNC_REPLICAS_CONFIG_NAME, "1");

        let mut opts = options(1000, 0, 1);
        adjust_options(&cluster.admin(), &mut opts, "orders").await.unwrap();

        assert_eq!(opts.max_message_bytes, 500);
        assert_eq!(opts.partition_num, DEFAULT_PARTITION_NUM);
    }

    #[tokio::test]
    async fn test_missing_topic_keeps_user_partition_num() {
        let cluster = MockCluster::new();
        cluster.set_broker_config(BROKER_MESSAGE_MAX_BYTES_CONFIG_NAME, "5000");
        cluster.set_broker_config(MIN_INSYNC_REPLICAS_CONFIG_NAME, "1");

        let mut opts = options(1000, 8, 1);
        adjust_options(&cluster.admin(), &mut opts, "orders").await.unwrap();

        assert_eq!(opts.max_message_bytes, 1000);
        assert_eq!(opts.partition_num, 8);
    }

    #[tokio::test]
    async fn test_missing_topic_without_broker_max_bytes_fails() {
        let cluster = MockCluster::new();
        cluster.set_broker_config(MIN_INSYNC_REPLICAS_CONFIG_NAME, "1");

        let mut opts = options(1000, 0, 1);
        let err = adjust_options(&cluster.admin(), &mut opts, "orders")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::BrokerConfigNotFound(name) if name == BROKER_MESSAGE_MAX_BYTES_CONFIG_NAME
        ));
    }

    #[tokio::test]
    async fn test_replication_factor_below_topic_min_insync_is_rejected() {
        let cluster = MockCluster::new();
        cluster.set_broker_config(MIN_INSYNC_REPLICAS_CONFIG_NAME, "1");
        cluster.add_topic(
            "orders",
            3,
            [
                (MIN_INSYNC_REPLICAS_CONFIG_NAME, "2"),
                (TOPIC_MAX_MESSAGE_BYTES_CONFIG_NAME, "4096"),
            ],
        );

        let mut opts = options(1000, 0, 1);
        let err = adjust_options(&cluster.admin(), &mut opts, "orders")
            .await
            .unwrap_err();

        assert!(err.is_config_invalid());
        assert!(err.to_string().contains("of topic"));
        // Nothing was adjusted before the rejection.
        assert_eq!(opts.max_message_bytes, 1000);
        assert_eq!(opts.partition_num, 0);
    }

    #[tokio::test]
    async fn test_replication_factor_below_broker_min_insync_is_rejected() {
        let cluster = MockCluster::new();
        cluster.set_broker_config(BROKER_MESSAGE_MAX_BYTES_CONFIG_NAME, "4096");
        cluster.set_broker_config(MIN_INSYNC_REPLICAS_CONFIG_NAME, "3");

        let mut opts = options(1000, 0, 2);
        let err = adjust_options(&cluster.admin(), &mut opts, "orders")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidConfig(ref msg) if msg.contains("of broker")));
    }

    #[tokio::test]
    async fn test_hidden_min_insync_replicas_is_tolerated() {
        let cluster = MockCluster::new();
        cluster.set_broker_config(BROKER_MESSAGE_MAX_BYTES_CONFIG_NAME, "4096");

        let mut opts = options(1000, 0, 1);
        adjust_options(&cluster.admin(), &mut opts, "orders").await.unwrap();

        assert_eq!(opts.partition_num, DEFAULT_PARTITION_NUM);
    }

    #[tokio::test]
    async fn test_hidden_min_insync_replicas_on_existing_topic_is_tolerated() {
        // No topic override, and the broker fallback hides the key too.
        let cluster = MockCluster::new();
        cluster.add_topic("orders", 2, [(TOPIC_MAX_MESSAGE_BYTES_CONFIG_NAME, "100")]);

        let mut opts = options(1000, 0, 3);
        adjust_options(&cluster.admin(), &mut opts, "orders").await.unwrap();

        assert_eq!(opts.max_message_bytes, 100);
        assert_eq!(opts.partition_num, 2);
    }

    #[tokio::test]
    async fn test_malformed_broker_value_fails() {
        let cluster = MockCluster::new();
        cluster.set_broker_config(MIN_INSYNC_REPLICAS_CONFIG_NAME, "1");
        cluster.set_broker_config(BROKER_MESSAGE_MAX_BYTES_CONFIG_NAME, "lots");

        let mut opts = options(1000, 0, 1);
        let err = adjust_options(&cluster.admin(), &mut opts, "orders")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::InvalidConfigValue { ref name, ref value, .. }
                if name == BROKER_MESSAGE_MAX_BYTES_CONFIG_NAME && value == "lots"
        ));
        assert_eq!(opts.max_message_bytes, 1000);
    }

    #[tokio::test]
    async fn test_malformed_min_insync_replicas_fails() {
        let cluster = MockCluster::new();
        cluster.set_broker_config(MIN_INSYNC_REPLICAS_CONFIG_NAME, "two");
        cluster.set_broker_config(BROKER_MESSAGE_MAX_BYTES_CONFIG_NAME, "4096");

        let mut opts = options(1000, 0, 1);
        let err = adjust_options(&cluster.admin(), &mut opts, "orders")
            .await
            .unwrap_err();

        assert!(err.is_config_invalid());
    }

    #[tokio::test]
    async fn test_topic_listing_failure_propagates() {
        let cluster = MockCluster::new();
        cluster.fail_topic_listing("metadata request timed out");

        let mut opts = options(1000, 0, 1);
        let err = adjust_options(&cluster.admin(), &mut opts, "orders")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Broker(_)));
    }

    #[tokio::test]
    async fn test_get_topic_config_prefers_topic_override() {
        let cluster = MockCluster::new();
        cluster.set_broker_config(BROKER_MESSAGE_MAX_BYTES_CONFIG_NAME, "100");
        let mut detail = TopicDetail::default();
        detail
            .config_entries
            .insert(TOPIC_MAX_MESSAGE_BYTES_CONFIG_NAME.to_string(), "42".to_string());

        let admin = cluster.admin();
        let value = get_topic_config(
            &admin,
            &detail,
            TOPIC_MAX_MESSAGE_BYTES_CONFIG_NAME,
            BROKER_MESSAGE_MAX_BYTES_CONFIG_NAME,
        )
        .await
        .unwrap();
        assert_eq!(value, "42");

        detail.config_entries.clear();
        let value = get_topic_config(
            &admin,
            &detail,
            TOPIC_MAX_MESSAGE_BYTES_CONFIG_NAME,
            BROKER_MESSAGE_MAX_BYTES_CONFIG_NAME,
        )
        .await
        .unwrap();
        assert_eq!(value, "100");
    }
}
