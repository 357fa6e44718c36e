//! Error types and result handling for kafka-sink.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use kafka_sink::{Error, Result};
//!
//! fn check_replication(replication_factor: i32, min_insync: i32) -> Result<()> {
//!     if replication_factor < min_insync {
//!         return Err(Error::InvalidConfig("replication factor too small".to_string()));
//!     }
//!     Ok(())
//! }
//!
//! match check_replication(1, 2) {
//!     Ok(()) => println!("ok"),
//!     Err(e) if e.is_config_invalid() => eprintln!("rejected: {}", e),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use std::num::ParseIntError;

use thiserror::Error;

/// The main error type for kafka-sink operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be loaded, typically from a bad file or
    /// environment variable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The producer settings conflict with the broker in a way that cannot be
    /// corrected automatically.
    #[error("Invalid Kafka configuration: {0}")]
    InvalidConfig(String),

    /// A numeric configuration value reported by the broker is malformed.
    #[error("Invalid value {value:?} for config `{name}`: {source}")]
    InvalidConfigValue {
        /// Name of the configuration entry
        name: String,
        /// The raw value as reported by the broker
        value: String,
        /// Underlying parse failure
        #[source]
        source: ParseIntError,
    },

    /// The broker does not expose the requested configuration key.
    ///
    /// Some managed Kafka flavors hide keys such as `min.insync.replicas`.
    #[error("Broker configuration `{0}` not found")]
    BrokerConfigNotFound(String),

    /// Kafka client or producer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Broker-facing failure reported without an rdkafka error.
    #[error("Broker error: {0}")]
    Broker(String),

    /// The broker client failed to build an async or sync producer.
    #[error("Failed to create Kafka producer: {0}")]
    NewProducer(#[source] Box<Error>),

    /// A message submitted asynchronously was rejected by the broker.
    #[error("Async send to {topic}[{partition}] failed: {source}")]
    AsyncSendMessage {
        /// Destination topic
        topic: String,
        /// Destination partition
        partition: i32,
        /// Failure reported on the error stream
        #[source]
        source: Box<Error>,
    },

    /// A synchronous broadcast failed.
    #[error("Sync send failed: {0}")]
    SyncSendMessage(#[source] Box<Error>),

    /// The producer shut down before all in-flight messages were
    /// acknowledged, or another flush took over the waiter slot.
    #[error("Flush did not complete, inflight messages remain unacknowledged")]
    FlushUnfinished,

    /// The caller's cancellation token fired.
    #[error("Operation cancelled")]
    Cancelled,

    /// A broker resource was used after it had been closed.
    #[error("Kafka resource already closed")]
    Closed,

    /// Failure injected through the test-only failpoint.
    #[error("Injected failure: {0}")]
    Injected(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error belongs to the fatal configuration-invalid class.
    pub fn is_config_invalid(&self) -> bool {
        matches!(self, Error::InvalidConfig(_) | Error::InvalidConfigValue { .. })
    }

    /// Whether this error only reports caller-side cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// A convenient Result type alias for kafka-sink operations.
///
/// This is equivalent to `std::result::Result<T, kafka_sink::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
