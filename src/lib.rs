pub mod config;
pub mod error;

pub mod kafka;

pub use config::{ChangefeedId, Config, Role};
pub use error::{Error, Result};
pub use kafka::{KafkaProducer, Message, ProducerOptions};
