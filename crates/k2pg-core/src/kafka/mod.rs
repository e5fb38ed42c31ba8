//! Kafka consumer-group source with acknowledgment-driven offset commits.

mod consumer;
mod offset;

pub use consumer::{KafkaAck, KafkaConsumerBuilder, KafkaSource, SourceContext};
pub use offset::OffsetTracker;
