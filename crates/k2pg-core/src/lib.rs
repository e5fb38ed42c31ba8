//! K2PG Core - Kafka to Postgres batching ingestion
//!
//! This library consumes messages from a Kafka consumer group and persists
//! them into a Postgres table through a pool of batching workers with:
//!
//! - Size- and time-triggered batch flushes
//! - At-least-once delivery: offsets are stored only after a batch commits
//! - Exponential-backoff retries that never block a worker
//! - Graceful shutdown that flushes every buffered message

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod health;
pub mod kafka;
pub mod metrics;
pub mod pool;
pub mod sink;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use error::{FlushError, KafkaError, PoolError, RecordError, SinkError};
pub use pool::{InboundMessage, Job, PoolObserver, PoolOptions, PoolState, Record, WorkerPool};
pub use sink::BatchSink;
