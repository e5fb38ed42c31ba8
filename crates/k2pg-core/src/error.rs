//! Error types for k2pg core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.

use thiserror::Error;

/// Result type alias for k2pg operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for k2pg.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Kafka-related error
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// Sink-related error
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// Worker pool error
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

/// Kafka-specific errors.
#[derive(Error, Debug)]
pub enum KafkaError {
    /// Failed to connect to broker
    #[error("Connection failed to {broker}: {message}")]
    ConnectionFailed { broker: String, message: String },

    /// Consumer group error
    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    /// Offset store failed
    #[error("Offset store failed: {0}")]
    OffsetStore(String),

    /// Producer error
    #[error("Producer error: {0}")]
    Producer(String),

    /// Consumer closed
    #[error("Consumer closed")]
    ConsumerClosed,
}

/// Errors reported by a batch sink.
///
/// Cloneable because a single failed batch is reported once per job.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    /// Could not reach the database
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Statement or transaction failed
    #[error("Write failed: {0}")]
    Write(String),

    /// Record could not be encoded for the sink
    #[error("Encoding failed: {0}")]
    Encoding(String),

    /// Circuit breaker is open, the sink was not called
    #[error("Circuit breaker open for sink {0}")]
    CircuitOpen(String),

    /// Generic sink error
    #[error("{0}")]
    Other(String),
}

/// Worker pool lifecycle errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    /// Operation is not valid in the current lifecycle state
    #[error("Invalid pool state: expected {expected}, found {actual}")]
    InvalidState { expected: String, actual: String },

    /// A worker task panicked or was aborted
    #[error("Worker {id} terminated abnormally: {message}")]
    WorkerFailed { id: usize, message: String },
}

/// Failure to derive a record from an inbound message.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    /// Header key is not valid UTF-8
    #[error("Header key at index {index} of {topic}/{partition}@{offset} is not valid UTF-8")]
    InvalidHeaderKey {
        topic: String,
        partition: i32,
        offset: i64,
        index: usize,
    },
}

/// Why a batch flush failed. Every job of the batch is retried with this cause.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlushError {
    /// The sink rejected the batch
    #[error("Sink rejected batch: {0}")]
    Sink(#[from] SinkError),

    /// Records could not be built from the buffered jobs
    #[error("Record conversion failed: {0}")]
    Conversion(#[from] RecordError),
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<sqlx::Error> for SinkError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed => SinkError::Connection(err.to_string()),
            other => SinkError::Write(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Sink(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("invalid value".into());
        assert_eq!(err.to_string(), "Configuration error: invalid value");

        let kafka_err = KafkaError::ConnectionFailed {
            broker: "localhost:9092".into(),
            message: "connection refused".into(),
        };
        let err: Error = kafka_err.into();
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_flush_error_wraps_sink_error() {
        let err: FlushError = SinkError::Write("deadlock detected".into()).into();
        assert_eq!(
            err.to_string(),
            "Sink rejected batch: Write failed: deadlock detected"
        );
    }

    #[test]
    fn test_record_error_display() {
        let err = RecordError::InvalidHeaderKey {
            topic: "events".into(),
            partition: 3,
            offset: 42,
            index: 1,
        };
        assert!(err.to_string().contains("events/3@42"));
    }

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::InvalidState {
            expected: "created".into(),
            actual: "stopped".into(),
        };
        assert!(err.to_string().contains("expected created"));
    }

    #[test]
    fn test_sqlx_pool_closed_is_connection_error() {
        let err: SinkError = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, SinkError::Connection(_)));
    }
}
