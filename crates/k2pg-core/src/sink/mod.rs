//! Destinations for flushed batches.

pub mod guarded;
pub mod postgres;

pub use guarded::GuardedSink;
pub use postgres::PostgresSink;

use crate::error::SinkError;
use crate::pool::Record;
use async_trait::async_trait;

/// A destination that durably writes batches of records.
///
/// Shared by every worker as `Arc<dyn BatchSink>`, so implementations must
/// tolerate concurrent calls.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Persist `records` as one unit.
    ///
    /// On `Ok` every record is durable. On `Err` none of the batch may be
    /// assumed persisted, and the caller will retry every record. Writes
    /// must be idempotent per `(topic, partition, offset)` because a retried
    /// batch may contain records already written. An empty vector is a
    /// trivial success.
    async fn process_batch(&self, records: Vec<Record>) -> Result<(), SinkError>;

    /// Short name used in logs and health reports.
    fn name(&self) -> &str {
        "sink"
    }
}
