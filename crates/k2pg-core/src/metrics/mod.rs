//! Ingestion metrics.

mod prometheus;

pub use prometheus::{ErrorType, FlushSizeHistogram, IngestionMetrics};
