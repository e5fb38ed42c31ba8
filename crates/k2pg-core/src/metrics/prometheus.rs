//! Prometheus metrics export.

use crate::error::{FlushError, SinkError};
use crate::pool::{Job, LoggingObserver, PoolObserver};
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bounds of the flush-size histogram buckets, in records.
const FLUSH_SIZE_BUCKETS: [u64; 7] = [1, 10, 50, 100, 250, 500, 1000];

/// Error categories for labeled metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    /// Broker poll or offset store failures
    Kafka,
    /// Sink rejected a batch
    Sink,
    /// Sink skipped because its circuit was open
    CircuitOpen,
    /// A message could not be turned into a record
    Conversion,
}

impl ErrorType {
    const ALL: [ErrorType; 4] = [
        ErrorType::Kafka,
        ErrorType::Sink,
        ErrorType::CircuitOpen,
        ErrorType::Conversion,
    ];

    /// Get the label value for Prometheus export.
    pub fn as_label(&self) -> &'static str {
        match self {
            ErrorType::Kafka => "kafka",
            ErrorType::Sink => "sink",
            ErrorType::CircuitOpen => "circuit_open",
            ErrorType::Conversion => "conversion",
        }
    }

    fn index(&self) -> usize {
        match self {
            ErrorType::Kafka => 0,
            ErrorType::Sink => 1,
            ErrorType::CircuitOpen => 2,
            ErrorType::Conversion => 3,
        }
    }

    /// Category of a flush failure.
    pub fn of(cause: &FlushError) -> Self {
        match cause {
            FlushError::Sink(SinkError::CircuitOpen(_)) => ErrorType::CircuitOpen,
            FlushError::Sink(_) => ErrorType::Sink,
            FlushError::Conversion(_) => ErrorType::Conversion,
        }
    }
}

/// Snapshot of the flush-size histogram.
#[derive(Debug, Clone)]
pub struct FlushSizeHistogram {
    /// Sum of all observed batch sizes
    pub sum: u64,
    /// Number of observations
    pub count: u64,
    /// Cumulative counts per upper bound
    pub buckets: Vec<(u64, u64)>,
}

/// Pool and consumer counters, exported in Prometheus text format.
///
/// Registered with the pool as its [`PoolObserver`], so every flush outcome
/// is counted without the pool knowing about metrics.
#[derive(Default)]
pub struct IngestionMetrics {
    // === COUNTERS ===
    messages_consumed: AtomicU64,
    records_flushed: AtomicU64,
    batches_flushed: AtomicU64,
    errors_total: AtomicU64,
    errors_by_type: [AtomicU64; 4],
    retries_scheduled: AtomicU64,
    jobs_dropped: AtomicU64,
    submissions_rejected: AtomicU64,

    // === GAUGES ===
    queue_depth: AtomicU64,
    live_workers: AtomicU64,
    pending_retries: AtomicU64,

    // === HISTOGRAM: flush_size_records ===
    flush_size_sum: AtomicU64,
    flush_size_count: AtomicU64,
    /// Non-cumulative counts; the last slot is +Inf
    flush_size_buckets: [AtomicU64; 8],

    /// Sum of retry delays, for average backoff
    retry_delay_ms_total: AtomicU64,
}

impl IngestionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    // === COUNTER RECORDING ===

    /// Record a message received from the source.
    pub fn record_message(&self) {
        self.messages_consumed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job the pool refused because it was closed.
    pub fn record_rejection(&self) {
        self.submissions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error with a specific type label.
    pub fn record_error(&self, error_type: ErrorType) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        self.errors_by_type[error_type.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful flush of `records` records.
    pub fn record_flush(&self, records: usize) {
        let records = records as u64;
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.records_flushed.fetch_add(records, Ordering::Relaxed);

        self.flush_size_sum.fetch_add(records, Ordering::Relaxed);
        self.flush_size_count.fetch_add(1, Ordering::Relaxed);
        let slot = FLUSH_SIZE_BUCKETS
            .iter()
            .position(|bound| records <= *bound)
            .unwrap_or(FLUSH_SIZE_BUCKETS.len());
        self.flush_size_buckets[slot].fetch_add(1, Ordering::Relaxed);
    }

    /// Update pool gauges.
    pub fn set_pool_gauges(&self, queue_depth: usize, live_workers: usize, pending_retries: usize) {
        self.queue_depth
            .store(queue_depth as u64, Ordering::Relaxed);
        self.live_workers
            .store(live_workers as u64, Ordering::Relaxed);
        self.pending_retries
            .store(pending_retries as u64, Ordering::Relaxed);
    }

    // === GETTERS ===

    pub fn messages_consumed(&self) -> u64 {
        self.messages_consumed.load(Ordering::Relaxed)
    }

    pub fn records_flushed(&self) -> u64 {
        self.records_flushed.load(Ordering::Relaxed)
    }

    pub fn batches_flushed(&self) -> u64 {
        self.batches_flushed.load(Ordering::Relaxed)
    }

    pub fn errors_total(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    pub fn errors_by_type(&self, error_type: ErrorType) -> u64 {
        self.errors_by_type[error_type.index()].load(Ordering::Relaxed)
    }

    pub fn retries_scheduled(&self) -> u64 {
        self.retries_scheduled.load(Ordering::Relaxed)
    }

    pub fn jobs_dropped(&self) -> u64 {
        self.jobs_dropped.load(Ordering::Relaxed)
    }

    pub fn submissions_rejected(&self) -> u64 {
        self.submissions_rejected.load(Ordering::Relaxed)
    }

    /// Flush-size histogram with cumulative bucket counts.
    pub fn flush_size_histogram(&self) -> FlushSizeHistogram {
        let mut cumulative = 0;
        let buckets = FLUSH_SIZE_BUCKETS
            .iter()
            .enumerate()
            .map(|(i, bound)| {
                cumulative += self.flush_size_buckets[i].load(Ordering::Relaxed);
                (*bound, cumulative)
            })
            .collect();

        FlushSizeHistogram {
            sum: self.flush_size_sum.load(Ordering::Relaxed),
            count: self.flush_size_count.load(Ordering::Relaxed),
            buckets,
        }
    }

    /// Average delay of scheduled retries.
    pub fn average_retry_delay(&self) -> Duration {
        let count = self.retries_scheduled();
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.retry_delay_ms_total.load(Ordering::Relaxed) / count)
    }

    /// Export all metrics in Prometheus text format.
    ///
    /// # Example
    /// ```
    /// use k2pg_core::metrics::IngestionMetrics;
    ///
    /// let metrics = IngestionMetrics::new();
    /// metrics.record_message();
    /// let text = metrics.export_prometheus_text();
    /// assert!(text.contains("k2pg_messages_consumed_total 1"));
    /// ```
    pub fn export_prometheus_text(&self) -> String {
        self.export_prometheus_text_with_prefix("k2pg")
    }

    /// Export metrics in Prometheus text format with a custom name prefix.
    pub fn export_prometheus_text_with_prefix(&self, prefix: &str) -> String {
        let mut out = String::with_capacity(4096);

        // === COUNTERS ===
        metric(
            &mut out,
            prefix,
            "messages_consumed_total",
            "counter",
            "Messages received from Kafka",
            self.messages_consumed(),
        );
        metric(
            &mut out,
            prefix,
            "records_flushed_total",
            "counter",
            "Records persisted to PostgreSQL",
            self.records_flushed(),
        );
        metric(
            &mut out,
            prefix,
            "batches_flushed_total",
            "counter",
            "Batches persisted to PostgreSQL",
            self.batches_flushed(),
        );
        metric(
            &mut out,
            prefix,
            "errors_total",
            "counter",
            "Errors encountered",
            self.errors_total(),
        );

        let _ = writeln!(out, "# HELP {prefix}_errors Errors by type");
        let _ = writeln!(out, "# TYPE {prefix}_errors counter");
        for error_type in ErrorType::ALL {
            let _ = writeln!(
                out,
                "{prefix}_errors{{type=\"{}\"}} {}",
                error_type.as_label(),
                self.errors_by_type(error_type)
            );
        }
        out.push('\n');

        metric(
            &mut out,
            prefix,
            "retries_scheduled_total",
            "counter",
            "Jobs scheduled for another flush attempt",
            self.retries_scheduled(),
        );
        metric(
            &mut out,
            prefix,
            "jobs_dropped_total",
            "counter",
            "Jobs dropped after exhausting retries",
            self.jobs_dropped(),
        );
        metric(
            &mut out,
            prefix,
            "submissions_rejected_total",
            "counter",
            "Jobs rejected by a closed pool",
            self.submissions_rejected(),
        );

        // === GAUGES ===
        metric(
            &mut out,
            prefix,
            "queue_depth",
            "gauge",
            "Jobs waiting in the shared queue",
            self.queue_depth.load(Ordering::Relaxed),
        );
        metric(
            &mut out,
            prefix,
            "live_workers",
            "gauge",
            "Running worker tasks",
            self.live_workers.load(Ordering::Relaxed),
        );
        metric(
            &mut out,
            prefix,
            "pending_retries",
            "gauge",
            "Retries waiting for their backoff delay",
            self.pending_retries.load(Ordering::Relaxed),
        );

        // === HISTOGRAM: flush_size_records ===
        let hist = self.flush_size_histogram();
        let _ = writeln!(
            out,
            "# HELP {prefix}_flush_size_records Records per successful flush"
        );
        let _ = writeln!(out, "# TYPE {prefix}_flush_size_records histogram");
        for (le, count) in &hist.buckets {
            let _ = writeln!(
                out,
                "{prefix}_flush_size_records_bucket{{le=\"{le}\"}} {count}"
            );
        }
        let _ = writeln!(
            out,
            "{prefix}_flush_size_records_bucket{{le=\"+Inf\"}} {}",
            hist.count
        );
        let _ = writeln!(out, "{prefix}_flush_size_records_sum {}", hist.sum);
        let _ = writeln!(out, "{prefix}_flush_size_records_count {}", hist.count);

        out
    }
}

fn metric(out: &mut String, prefix: &str, name: &str, kind: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {prefix}_{name} {help}");
    let _ = writeln!(out, "# TYPE {prefix}_{name} {kind}");
    let _ = writeln!(out, "{prefix}_{name} {value}");
    out.push('\n');
}

impl PoolObserver for IngestionMetrics {
    fn on_success(&self, batch_size: usize) {
        self.record_flush(batch_size);
    }

    fn on_error(&self, cause: &FlushError) {
        self.record_error(ErrorType::of(cause));
        LoggingObserver.on_error(cause);
    }

    fn on_retry(&self, _job: &Job, delay: Duration) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
        self.retry_delay_ms_total
            .fetch_add(delay.as_millis() as u64, Ordering::Relaxed);
    }

    fn on_dropped(&self, job: &Job) {
        self.jobs_dropped.fetch_add(1, Ordering::Relaxed);
        LoggingObserver.on_dropped(job);
    }
}
