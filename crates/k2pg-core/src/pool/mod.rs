//! Batching worker pool.
//!
//! Jobs enter a shared bounded queue through [`WorkerPool::submit`]. A fixed
//! set of workers drains the queue, each into its own batch, and flushes a
//! batch when it reaches `batch_size` or when the worker's flush timer fires.
//! A successful flush acknowledges every job in the batch; a failed one sends
//! each job through the retry scheduler.
//!
//! ```text
//! source ──submit──▶ JobQueue ──pop──▶ worker[i] ──flush──▶ BatchSink
//!                       ▲                  │
//!                       └── retry (delay) ◀┘ on failure
//! ```
//!
//! Delivery is at-least-once: a job is acknowledged only after the sink
//! reports success, and sinks must tolerate re-delivery of a record.

pub mod batch;
pub mod job;
pub mod observer;
pub mod queue;
pub mod record;
pub mod retry;
mod worker;

pub use batch::BatchAccumulator;
pub use job::{AckHandle, Job, NoopAck};
pub use observer::{CallbackObserver, LoggingObserver, PoolObserver};
pub use queue::JobQueue;
pub use record::{InboundMessage, Record};
pub use retry::{BackoffPolicy, RetryOutcome, RetryScheduler};

use crate::error::{PoolError, Result};
use crate::sink::BatchSink;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use worker::{LiveWorkerGuard, Worker};

const DEFAULT_WORKER_COUNT: usize = 32;
const DEFAULT_QUEUE_CAPACITY: usize = 4096;
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(25);
const DEFAULT_MAX_RETRIES: u32 = 5;

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Number of worker tasks
    pub worker_count: usize,
    /// Capacity of the shared job queue
    pub queue_capacity: usize,
    /// Jobs per batch before a size-triggered flush
    pub batch_size: usize,
    /// Period of each worker's flush timer
    pub flush_interval: Duration,
    /// Retries per job before it is dropped
    pub max_retries: u32,
    /// Delay schedule between retries
    pub backoff: BackoffPolicy,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl PoolOptions {
    /// Replace every zero value with its default.
    pub fn normalized(mut self) -> Self {
        if self.worker_count == 0 {
            self.worker_count = DEFAULT_WORKER_COUNT;
        }
        if self.queue_capacity == 0 {
            self.queue_capacity = DEFAULT_QUEUE_CAPACITY;
        }
        if self.batch_size == 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.flush_interval.is_zero() {
            self.flush_interval = DEFAULT_FLUSH_INTERVAL;
        }
        if self.max_retries == 0 {
            self.max_retries = DEFAULT_MAX_RETRIES;
        }
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Pool lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Queue allocated, no workers
    Created,
    /// Workers running
    Running,
    /// Queue closed, workers draining
    Draining,
    /// Every worker has exited
    Stopped,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolState::Created => "created",
            PoolState::Running => "running",
            PoolState::Draining => "draining",
            PoolState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Fixed-size pool of batching workers in front of a [`BatchSink`].
pub struct WorkerPool {
    options: PoolOptions,
    sink: Arc<dyn BatchSink>,
    observer: Arc<dyn PoolObserver>,
    queue: Arc<JobQueue<Job>>,
    state: Mutex<PoolState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    live_workers: Arc<AtomicUsize>,
    pending_retries: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Create a pool. Zero-valued options are replaced by defaults.
    pub fn new(
        sink: Arc<dyn BatchSink>,
        options: PoolOptions,
        observer: Arc<dyn PoolObserver>,
    ) -> Self {
        let options = options.normalized();
        let queue = Arc::new(JobQueue::new(options.queue_capacity));
        Self {
            options,
            sink,
            observer,
            queue,
            state: Mutex::new(PoolState::Created),
            workers: Mutex::new(Vec::new()),
            live_workers: Arc::new(AtomicUsize::new(0)),
            pending_retries: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a pool that only logs flush failures.
    pub fn with_logging(sink: Arc<dyn BatchSink>, options: PoolOptions) -> Self {
        Self::new(sink, options, Arc::new(LoggingObserver))
    }

    /// Spawn the workers. Only valid once, from `Created`.
    ///
    /// Cancelling `cancel` makes every worker flush its buffer and exit, and
    /// abandons retries still waiting on their delay.
    pub fn start(&self, cancel: CancellationToken) -> Result<()> {
        let mut state = self.state.lock();
        if *state != PoolState::Created {
            return Err(PoolError::InvalidState {
                expected: PoolState::Created.to_string(),
                actual: state.to_string(),
            }
            .into());
        }

        let retry = RetryScheduler::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.observer),
            self.options.backoff.clone(),
            self.options.max_retries,
            cancel.clone(),
            Arc::clone(&self.pending_retries),
        );

        let mut workers = self.workers.lock();
        for id in 0..self.options.worker_count {
            let worker = Worker::new(
                id,
                Arc::clone(&self.queue),
                Arc::clone(&self.sink),
                Arc::clone(&self.observer),
                retry.clone(),
                self.options.batch_size,
                self.options.flush_interval,
                cancel.clone(),
            );
            let live = LiveWorkerGuard::new(Arc::clone(&self.live_workers));
            workers.push(tokio::spawn(worker.run(live)));
        }

        *state = PoolState::Running;
        info!(
            sink = self.sink.name(),
            workers = self.options.worker_count,
            queue_capacity = self.options.queue_capacity,
            batch_size = self.options.batch_size,
            flush_interval_ms = self.options.flush_interval.as_millis() as u64,
            max_retries = self.options.max_retries,
            "Worker pool started"
        );
        Ok(())
    }

    /// Enqueue a job, waiting while the queue is full.
    ///
    /// Returns `false` once the pool is closed, including for callers that
    /// were waiting on a full queue when it closed.
    pub async fn submit(&self, job: Job) -> bool {
        match self.queue.push(job).await {
            Ok(()) => true,
            Err(job) => {
                debug!(
                    topic = %job.message().topic,
                    partition = job.message().partition,
                    offset = job.message().offset,
                    "Submission rejected, pool is closed"
                );
                false
            }
        }
    }

    /// Close the queue and wait for every worker to drain and exit.
    ///
    /// Idempotent: calls after the first return immediately. A pool stopped
    /// before [`start`](Self::start) has no workers, so jobs already queued
    /// are discarded without acknowledgment.
    pub async fn stop(&self) {
        let previous = {
            let mut state = self.state.lock();
            match *state {
                PoolState::Created | PoolState::Running => {
                    std::mem::replace(&mut *state, PoolState::Draining)
                }
                PoolState::Draining | PoolState::Stopped => return,
            }
        };

        self.queue.close();

        if previous == PoolState::Created {
            // No workers to drain: queued jobs are discarded unacknowledged.
            let discarded = self.queue.drain();
            if !discarded.is_empty() {
                warn!(
                    discarded = discarded.len(),
                    "Worker pool stopped before start, discarding queued jobs"
                );
            }
            *self.state.lock() = PoolState::Stopped;
            return;
        }

        info!(queued = self.queue.len(), "Worker pool draining");

        let handles = std::mem::take(&mut *self.workers.lock());
        for (id, handle) in handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                let err = PoolError::WorkerFailed {
                    id,
                    message: e.to_string(),
                };
                error!(error = %err, "Worker did not exit cleanly");
            }
        }

        *self.state.lock() = PoolState::Stopped;
        info!(
            pending_retries = self.pending_retries(),
            "Worker pool stopped"
        );
    }

    pub fn state(&self) -> PoolState {
        *self.state.lock()
    }

    /// Workers that have been spawned and not yet exited.
    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }

    /// Retries waiting for their backoff delay.
    pub fn pending_retries(&self) -> usize {
        self.pending_retries.load(Ordering::SeqCst)
    }

    /// Jobs currently queued.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }
}
