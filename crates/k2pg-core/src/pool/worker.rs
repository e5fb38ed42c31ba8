//! Worker task: drain the shared queue into a private batch and flush it.

use super::batch::{to_records, BatchAccumulator};
use super::job::Job;
use super::observer::PoolObserver;
use super::queue::JobQueue;
use super::retry::RetryScheduler;
use crate::error::FlushError;
use crate::sink::BatchSink;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(crate) struct Worker {
    id: usize,
    queue: Arc<JobQueue<Job>>,
    sink: Arc<dyn BatchSink>,
    observer: Arc<dyn PoolObserver>,
    retry: RetryScheduler,
    batch: BatchAccumulator,
    flush_interval: Duration,
    cancel: CancellationToken,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        queue: Arc<JobQueue<Job>>,
        sink: Arc<dyn BatchSink>,
        observer: Arc<dyn PoolObserver>,
        retry: RetryScheduler,
        batch_size: usize,
        flush_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            queue,
            sink,
            observer,
            retry,
            batch: BatchAccumulator::new(batch_size),
            flush_interval,
            cancel,
        }
    }

    /// Run until the token is cancelled or the queue is closed and drained.
    /// Either way the buffer gets one last flush.
    pub(crate) async fn run(mut self, live: LiveWorkerGuard) {
        let _live = live;
        let mut ticker = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(worker = self.id, "Worker started");

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!(worker = self.id, buffered = self.batch.len(), "Worker cancelled");
                    self.flush().await;
                    break;
                }

                _ = ticker.tick() => {
                    self.flush().await;
                }

                next = self.queue.pop() => match next {
                    Some(job) => {
                        if self.batch.push(job) {
                            self.flush().await;
                        }
                    }
                    None => {
                        self.flush().await;
                        break;
                    }
                },
            }
        }

        debug!(worker = self.id, "Worker stopped");
    }

    /// Flush the buffer. Empty buffers never reach the sink.
    pub(crate) async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let jobs = self.batch.take();
        let result = match to_records(&jobs) {
            Ok(records) => self
                .sink
                .process_batch(records)
                .await
                .map_err(FlushError::from),
            Err(e) => Err(FlushError::from(e)),
        };

        match result {
            Ok(()) => {
                let count = jobs.len();
                for job in jobs {
                    job.acknowledge();
                }
                self.observer.on_success(count);
                debug!(worker = self.id, records = count, "Batch flushed");
            }
            Err(cause) => {
                warn!(
                    worker = self.id,
                    jobs = jobs.len(),
                    error = %cause,
                    "Batch flush failed, scheduling retries"
                );
                for job in jobs {
                    self.retry.schedule(job, &cause);
                }
            }
        }
    }

    #[cfg(test)]
    fn buffer(&mut self, job: Job) -> bool {
        self.batch.push(job)
    }
}

/// Holds one slot in the pool's live-worker count.
pub(crate) struct LiveWorkerGuard(Arc<AtomicUsize>);

impl LiveWorkerGuard {
    pub(crate) fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for LiveWorkerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use crate::pool::job::AckHandle;
    use crate::pool::observer::CallbackObserver;
    use crate::pool::record::{InboundMessage, Record};
    use crate::pool::retry::BackoffPolicy;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct ScriptedSink {
        fail: bool,
        batches: Mutex<Vec<Vec<i64>>>,
    }

    #[async_trait]
    impl BatchSink for ScriptedSink {
        async fn process_batch(&self, records: Vec<Record>) -> Result<(), SinkError> {
            self.batches
                .lock()
                .push(records.iter().map(|r| r.offset).collect());
            if self.fail {
                Err(SinkError::Write("nope".into()))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct CountingAck(AtomicUsize);

    impl AckHandle for CountingAck {
        fn acknowledge(&self, _message: &InboundMessage) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        worker: Worker,
        queue: Arc<JobQueue<Job>>,
        successes: Arc<AtomicUsize>,
        errors: Arc<AtomicUsize>,
    }

    fn harness(sink: Arc<ScriptedSink>, batch_size: usize) -> Harness {
        let queue = Arc::new(JobQueue::new(16));
        let successes = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let observer: Arc<dyn PoolObserver> = {
            let successes = Arc::clone(&successes);
            let errors = Arc::clone(&errors);
            Arc::new(CallbackObserver::new(
                move |n| {
                    successes.fetch_add(n, Ordering::SeqCst);
                },
                move |_| {
                    errors.fetch_add(1, Ordering::SeqCst);
                },
            ))
        };
        let cancel = CancellationToken::new();
        let retry = RetryScheduler::new(
            Arc::clone(&queue),
            Arc::clone(&observer),
            BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(5)),
            3,
            cancel.clone(),
            Arc::new(AtomicUsize::new(0)),
        );
        let worker = Worker::new(
            0,
            Arc::clone(&queue),
            sink,
            observer,
            retry,
            batch_size,
            Duration::from_secs(60),
            cancel,
        );
        Harness {
            worker,
            queue,
            successes,
            errors,
        }
    }

    fn job(offset: i64, ack: &Arc<CountingAck>) -> Job {
        Job::new(InboundMessage::new("t", 0, offset), ack.clone())
    }

    #[tokio::test]
    async fn test_empty_flush_skips_sink() {
        let sink = Arc::new(ScriptedSink::default());
        let mut h = harness(Arc::clone(&sink), 4);
        h.worker.flush().await;
        assert!(sink.batches.lock().is_empty());
        assert_eq!(h.successes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_successful_flush_acks_every_job_once() {
        let sink = Arc::new(ScriptedSink::default());
        let ack = Arc::new(CountingAck::default());
        let mut h = harness(Arc::clone(&sink), 4);

        h.worker.buffer(job(1, &ack));
        h.worker.buffer(job(2, &ack));
        h.worker.flush().await;
        h.worker.flush().await;

        assert_eq!(*sink.batches.lock(), vec![vec![1, 2]]);
        assert_eq!(ack.0.load(Ordering::SeqCst), 2);
        assert_eq!(h.successes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_flush_routes_jobs_to_retry() {
        let sink = Arc::new(ScriptedSink {
            fail: true,
            ..Default::default()
        });
        let ack = Arc::new(CountingAck::default());
        let mut h = harness(sink, 4);

        h.worker.buffer(job(1, &ack));
        h.worker.buffer(job(2, &ack));
        h.worker.flush().await;

        assert_eq!(ack.0.load(Ordering::SeqCst), 0);
        assert_eq!(h.errors.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.queue.len(), 2);
        let retried = h.queue.pop().await.unwrap();
        assert_eq!(retried.attempts(), 1);
    }

    #[tokio::test]
    async fn test_conversion_failure_skips_sink() {
        let sink = Arc::new(ScriptedSink::default());
        let ack = Arc::new(CountingAck::default());
        let mut h = harness(Arc::clone(&sink), 4);

        h.worker.buffer(job(1, &ack));
        h.worker.buffer(Job::new(
            InboundMessage::new("t", 0, 2).with_header(Bytes::from_static(&[0xff]), "v"),
            ack.clone(),
        ));
        h.worker.flush().await;

        assert!(sink.batches.lock().is_empty());
        assert_eq!(h.errors.load(Ordering::SeqCst), 2);
        assert_eq!(ack.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_live_guard_counts() {
        let live = Arc::new(AtomicUsize::new(0));
        let a = LiveWorkerGuard::new(Arc::clone(&live));
        let b = LiveWorkerGuard::new(Arc::clone(&live));
        assert_eq!(live.load(Ordering::SeqCst), 2);
        drop(a);
        drop(b);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }
}
