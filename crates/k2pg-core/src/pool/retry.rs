//! Per-job retry with capped exponential backoff.
//!
//! A failed job is re-submitted to the shared queue by a detached task
//! after its backoff delay. The delay races the pool's cancellation token;
//! a retry whose delay has not elapsed when the token fires is abandoned,
//! and the job is never acknowledged. Callers relying on redelivery must
//! treat shutdown as a possible loss point for jobs in backoff.

use super::job::Job;
use super::observer::PoolObserver;
use super::queue::JobQueue;
use crate::error::FlushError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exponential backoff: `min(max_delay, base_delay * 2^(attempt-1))`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry (default: 100ms)
    pub base_delay: Duration,
    /// Maximum delay cap (default: 5s)
    pub max_delay: Duration,
    /// Whether to add ±25% jitter (default: false)
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    /// Policy used for broker poll errors.
    pub fn for_kafka() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }

    /// Enable jitter to spread out simultaneous retries.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay before retry number `attempt` (1-based; 0 is treated as 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let capped_ms = base_ms.saturating_mul(1u64 << exponent).min(max_ms);

        let final_ms = if self.jitter {
            let range = capped_ms / 4;
            let jitter = (std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as u64)
                % (range * 2 + 1);
            capped_ms.saturating_sub(range) + jitter
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms)
    }
}

/// What happened to a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// A delayed re-submission was scheduled
    Scheduled { attempt: u32, delay: Duration },
    /// The job hit its retry cap and was discarded
    Dropped,
    /// The pool is shutting down; the job was discarded
    Abandoned,
}

/// Routes failed jobs back into the shared queue after a backoff delay.
#[derive(Clone)]
pub struct RetryScheduler {
    queue: Arc<JobQueue<Job>>,
    observer: Arc<dyn PoolObserver>,
    policy: BackoffPolicy,
    max_retries: u32,
    cancel: CancellationToken,
    pending: Arc<AtomicUsize>,
}

impl RetryScheduler {
    pub fn new(
        queue: Arc<JobQueue<Job>>,
        observer: Arc<dyn PoolObserver>,
        policy: BackoffPolicy,
        max_retries: u32,
        cancel: CancellationToken,
        pending: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            queue,
            observer,
            policy,
            max_retries,
            cancel,
            pending,
        }
    }

    /// Handle one failed job.
    pub fn schedule(&self, mut job: Job, cause: &FlushError) -> RetryOutcome {
        self.observer.on_error(cause);

        if job.attempts() >= self.max_retries {
            warn!(
                topic = %job.message().topic,
                partition = job.message().partition,
                offset = job.message().offset,
                attempts = job.attempts(),
                error = %cause,
                "Dropping message after exhausting retries"
            );
            self.observer.on_dropped(&job);
            job.release();
            return RetryOutcome::Dropped;
        }

        if self.cancel.is_cancelled() {
            debug!(
                offset = job.message().offset,
                "Pool cancelled, not scheduling retry"
            );
            return RetryOutcome::Abandoned;
        }

        let attempt = job.increment_attempts();
        let delay = self.policy.delay_for(attempt);
        self.observer.on_retry(&job, delay);

        let pending = PendingGuard::new(Arc::clone(&self.pending));
        let queue = Arc::clone(&self.queue);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let _pending = pending;
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(
                        offset = job.message().offset,
                        attempt,
                        "Retry abandoned on cancellation"
                    );
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(job) = queue.push(job).await {
                        warn!(
                            topic = %job.message().topic,
                            partition = job.message().partition,
                            offset = job.message().offset,
                            attempt,
                            "Worker pool rejected retry, pool is closed"
                        );
                    }
                }
            }
        });

        RetryOutcome::Scheduled { attempt, delay }
    }

    /// Number of retries waiting for their delay to elapse.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Counts a retry as pending for as long as its task is alive.
struct PendingGuard(Arc<AtomicUsize>);

impl PendingGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use crate::pool::job::{AckHandle, NoopAck};
    use crate::pool::observer::LoggingObserver;
    use crate::pool::record::InboundMessage;

    fn job(offset: i64) -> Job {
        Job::new(InboundMessage::new("t", 0, offset), Arc::new(NoopAck))
    }

    #[derive(Default)]
    struct ReleaseCounter {
        released: AtomicUsize,
    }

    impl AckHandle for ReleaseCounter {
        fn acknowledge(&self, _message: &InboundMessage) {
            panic!("failed job must not be acknowledged");
        }

        fn release(&self, _message: &InboundMessage) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn cause() -> FlushError {
        FlushError::Sink(SinkError::Other("down".into()))
    }

    fn scheduler(
        queue: Arc<JobQueue<Job>>,
        max_retries: u32,
        cancel: CancellationToken,
    ) -> RetryScheduler {
        RetryScheduler::new(
            queue,
            Arc::new(LoggingObserver),
            BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(50)),
            max_retries,
            cancel,
            Arc::new(AtomicUsize::new(0)),
        )
    }

    #[test]
    fn test_default_policy_matches_documented_schedule() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1600));
        assert_eq!(policy.delay_for(6), Duration::from_millis(3200));
        assert_eq!(policy.delay_for(7), Duration::from_secs(5));
        assert_eq!(policy.delay_for(50), Duration::from_secs(5));
    }

    #[test]
    fn test_delay_is_monotonic_and_bounded() {
        let policy = BackoffPolicy::default();
        let delays: Vec<Duration> = (1..=64).map(|a| policy.delay_for(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(5)));
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(0), policy.delay_for(1));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let policy =
            BackoffPolicy::new(Duration::from_millis(1000), Duration::from_secs(30)).with_jitter();
        let delay = policy.delay_for(1);
        assert!(delay >= Duration::from_millis(750));
        assert!(delay <= Duration::from_millis(1250));
    }

    #[test]
    fn test_for_kafka_policy() {
        let policy = BackoffPolicy::for_kafka();
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert!(policy.jitter);
    }

    #[tokio::test]
    async fn test_schedule_resubmits_after_delay() {
        let queue = Arc::new(JobQueue::new(8));
        let retry = scheduler(Arc::clone(&queue), 3, CancellationToken::new());

        let outcome = retry.schedule(job(5), &cause());
        assert_eq!(
            outcome,
            RetryOutcome::Scheduled {
                attempt: 1,
                delay: Duration::from_millis(10)
            }
        );
        assert_eq!(retry.pending(), 1);
        assert!(queue.is_empty());

        let resubmitted = tokio::time::timeout(Duration::from_secs(1), queue.pop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resubmitted.attempts(), 1);
        assert_eq!(resubmitted.message().offset, 5);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(retry.pending(), 0);
    }

    #[tokio::test]
    async fn test_schedule_drops_at_cap() {
        let queue = Arc::new(JobQueue::new(8));
        let retry = scheduler(Arc::clone(&queue), 1, CancellationToken::new());

        let mut failed = job(1);
        failed.increment_attempts();
        assert_eq!(retry.schedule(failed, &cause()), RetryOutcome::Dropped);
        assert_eq!(retry.pending(), 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_job_is_released_to_source() {
        let queue = Arc::new(JobQueue::new(8));
        let retry = scheduler(Arc::clone(&queue), 1, CancellationToken::new());
        let ack = Arc::new(ReleaseCounter::default());

        let first = Job::new(InboundMessage::new("t", 0, 9), ack.clone());
        assert!(matches!(
            retry.schedule(first, &cause()),
            RetryOutcome::Scheduled { .. }
        ));
        assert_eq!(ack.released.load(Ordering::SeqCst), 0);

        let resubmitted = tokio::time::timeout(Duration::from_secs(1), queue.pop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retry.schedule(resubmitted, &cause()), RetryOutcome::Dropped);
        assert_eq!(ack.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_abandons_pending_retry() {
        let queue = Arc::new(JobQueue::new(8));
        let cancel = CancellationToken::new();
        let retry = RetryScheduler::new(
            Arc::clone(&queue),
            Arc::new(LoggingObserver),
            BackoffPolicy::new(Duration::from_secs(10), Duration::from_secs(10)),
            3,
            cancel.clone(),
            Arc::new(AtomicUsize::new(0)),
        );

        assert!(matches!(
            retry.schedule(job(1), &cause()),
            RetryOutcome::Scheduled { .. }
        ));
        assert_eq!(retry.pending(), 1);

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(retry.pending(), 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_already_cancelled_does_not_spawn() {
        let queue = Arc::new(JobQueue::new(8));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let retry = scheduler(Arc::clone(&queue), 3, cancel);

        assert_eq!(retry.schedule(job(1), &cause()), RetryOutcome::Abandoned);
        assert_eq!(retry.pending(), 0);
    }

    #[tokio::test]
    async fn test_retry_into_closed_queue_is_rejected() {
        let queue = Arc::new(JobQueue::new(8));
        let retry = scheduler(Arc::clone(&queue), 3, CancellationToken::new());

        retry.schedule(job(1), &cause());
        queue.close();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(retry.pending(), 0);
        assert!(queue.is_empty());
    }
}
