//! Observability hooks invoked from the worker flush path.

use super::job::Job;
use crate::error::FlushError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Callbacks invoked synchronously by workers.
///
/// Implementations run on the hot path of every worker and must neither
/// block nor panic.
pub trait PoolObserver: Send + Sync {
    /// A batch of `batch_size` records was persisted and acknowledged.
    fn on_success(&self, batch_size: usize);

    /// A job failed to flush. Called once per job in the failed batch.
    fn on_error(&self, cause: &FlushError);

    /// A job was scheduled for another attempt after `delay`.
    fn on_retry(&self, _job: &Job, _delay: Duration) {}

    /// A job exceeded its retry cap and was discarded without acknowledgment.
    fn on_dropped(&self, _job: &Job) {}
}

/// Default observer: logs failures and ignores successes.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl PoolObserver for LoggingObserver {
    fn on_success(&self, _batch_size: usize) {}

    fn on_error(&self, cause: &FlushError) {
        error!(error = %cause, "Worker flush failed");
    }

    fn on_dropped(&self, job: &Job) {
        warn!(
            topic = %job.message().topic,
            partition = job.message().partition,
            offset = job.message().offset,
            "Job dropped without acknowledgment"
        );
    }
}

type SuccessFn = dyn Fn(usize) + Send + Sync;
type ErrorFn = dyn Fn(&FlushError) + Send + Sync;

/// Observer built from two closures.
#[derive(Clone)]
pub struct CallbackObserver {
    on_success: Arc<SuccessFn>,
    on_error: Arc<ErrorFn>,
}

impl CallbackObserver {
    pub fn new<S, E>(on_success: S, on_error: E) -> Self
    where
        S: Fn(usize) + Send + Sync + 'static,
        E: Fn(&FlushError) + Send + Sync + 'static,
    {
        Self {
            on_success: Arc::new(on_success),
            on_error: Arc::new(on_error),
        }
    }
}

impl fmt::Debug for CallbackObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackObserver").finish_non_exhaustive()
    }
}

impl PoolObserver for CallbackObserver {
    fn on_success(&self, batch_size: usize) {
        (self.on_success)(batch_size);
    }

    fn on_error(&self, cause: &FlushError) {
        (self.on_error)(cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_callback_observer_forwards() {
        let successes = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        let observer = {
            let successes = Arc::clone(&successes);
            let errors = Arc::clone(&errors);
            CallbackObserver::new(
                move |n| {
                    successes.fetch_add(n, Ordering::SeqCst);
                },
                move |_| {
                    errors.fetch_add(1, Ordering::SeqCst);
                },
            )
        };

        observer.on_success(3);
        observer.on_success(2);
        observer.on_error(&FlushError::Sink(SinkError::Other("boom".into())));

        assert_eq!(successes.load(Ordering::SeqCst), 5);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_logging_observer_does_not_panic() {
        let observer = LoggingObserver;
        observer.on_success(10);
        observer.on_error(&FlushError::Sink(SinkError::Write("x".into())));
    }
}
