//! Sink wrapper that fails fast while the downstream is unhealthy.

use super::BatchSink;
use crate::circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::SinkError;
use crate::pool::Record;
use async_trait::async_trait;

/// Wraps a sink with a [`CircuitBreaker`].
///
/// While the circuit is open batches are rejected with
/// [`SinkError::CircuitOpen`] without reaching the inner sink, and the
/// pool's normal retry path takes over.
pub struct GuardedSink<S> {
    inner: S,
    breaker: CircuitBreaker,
}

impl<S: BatchSink> GuardedSink<S> {
    pub fn new(inner: S, config: CircuitBreakerConfig) -> Self {
        let breaker = CircuitBreaker::new(inner.name().to_string(), config);
        Self { inner, breaker }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: BatchSink> BatchSink for GuardedSink<S> {
    async fn process_batch(&self, records: Vec<Record>) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }

        if let Admission::Rejected { retry_in } = self.breaker.admit() {
            return Err(SinkError::CircuitOpen(format!(
                "{} unavailable, retry in {}ms",
                self.breaker.name(),
                retry_in.as_millis()
            )));
        }

        match self.inner.process_batch(records).await {
            Ok(()) => {
                self.breaker.on_success();
                Ok(())
            }
            Err(e) => {
                self.breaker.on_failure();
                Err(e)
            }
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
