//! Circuit breaker guarding the sink.
//!
//! After a run of consecutive failed flushes the breaker opens and batches
//! fail fast until the reset timeout elapses. The breaker then lets probe
//! batches through; enough successful probes close it again, any failed
//! probe reopens it.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls proceed normally
    Closed,
    /// Calls are rejected without reaching the sink
    Open,
    /// Probe calls are allowed through
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit (default: 5)
    pub failure_threshold: u32,
    /// Time spent open before probing (default: 30s)
    pub reset_timeout: Duration,
    /// Successful probes required to close (default: 2)
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    probe_successes: u32,
    opened_at: Option<Instant>,
}

/// Answer to "may this call proceed?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Rejected; the circuit stays open for at least this long
    Rejected { retry_in: Duration },
}

/// Thread-safe circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                probe_successes: 0,
                opened_at: None,
            }),
        }
    }

    /// Decide whether a call may proceed, moving Open to HalfOpen once the
    /// reset timeout has elapsed.
    pub fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return Admission::Allowed;
        }

        let elapsed = inner
            .opened_at
            .map(|at| at.elapsed())
            .unwrap_or(self.config.reset_timeout);

        if elapsed >= self.config.reset_timeout {
            inner.state = CircuitState::HalfOpen;
            inner.probe_successes = 0;
            info!(breaker = %self.name, "Circuit half-open, probing sink");
            Admission::Allowed
        } else {
            Admission::Rejected {
                retry_in: self.config.reset_timeout - elapsed,
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.probe_successes = 0;
                    inner.opened_at = None;
                    info!(breaker = %self.name, "Circuit closed, sink recovered");
                }
            }
            // A call admitted before the circuit opened finished late.
            CircuitState::Open => {}
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitState::Closed
                if inner.consecutive_failures >= self.config.failure_threshold =>
            {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(
                    breaker = %self.name,
                    failures = inner.consecutive_failures,
                    reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                    "Circuit opened"
                );
            }
            CircuitState::Closed => {
                debug!(
                    breaker = %self.name,
                    failures = inner.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "Sink failure recorded"
                );
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.probe_successes = 0;
                inner.opened_at = Some(Instant::now());
                warn!(breaker = %self.name, "Probe failed, circuit reopened");
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
