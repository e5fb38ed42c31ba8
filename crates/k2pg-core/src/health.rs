//! Component health tracking for the ingest process.

use crate::circuit_breaker::CircuitState;
use crate::pool::PoolState;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Parts of the pipeline that report health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Kafka,
    Postgres,
    Pool,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Kafka => "kafka",
            Component::Postgres => "postgres",
            Component::Pool => "pool",
        }
    }
}

/// Health status of a component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Operational with reduced throughput
    Degraded(String),
    Unhealthy(String),
    /// Registered but not yet reported
    Unknown,
}

/// Overall status, the worst of all components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Serializable view served on the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub job_running: bool,
    pub components: BTreeMap<Component, ComponentStatus>,
}

/// Shared health registry, written by the ingest loop and read by the HTTP
/// server.
#[derive(Default)]
pub struct HealthCheck {
    components: RwLock<BTreeMap<Component, ComponentStatus>>,
    job_running: AtomicBool,
}

impl HealthCheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component as `Unknown`.
    pub fn register(&self, component: Component) {
        self.components
            .write()
            .insert(component, ComponentStatus::Unknown);
    }

    pub fn set(&self, component: Component, status: ComponentStatus) {
        self.components.write().insert(component, status);
    }

    pub fn mark_healthy(&self, component: Component) {
        self.set(component, ComponentStatus::Healthy);
    }

    pub fn mark_degraded(&self, component: Component, reason: impl Into<String>) {
        self.set(component, ComponentStatus::Degraded(reason.into()));
    }

    pub fn mark_unhealthy(&self, component: Component, reason: impl Into<String>) {
        self.set(component, ComponentStatus::Unhealthy(reason.into()));
    }

    pub fn status_of(&self, component: Component) -> Option<ComponentStatus> {
        self.components.read().get(&component).cloned()
    }

    /// Derive the pool's health from its lifecycle and worker count.
    pub fn observe_pool(&self, state: PoolState, live_workers: usize, configured: usize) {
        let status = match state {
            PoolState::Running if live_workers == configured => ComponentStatus::Healthy,
            PoolState::Running if live_workers == 0 => {
                ComponentStatus::Unhealthy("no live workers".into())
            }
            PoolState::Running => ComponentStatus::Degraded(format!(
                "{} of {} workers alive",
                live_workers, configured
            )),
            PoolState::Created => ComponentStatus::Unknown,
            PoolState::Draining => ComponentStatus::Degraded("draining".into()),
            PoolState::Stopped => ComponentStatus::Unhealthy("stopped".into()),
        };
        self.set(Component::Pool, status);
    }

    /// Derive the sink's health from its circuit breaker.
    pub fn observe_circuit(&self, state: CircuitState) {
        let status = match state {
            CircuitState::Closed => ComponentStatus::Healthy,
            CircuitState::HalfOpen => ComponentStatus::Degraded("circuit half-open".into()),
            CircuitState::Open => ComponentStatus::Unhealthy("circuit open".into()),
        };
        self.set(Component::Postgres, status);
    }

    pub fn overall_status(&self) -> HealthStatus {
        let components = self.components.read();

        let mut has_degraded = false;
        for status in components.values() {
            match status {
                ComponentStatus::Unhealthy(_) => return HealthStatus::Unhealthy,
                ComponentStatus::Degraded(_) => has_degraded = true,
                _ => {}
            }
        }

        if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Healthy or degraded.
    pub fn is_operational(&self) -> bool {
        self.overall_status() != HealthStatus::Unhealthy
    }

    /// Ready to take traffic: the job is running and nothing is unhealthy
    /// or unreported.
    pub fn is_ready(&self) -> bool {
        self.is_job_running()
            && self.is_operational()
            && !self
                .components
                .read()
                .values()
                .any(|s| *s == ComponentStatus::Unknown)
    }

    pub fn job_started(&self) {
        self.job_running.store(true, Ordering::SeqCst);
    }

    pub fn job_completed(&self) {
        self.job_running.store(false, Ordering::SeqCst);
    }

    pub fn is_job_running(&self) -> bool {
        self.job_running.load(Ordering::SeqCst)
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            status: self.overall_status(),
            job_running: self.is_job_running(),
            components: self.components.read().clone(),
        }
    }
}
