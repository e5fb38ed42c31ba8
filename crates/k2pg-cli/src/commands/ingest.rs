//! Ingest command implementation.

use crate::server::{start_server, ServerState};
use anyhow::Result;
use k2pg_core::health::{Component, HealthCheck};
use k2pg_core::kafka::KafkaConsumerBuilder;
use k2pg_core::metrics::IngestionMetrics;
use k2pg_core::sink::{GuardedSink, PostgresSink};
use k2pg_core::{BatchSink, Config, WorkerPool};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

const GAUGE_INTERVAL: Duration = Duration::from_secs(1);
const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Command-line overrides, applied on top of file and environment settings.
#[derive(Debug, Default)]
pub struct Overrides {
    pub bootstrap_servers: Option<String>,
    pub topic: Option<String>,
    pub consumer_group: Option<String>,
    pub database_url: Option<String>,
    pub workers: Option<usize>,
}

impl Overrides {
    pub fn apply(self, config: &mut Config) {
        if let Some(servers) = self.bootstrap_servers {
            config.kafka.bootstrap_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(topic) = self.topic {
            config.kafka.topic = topic;
        }
        if let Some(group) = self.consumer_group {
            config.kafka.consumer_group = group;
        }
        if let Some(url) = self.database_url {
            config.postgres.url = url;
        }
        if let Some(workers) = self.workers {
            config.pool.worker_count = workers;
        }
    }
}

/// Run the Kafka to Postgres pipeline until a shutdown signal arrives.
pub async fn run(config: Config) -> Result<()> {
    info!(
        topic = %config.kafka.topic,
        group = %config.kafka.consumer_group,
        table = %config.postgres.table,
        workers = config.pool.worker_count,
        "Starting ingestion"
    );

    // `shutdown` stops consumption; `cancel` is fired once the pool has
    // drained and also stops pending retries and the HTTP servers.
    let cancel = CancellationToken::new();
    let shutdown = cancel.child_token();
    let health = Arc::new(HealthCheck::new());
    health.register(Component::Kafka);
    health.register(Component::Postgres);
    health.register(Component::Pool);
    let metrics = Arc::new(IngestionMetrics::new());

    tokio::spawn(start_server(
        Arc::new(ServerState {
            health: Arc::clone(&health),
            metrics: Arc::clone(&metrics),
        }),
        config.monitoring.health_port,
        config.monitoring.metrics_port,
        cancel.child_token(),
    ));
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let postgres = match PostgresSink::connect(&config.postgres).await {
        Ok(sink) => sink,
        Err(e) => {
            health.mark_unhealthy(Component::Postgres, e.to_string());
            cancel.cancel();
            return Err(e.into());
        }
    };
    health.mark_healthy(Component::Postgres);

    let breaker_settings = &config.postgres.circuit_breaker;
    let (sink, guarded): (Arc<dyn BatchSink>, Option<Arc<GuardedSink<PostgresSink>>>) =
        if breaker_settings.enabled {
            let guarded = Arc::new(GuardedSink::new(
                postgres.clone(),
                breaker_settings.to_breaker_config(),
            ));
            let sink: Arc<dyn BatchSink> = guarded.clone();
            (sink, Some(guarded))
        } else {
            let sink: Arc<dyn BatchSink> = Arc::new(postgres.clone());
            (sink, None)
        };

    let options = config.pool.to_options();
    let configured_workers = options.worker_count;
    let pool = WorkerPool::new(sink, options, metrics.clone());

    let source = match KafkaConsumerBuilder::new(config.kafka.clone())
        .with_metrics(Arc::clone(&metrics))
        .build()
    {
        Ok(source) => source,
        Err(e) => {
            health.mark_unhealthy(Component::Kafka, e.to_string());
            cancel.cancel();
            postgres.close().await;
            return Err(e.into());
        }
    };
    health.mark_healthy(Component::Kafka);

    pool.start(cancel.clone())?;
    health.job_started();

    let result = {
        let monitor = monitor_pipeline(
            &pool,
            &postgres,
            guarded.as_deref(),
            &health,
            &metrics,
            configured_workers,
            shutdown.clone(),
        );
        let consume = source.run(&pool, shutdown.clone());
        tokio::pin!(consume);

        tokio::select! {
            result = &mut consume => result,
            _ = monitor => consume.await,
        }
    };

    if let Err(ref e) = result {
        health.mark_unhealthy(Component::Kafka, e.to_string());
    }

    info!("Draining worker pool");
    shutdown.cancel();
    pool.stop().await;
    cancel.cancel();
    health.observe_pool(pool.state(), pool.live_workers(), configured_workers);
    source.commit_stored();
    health.job_completed();
    postgres.close().await;

    info!(
        consumed = metrics.messages_consumed(),
        flushed = metrics.records_flushed(),
        dropped = metrics.jobs_dropped(),
        "Ingestion stopped"
    );

    result.map_err(Into::into)
}

/// Keep gauges and component health current until cancelled.
async fn monitor_pipeline(
    pool: &WorkerPool,
    postgres: &PostgresSink,
    guarded: Option<&GuardedSink<PostgresSink>>,
    health: &HealthCheck,
    metrics: &IngestionMetrics,
    configured_workers: usize,
    cancel: CancellationToken,
) {
    let mut gauges = tokio::time::interval(GAUGE_INTERVAL);
    let mut ping = tokio::time::interval(PING_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = gauges.tick() => {
                metrics.set_pool_gauges(pool.queue_len(), pool.live_workers(), pool.pending_retries());
                health.observe_pool(pool.state(), pool.live_workers(), configured_workers);
                if let Some(guarded) = guarded {
                    health.observe_circuit(guarded.circuit_state());
                }
            }
            _ = ping.tick(), if guarded.is_none() => {
                match postgres.ping().await {
                    Ok(()) => health.mark_healthy(Component::Postgres),
                    Err(e) => health.mark_unhealthy(Component::Postgres, e.to_string()),
                }
            }
        }
    }
}

async fn wait_for_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = cancel.cancelled() => return,
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, listening for Ctrl+C only");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C, initiating graceful shutdown");
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, initiating graceful shutdown");
            }
            _ = cancel.cancelled() => return,
        }
    }

    cancel.cancel();
}
