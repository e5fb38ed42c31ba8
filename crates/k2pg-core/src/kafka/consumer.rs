//! Kafka source feeding the worker pool.
//!
//! Offsets are committed by librdkafka's auto-commit, but only offsets that
//! were explicitly stored are eligible: `enable.auto.offset.store` is off and
//! [`KafkaAck`] stores a partition's position once the pool has settled
//! every message below it. Anything in flight at shutdown is redelivered to
//! the next group member. A message dropped after exhausting its retries is
//! skipped so it cannot stall its partition.

use super::offset::OffsetTracker;
use crate::config::{KafkaConfig, OffsetReset};
use crate::metrics::{ErrorType, IngestionMetrics};
use crate::pool::{AckHandle, BackoffPolicy, InboundMessage, Job, WorkerPool};
use crate::{Error, KafkaError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use rdkafka::client::ClientContext;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consumer context that forgets the offsets of revoked partitions.
pub struct SourceContext {
    offsets: Arc<OffsetTracker>,
}

impl ClientContext for SourceContext {}

impl ConsumerContext for SourceContext {
    fn pre_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                let revoked = forget_revoked(&self.offsets, tpl);
                info!(?revoked, "Partitions revoked");
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => warn!(error = %e, "Rebalance error"),
        }
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            let assigned: Vec<(String, i32)> = tpl
                .elements()
                .iter()
                .map(|e| (e.topic().to_string(), e.partition()))
                .collect();
            info!(?assigned, "Partitions assigned");
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(e) = result {
            debug!(error = %e, "Offset commit failed");
        }
    }
}

type SourceConsumer = StreamConsumer<SourceContext>;

/// Drop tracker state for every partition in `tpl`.
fn forget_revoked(offsets: &OffsetTracker, tpl: &TopicPartitionList) -> Vec<(String, i32)> {
    tpl.elements()
        .iter()
        .map(|e| {
            offsets.forget_partition(e.topic(), e.partition());
            (e.topic().to_string(), e.partition())
        })
        .collect()
}

/// Builder for a [`KafkaSource`].
pub struct KafkaConsumerBuilder {
    config: KafkaConfig,
    backoff: BackoffPolicy,
    metrics: Option<Arc<IngestionMetrics>>,
}

impl KafkaConsumerBuilder {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            backoff: BackoffPolicy::for_kafka(),
            metrics: None,
        }
    }

    /// Backoff applied between failed polls.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<IngestionMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// librdkafka settings derived from the configuration.
    pub fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", self.config.bootstrap_servers.join(","))
            .set("group.id", &self.config.consumer_group)
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                self.config.auto_commit_interval_ms.to_string(),
            )
            // Only offsets stored by KafkaAck are committed.
            .set("enable.auto.offset.store", "false")
            .set(
                "auto.offset.reset",
                match self.config.auto_offset_reset {
                    OffsetReset::Earliest => "earliest",
                    OffsetReset::Latest => "latest",
                },
            )
            .set(
                "session.timeout.ms",
                self.config.session_timeout_ms.to_string(),
            )
            .set(
                "heartbeat.interval.ms",
                self.config.heartbeat_interval_ms.to_string(),
            )
            .set(
                "max.poll.interval.ms",
                self.config.max_poll_interval_ms.to_string(),
            )
            .set(
                "queued.min.messages",
                self.config.max_poll_records.max(1).to_string(),
            )
            .set("partition.assignment.strategy", "range");

        let security = &self.config.security;
        if let Some(ref protocol) = security.protocol {
            client_config.set("security.protocol", protocol);
        }
        if let Some(ref mechanism) = security.sasl_mechanism {
            client_config.set("sasl.mechanism", mechanism);
        }
        if let Some(ref username) = security.sasl_username {
            client_config.set("sasl.username", username);
        }
        if let Some(ref password) = security.sasl_password {
            client_config.set("sasl.password", password);
        }
        if let Some(ref path) = security.ssl_ca_location {
            client_config.set("ssl.ca.location", path.to_string_lossy().as_ref());
        }
        if let Some(ref path) = security.ssl_cert_location {
            client_config.set("ssl.certificate.location", path.to_string_lossy().as_ref());
        }
        if let Some(ref path) = security.ssl_key_location {
            client_config.set("ssl.key.location", path.to_string_lossy().as_ref());
        }

        client_config
    }

    /// Create the consumer and subscribe to the topic.
    pub fn build(self) -> Result<KafkaSource> {
        let offsets = Arc::new(OffsetTracker::new());
        let context = SourceContext {
            offsets: Arc::clone(&offsets),
        };
        let consumer: SourceConsumer = self
            .client_config()
            .create_with_context(context)
            .map_err(|e| {
                Error::Kafka(KafkaError::ConnectionFailed {
                    broker: self.config.bootstrap_servers.join(","),
                    message: e.to_string(),
                })
            })?;

        consumer
            .subscribe(&[&self.config.topic])
            .map_err(|e| Error::Kafka(KafkaError::ConsumerGroup(e.to_string())))?;

        info!(
            topic = %self.config.topic,
            group = %self.config.consumer_group,
            servers = %self.config.bootstrap_servers.join(","),
            "Kafka consumer subscribed"
        );

        let consumer = Arc::new(consumer);
        let ack = Arc::new(KafkaAck {
            consumer: Arc::clone(&consumer),
            offsets: Arc::clone(&offsets),
        });

        Ok(KafkaSource {
            consumer,
            topic: self.config.topic,
            offsets,
            ack,
            backoff: self.backoff,
            metrics: self.metrics,
            consecutive_failures: AtomicU32::new(0),
        })
    }
}

/// Acknowledgment handle that stores committable offsets on the consumer.
pub struct KafkaAck {
    consumer: Arc<SourceConsumer>,
    offsets: Arc<OffsetTracker>,
}

impl AckHandle for KafkaAck {
    fn acknowledge(&self, message: &InboundMessage) {
        if let Some(next) = self
            .offsets
            .ack(&message.topic, message.partition, message.offset)
        {
            self.store(message, next);
        }
    }

    fn release(&self, message: &InboundMessage) {
        if let Some(next) = self
            .offsets
            .release(&message.topic, message.partition, message.offset)
        {
            self.store(message, next);
        }
    }
}

impl KafkaAck {
    fn store(&self, message: &InboundMessage, next: i64) {
        let mut tpl = TopicPartitionList::new();
        let stored = tpl
            .add_partition_offset(&message.topic, message.partition, Offset::Offset(next))
            .and_then(|_| self.consumer.store_offsets(&tpl));

        if let Err(e) = stored {
            // The partition was most likely revoked; its new owner re-reads
            // from the last commit.
            let err = KafkaError::OffsetStore(e.to_string());
            warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = next,
                error = %err,
                "Failed to store offset"
            );
        }
    }
}

/// Consumer-group member that submits every message to a [`WorkerPool`].
pub struct KafkaSource {
    consumer: Arc<SourceConsumer>,
    topic: String,
    offsets: Arc<OffsetTracker>,
    ack: Arc<KafkaAck>,
    backoff: BackoffPolicy,
    metrics: Option<Arc<IngestionMetrics>>,
    consecutive_failures: AtomicU32,
}

impl KafkaSource {
    /// Consume until `cancel` fires, submitting each message to `pool`.
    ///
    /// Poll errors are logged and followed by a backoff sleep. A rejected
    /// submission is logged and the message is left unacknowledged.
    pub async fn run(&self, pool: &WorkerPool, cancel: CancellationToken) -> Result<()> {
        let mut stream = self.consumer.stream();
        info!(topic = %self.topic, "Kafka source started");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = stream.next() => next,
            };

            let message = match next {
                Some(Ok(msg)) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    to_inbound(&msg)
                }
                Some(Err(e)) => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    let delay = self.backoff.delay_for(failures);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_error(ErrorType::Kafka);
                    }
                    warn!(
                        failures,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Kafka poll error, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
                None => return Err(Error::Kafka(KafkaError::ConsumerClosed)),
            };

            if let Some(metrics) = &self.metrics {
                metrics.record_message();
            }
            self.offsets
                .track(&message.topic, message.partition, message.offset);

            let (partition, offset) = (message.partition, message.offset);
            let job = Job::new(message, self.ack.clone());

            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.offsets.untrack(&self.topic, partition, offset);
                    break;
                }
                accepted = pool.submit(job) => accepted,
            };

            if !accepted {
                self.offsets.untrack(&self.topic, partition, offset);
                if let Some(metrics) = &self.metrics {
                    metrics.record_rejection();
                }
                warn!(partition, offset, "Worker pool rejected message");
            }
        }

        info!(
            in_flight = self.offsets.total_in_flight(),
            "Kafka source stopped"
        );
        Ok(())
    }

    /// Current partition assignment.
    pub fn assignment(&self) -> Result<Vec<(String, i32)>> {
        let tpl = self
            .consumer
            .assignment()
            .map_err(|e| Error::Kafka(KafkaError::ConsumerGroup(e.to_string())))?;

        Ok(tpl
            .elements()
            .iter()
            .map(|e| (e.topic().to_string(), e.partition()))
            .collect())
    }

    pub fn offsets(&self) -> &OffsetTracker {
        &self.offsets
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Synchronously commit whatever has been stored, used on shutdown.
    pub fn commit_stored(&self) {
        match self
            .consumer
            .commit_consumer_state(rdkafka::consumer::CommitMode::Sync)
        {
            Ok(()) => debug!("Committed stored offsets"),
            // Nothing stored yet is reported as an error by librdkafka.
            Err(e) => debug!(error = %e, "Final offset commit skipped"),
        }
    }
}

fn to_inbound(msg: &BorrowedMessage<'_>) -> InboundMessage {
    let timestamp = msg
        .timestamp()
        .to_millis()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    let headers = msg
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| {
                    (
                        Bytes::copy_from_slice(h.key.as_bytes()),
                        Bytes::copy_from_slice(h.value.unwrap_or(&[])),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    InboundMessage {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        key: msg.key().map(Bytes::copy_from_slice),
        value: msg.payload().map(Bytes::copy_from_slice),
        headers,
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KafkaSecurityConfig;

    fn config() -> KafkaConfig {
        KafkaConfig {
            bootstrap_servers: vec!["b1:9092".into(), "b2:9092".into()],
            topic: "events".into(),
            consumer_group: "pg-writer".into(),
            ..KafkaConfig::default()
        }
    }

    #[test]
    fn test_client_config_uses_stored_offsets_with_auto_commit() {
        let builder = KafkaConsumerBuilder::new(config());
        let client = builder.client_config();

        assert_eq!(client.get("bootstrap.servers"), Some("b1:9092,b2:9092"));
        assert_eq!(client.get("group.id"), Some("pg-writer"));
        assert_eq!(client.get("enable.auto.commit"), Some("true"));
        assert_eq!(client.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(client.get("auto.commit.interval.ms"), Some("3000"));
        assert_eq!(client.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(client.get("queued.min.messages"), Some("500"));
    }

    #[test]
    fn test_client_config_security() {
        let mut config = config();
        config.auto_offset_reset = OffsetReset::Latest;
        config.security = KafkaSecurityConfig {
            protocol: Some("SASL_SSL".into()),
            sasl_mechanism: Some("SCRAM-SHA-512".into()),
            sasl_username: Some("user".into()),
            sasl_password: Some("secret".into()),
            ..KafkaSecurityConfig::default()
        };

        let client = KafkaConsumerBuilder::new(config).client_config();
        assert_eq!(client.get("auto.offset.reset"), Some("latest"));
        assert_eq!(client.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(client.get("sasl.mechanism"), Some("SCRAM-SHA-512"));
        assert_eq!(client.get("sasl.username"), Some("user"));
        assert_eq!(client.get("ssl.ca.location"), None);
    }

    #[test]
    fn test_forget_revoked_clears_tracker_state() {
        let offsets = OffsetTracker::new();
        offsets.track("events", 0, 10);
        offsets.track("events", 1, 20);
        offsets.track("events", 2, 30);

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition("events", 0);
        tpl.add_partition("events", 2);

        let revoked = forget_revoked(&offsets, &tpl);
        assert_eq!(
            revoked,
            vec![("events".to_string(), 0), ("events".to_string(), 2)]
        );
        assert_eq!(offsets.partitions(), vec![("events".to_string(), 1)]);

        // Late acks from the previous assignment are ignored.
        assert_eq!(offsets.ack("events", 0, 10), None);
        assert_eq!(offsets.committable("events", 0), None);
    }

    #[test]
    fn test_default_backoff_is_kafka_policy() {
        let builder = KafkaConsumerBuilder::new(config());
        assert_eq!(builder.backoff.max_delay, std::time::Duration::from_secs(30));
    }
}
