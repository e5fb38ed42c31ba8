//! Synthetic load generator.

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use clap::{Args, ValueEnum};
use k2pg_core::{Config, Error, KafkaError};
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Compression codec for produced batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    /// Messages per second
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u32).range(1..))]
    pub rate: u32,

    /// Approximate payload size in bytes
    #[arg(long, default_value_t = 512)]
    pub message_size: usize,

    /// Stop after this many messages (0 = run until interrupted)
    #[arg(long, default_value_t = 0)]
    pub total: u64,

    /// Prefix for message keys
    #[arg(long, default_value = "loadgen")]
    pub key_prefix: String,

    /// Seconds between progress log lines
    #[arg(long, default_value_t = 5)]
    pub log_interval_secs: u64,

    /// Compression codec
    #[arg(long, value_enum, default_value_t = Compression::None)]
    pub compression: Compression,

    /// Kafka client id
    #[arg(long, default_value = "load-generator")]
    pub client_id: String,
}

/// Produce synthetic JSON messages into the configured topic.
pub async fn run(config: Config, args: GenerateArgs) -> Result<()> {
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", config.kafka.bootstrap_servers.join(","))
        .set("client.id", &args.client_id)
        .set("acks", "1")
        .set("compression.type", args.compression.as_str())
        .create()
        .map_err(|e| Error::Kafka(KafkaError::Producer(e.to_string())))?;

    let topic = config.kafka.topic.clone();
    info!(
        topic = %topic,
        rate = args.rate,
        message_size = args.message_size,
        total = args.total,
        compression = args.compression.as_str(),
        "Starting load generator"
    );

    let errors = Arc::new(AtomicU64::new(0));
    let mut rng = StdRng::from_entropy();
    let mut ticker = tokio::time::interval(Duration::from_secs(1) / args.rate);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
    let log_interval = Duration::from_secs(args.log_interval_secs.max(1));
    let start = Instant::now();
    let mut next_log = start + log_interval;
    let mut produced: u64 = 0;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        if args.total > 0 && produced >= args.total {
            info!(produced, "Completed sending messages");
            break;
        }

        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, stopping generator");
                break;
            }
            _ = ticker.tick() => {}
        }

        produced += 1;
        let key = format!("{}-{}", args.key_prefix, produced);
        let payload = build_payload(&mut rng, produced, args.message_size);

        let record = FutureRecord::to(&topic).key(&key).payload(&payload);
        match producer.send_result(record) {
            Ok(delivery) => {
                let errors = Arc::clone(&errors);
                tokio::spawn(async move {
                    match delivery.await {
                        Ok(Ok(_)) => {}
                        Ok(Err((e, _))) => {
                            errors.fetch_add(1, Ordering::Relaxed);
                            warn!(error = %e, "Produce error");
                        }
                        Err(_) => {
                            errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
            Err((e, _)) => {
                errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Failed to enqueue message");
            }
        }

        if Instant::now() >= next_log {
            let elapsed = start.elapsed().as_secs_f64();
            info!(
                produced,
                errors = errors.load(Ordering::Relaxed),
                avg_rate = %format!("{:.1}", produced as f64 / elapsed),
                "Generator progress"
            );
            next_log = Instant::now() + log_interval;
        }
    }

    let flushing = producer.clone();
    let flushed = tokio::task::spawn_blocking(move || flushing.flush(FLUSH_TIMEOUT)).await?;
    if let Err(e) = flushed {
        warn!(error = %e, "Producer flush incomplete");
    }

    info!(
        produced,
        errors = errors.load(Ordering::Relaxed),
        "Producer closed"
    );
    Ok(())
}

/// `{"id":N,"ts":"...","payload":"..."}` padded with random alphanumerics
/// to roughly `size` bytes.
fn build_payload<R: Rng>(rng: &mut R, seq: u64, size: usize) -> String {
    let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
    let header = format!("{{\"id\":{},\"ts\":\"{}\",\"payload\":\"", seq, ts);
    let footer = "\"}";
    let filler = size.saturating_sub(header.len() + footer.len());

    let mut payload = String::with_capacity(header.len() + filler + footer.len());
    payload.push_str(&header);
    payload.extend(rng.sample_iter(&Alphanumeric).take(filler).map(char::from));
    payload.push_str(footer);
    payload
}
