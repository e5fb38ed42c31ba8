//! Configuration structures for k2pg.
//!
//! Configuration is loaded from a TOML file, then overridden by environment
//! variables, then by CLI flags.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::pool::{BackoffPolicy, PoolOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Kafka consumer configuration
    #[serde(default)]
    pub kafka: KafkaConfig,

    /// PostgreSQL sink configuration
    #[serde(default)]
    pub postgres: PostgresConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub pool: PoolConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Kafka consumer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: Vec<String>,

    /// Topic to consume from
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u32,

    /// Interval between automatic commits of acknowledged offsets
    #[serde(default = "default_auto_commit_interval_ms")]
    pub auto_commit_interval_ms: u32,

    /// Max poll interval in milliseconds
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,

    /// Messages prefetched per partition
    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: usize,

    /// Auto offset reset strategy
    #[serde(default)]
    pub auto_offset_reset: OffsetReset,

    /// Security configuration
    #[serde(default)]
    pub security: KafkaSecurityConfig,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            topic: default_topic(),
            consumer_group: default_consumer_group(),
            session_timeout_ms: default_session_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            auto_commit_interval_ms: default_auto_commit_interval_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            max_poll_records: default_max_poll_records(),
            auto_offset_reset: OffsetReset::default(),
            security: KafkaSecurityConfig::default(),
        }
    }
}

/// Kafka auto offset reset strategy.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    /// Start from earliest offset
    #[default]
    Earliest,
    /// Start from latest offset
    Latest,
}

/// Kafka security configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KafkaSecurityConfig {
    /// Security protocol (PLAINTEXT, SSL, SASL_SSL, SASL_PLAINTEXT)
    pub protocol: Option<String>,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    pub sasl_mechanism: Option<String>,

    /// SASL username
    pub sasl_username: Option<String>,

    /// SASL password
    pub sasl_password: Option<String>,

    /// SSL CA certificate location
    pub ssl_ca_location: Option<PathBuf>,

    /// SSL client certificate location
    pub ssl_cert_location: Option<PathBuf>,

    /// SSL client key location
    pub ssl_key_location: Option<PathBuf>,
}

/// PostgreSQL sink configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    /// Connection URL (required)
    #[serde(default)]
    pub url: String,

    /// Target table, optionally schema-qualified
    #[serde(default = "default_table")]
    pub table: String,

    /// Maximum pool connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Maximum connection lifetime in seconds (0 = unlimited)
    #[serde(default = "default_max_connection_lifetime_secs")]
    pub max_connection_lifetime_secs: u64,

    /// Idle timeout in seconds (0 = unlimited)
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,

    /// Time to wait for a free connection
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Create the table on startup if missing
    #[serde(default = "default_true")]
    pub auto_create_table: bool,

    /// Circuit breaker in front of the sink
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            table: default_table(),
            max_connections: default_max_connections(),
            max_connection_lifetime_secs: default_max_connection_lifetime_secs(),
            max_idle_secs: default_max_idle_secs(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            auto_create_table: true,
            circuit_breaker: CircuitBreakerSettings::default(),
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consecutive failed flushes before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds the circuit stays open before probing
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,

    /// Successful probes needed to close the circuit
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_failure_threshold(self.failure_threshold)
            .with_reset_timeout(Duration::from_secs(self.reset_timeout_secs))
            .with_success_threshold(self.success_threshold)
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Number of worker tasks
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Capacity of the shared job queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Jobs per batch
    #[serde(default = "default_pool_batch_size")]
    pub batch_size: usize,

    /// Flush timer period in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Retries per job before it is dropped
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            batch_size: default_pool_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl PoolConfig {
    pub fn to_options(&self) -> PoolOptions {
        PoolOptions {
            worker_count: self.worker_count,
            queue_capacity: self.queue_capacity,
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            max_retries: self.max_retries,
            backoff: BackoffPolicy::default(),
        }
        .normalized()
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Metrics HTTP port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Health check HTTP port
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_port: default_metrics_port(),
            health_port: default_health_port(),
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions
fn default_bootstrap_servers() -> Vec<String> {
    vec!["localhost:9092".into()]
}
fn default_topic() -> String {
    "staging.events".into()
}
fn default_consumer_group() -> String {
    "event-writer".into()
}
fn default_session_timeout_ms() -> u32 {
    30000
}
fn default_heartbeat_interval_ms() -> u32 {
    3000
}
fn default_auto_commit_interval_ms() -> u32 {
    3000
}
fn default_max_poll_interval_ms() -> u32 {
    300000 // 5 minutes
}
fn default_max_poll_records() -> usize {
    500
}
fn default_table() -> String {
    "kafka_events".into()
}
fn default_max_connections() -> u32 {
    128
}
fn default_max_connection_lifetime_secs() -> u64 {
    1800 // 30 minutes
}
fn default_max_idle_secs() -> u64 {
    300
}
fn default_acquire_timeout_ms() -> u64 {
    5000
}
fn default_true() -> bool {
    true
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_secs() -> u64 {
    30
}
fn default_success_threshold() -> u32 {
    2
}
fn default_worker_count() -> usize {
    80
}
fn default_queue_capacity() -> usize {
    8192
}
fn default_pool_batch_size() -> usize {
    256
}
fn default_flush_interval_ms() -> u64 {
    40
}
fn default_max_retries() -> u32 {
    5
}
fn default_metrics_port() -> u16 {
    2112
}
fn default_health_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from an optional file plus the process
    /// environment, then validate it.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                toml::from_str::<Config>(&content)?
            }
            None => Config::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> crate::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`. Blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> crate::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(brokers) = get("KAFKA_BROKERS") {
            self.kafka.bootstrap_servers = brokers
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(topic) = get("KAFKA_TOPIC") {
            self.kafka.topic = topic;
        }
        if let Some(group) = get("KAFKA_GROUP") {
            self.kafka.consumer_group = group;
        }
        if let Some(v) = get("KAFKA_SESSION_TIMEOUT") {
            self.kafka.session_timeout_ms = parse_duration_ms("KAFKA_SESSION_TIMEOUT", &v)? as u32;
        }
        if let Some(v) = get("KAFKA_HEARTBEAT") {
            let ms = parse_duration_ms("KAFKA_HEARTBEAT", &v)? as u32;
            self.kafka.heartbeat_interval_ms = ms;
            self.kafka.auto_commit_interval_ms = ms;
        }
        if let Some(v) = get("KAFKA_MAX_POLL") {
            self.kafka.max_poll_records = parse_number("KAFKA_MAX_POLL", &v)?;
        }

        if let Some(url) = get("DATABASE_URL") {
            self.postgres.url = url;
        }
        if let Some(table) = get("DB_TABLE") {
            self.postgres.table = table;
        }
        if let Some(v) = get("DB_MAX_CONNS") {
            self.postgres.max_connections = parse_number("DB_MAX_CONNS", &v)?;
        }
        if let Some(v) = get("DB_MAX_CONN_LIFETIME") {
            self.postgres.max_connection_lifetime_secs =
                parse_duration_ms("DB_MAX_CONN_LIFETIME", &v)? / 1000;
        }
        if let Some(v) = get("DB_MAX_CONN_IDLE") {
            self.postgres.max_idle_secs = parse_duration_ms("DB_MAX_CONN_IDLE", &v)? / 1000;
        }

        if let Some(v) = get("WORKER_COUNT") {
            self.pool.worker_count = parse_number("WORKER_COUNT", &v)?;
        }
        if let Some(v) = get("JOB_BUFFER") {
            self.pool.queue_capacity = parse_number("JOB_BUFFER", &v)?;
        }
        if let Some(v) = get("BATCH_SIZE") {
            self.pool.batch_size = parse_number("BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("BATCH_FLUSH_INTERVAL") {
            self.pool.flush_interval_ms = parse_duration_ms("BATCH_FLUSH_INTERVAL", &v)?;
        }
        if let Some(v) = get("MAX_RETRIES") {
            self.pool.max_retries = parse_number("MAX_RETRIES", &v)?;
        }

        if let Some(addr) = get("METRICS_ADDR") {
            let port = addr.rsplit(':').next().unwrap_or(&addr);
            self.monitoring.metrics_port = parse_number("METRICS_ADDR", port)?;
        }

        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.kafka.bootstrap_servers.is_empty() {
            return Err(crate::Error::Config(
                "At least one bootstrap server required".into(),
            ));
        }

        if self.kafka.topic.is_empty() {
            return Err(crate::Error::Config("Kafka topic is required".into()));
        }

        if self.kafka.consumer_group.is_empty() {
            return Err(crate::Error::Config("Consumer group is required".into()));
        }

        if self.postgres.url.trim().is_empty() {
            return Err(crate::Error::Config(
                "Database URL is required (postgres.url or DATABASE_URL)".into(),
            ));
        }

        if self.postgres.table.trim().is_empty() {
            return Err(crate::Error::Config("Postgres table is required".into()));
        }

        if self.kafka.heartbeat_interval_ms >= self.kafka.session_timeout_ms {
            tracing::warn!(
                heartbeat_ms = self.kafka.heartbeat_interval_ms,
                session_timeout_ms = self.kafka.session_timeout_ms,
                "Heartbeat interval should be well below the session timeout"
            );
        }

        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> crate::Result<T> {
    value
        .parse()
        .map_err(|_| crate::Error::Config(format!("Invalid integer for {}: {:?}", key, value)))
}

/// Parse `250`, `250ms`, `3s`, `30m` or `1h` into milliseconds. Bare numbers
/// are milliseconds.
fn parse_duration_ms(key: &str, value: &str) -> crate::Result<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);

    let amount: u64 = digits
        .parse()
        .map_err(|_| crate::Error::Config(format!("Invalid duration for {}: {:?}", key, value)))?;
    let factor = match unit {
        "" | "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        _ => {
            return Err(crate::Error::Config(format!(
                "Invalid duration unit for {}: {:?}",
                key, value
            )))
        }
    };
    Ok(amount * factor)
}
