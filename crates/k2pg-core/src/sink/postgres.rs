//! PostgreSQL sink.
//!
//! Each batch is written in one transaction with multi-row inserts. Rows are
//! keyed by `(topic, partition, message_offset)` and conflicting rows are
//! skipped, so re-delivered records are harmless.
//!
//! Table layout:
//!
//! | column           | type          |
//! |------------------|---------------|
//! | `topic`          | `TEXT`        |
//! | `partition`      | `INTEGER`     |
//! | `message_offset` | `BIGINT`      |
//! | `key`            | `BYTEA`       |
//! | `value`          | `BYTEA`       |
//! | `headers`        | `JSONB`       |
//! | `event_time`     | `TIMESTAMPTZ` |

use super::BatchSink;
use crate::config::PostgresConfig;
use crate::error::{Error, Result, SinkError};
use crate::pool::Record;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

/// Rows per INSERT statement. Seven bind parameters per row keeps every
/// statement well under the protocol's 65535 parameter limit.
const ROWS_PER_STATEMENT: usize = 1000;

/// Writes record batches into a Postgres table.
///
/// Cloning shares the underlying connection pool.
#[derive(Clone)]
pub struct PostgresSink {
    pool: PgPool,
    table: String,
}

impl PostgresSink {
    /// Connect using the given settings, optionally creating the table.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let mut options = PgPoolOptions::new().max_connections(config.max_connections);
        if config.max_connection_lifetime_secs > 0 {
            options =
                options.max_lifetime(Duration::from_secs(config.max_connection_lifetime_secs));
        }
        if config.max_idle_secs > 0 {
            options = options.idle_timeout(Duration::from_secs(config.max_idle_secs));
        }

        let pool = options
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect(&config.url)
            .await
            .map_err(|e| Error::Sink(SinkError::Connection(e.to_string())))?;

        let sink = Self::from_pool(pool, &config.table)?;
        info!(
            table = %sink.table,
            max_connections = config.max_connections,
            "Connected to PostgreSQL"
        );

        if config.auto_create_table {
            sink.ensure_table().await?;
        }

        Ok(sink)
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool, table: &str) -> Result<Self> {
        Ok(Self {
            pool,
            table: quote_identifier(table)?,
        })
    }

    /// Create the target table if it does not exist.
    pub async fn ensure_table(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                topic TEXT NOT NULL,
                partition INTEGER NOT NULL,
                message_offset BIGINT NOT NULL,
                key BYTEA,
                value BYTEA,
                headers JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                event_time TIMESTAMPTZ NOT NULL,
                ingested_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (topic, partition, message_offset)
            )",
            self.table
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        debug!(table = %self.table, "Ensured sink table exists");
        Ok(())
    }

    /// Quick connectivity probe for health checks.
    pub async fn ping(&self) -> std::result::Result<(), SinkError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// The quoted table name rows are written to.
    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl BatchSink for PostgresSink {
    #[instrument(skip_all, fields(table = %self.table, records = records.len()))]
    async fn process_batch(&self, records: Vec<Record>) -> std::result::Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let headers = records
            .iter()
            .map(encode_headers)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut tx = self.pool.begin().await?;

        for (rows, headers) in records
            .chunks(ROWS_PER_STATEMENT)
            .zip(headers.chunks(ROWS_PER_STATEMENT))
        {
            let mut query = insert_prefix(&self.table);
            query.push_values(rows.iter().zip(headers), |mut row, (record, headers)| {
                row.push_bind(&record.topic)
                    .push_bind(record.partition)
                    .push_bind(record.offset)
                    .push_bind(record.key.as_deref())
                    .push_bind(record.value.as_deref())
                    .push_bind(Json(headers))
                    .push_bind(record.timestamp);
            });
            query.push(" ON CONFLICT (topic, partition, message_offset) DO NOTHING");
            query.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        debug!(
            duration_ms = start.elapsed().as_millis() as u64,
            "Batch committed"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "postgres"
    }
}

fn insert_prefix<'a>(table: &str) -> QueryBuilder<'a, Postgres> {
    QueryBuilder::new(format!(
        "INSERT INTO {} (topic, partition, message_offset, key, value, headers, event_time) ",
        table
    ))
}

/// Headers as a JSON object of base64-encoded values.
fn encode_headers(record: &Record) -> std::result::Result<serde_json::Value, SinkError> {
    let encoded: std::collections::BTreeMap<&str, String> = record
        .headers
        .iter()
        .map(|(k, v)| (k.as_str(), BASE64.encode(v)))
        .collect();
    serde_json::to_value(encoded).map_err(|e| SinkError::Encoding(e.to_string()))
}

/// Quote a table name, accepting an optional `schema.` prefix.
fn quote_identifier(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::Config("Postgres table name cannot be empty".into()));
    }

    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 || parts.iter().any(|p| p.is_empty()) {
        return Err(Error::Config(format!("Invalid Postgres table name: {}", name)));
    }

    Ok(parts
        .iter()
        .map(|p| format!("\"{}\"", p.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join("."))
}
