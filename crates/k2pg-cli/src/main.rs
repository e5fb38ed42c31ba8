//! K2PG CLI - Kafka to Postgres batching ingestion tool.

use anyhow::Result;
use clap::{Parser, Subcommand};
use k2pg_core::config::LogFormat;
use k2pg_core::Config;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
/// - 128+N: Signal N received (e.g., 130 = SIGINT)
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, missing required fields)
    ConfigError = 1,
    /// Kafka-related error (connection, consumer, producer)
    KafkaError = 2,
    /// Postgres sink error (connection, schema, write)
    SinkError = 3,
    /// General runtime error
    RuntimeError = 10,
    /// Signal interrupt (SIGINT = 2, so 128 + 2 = 130)
    SignalInterrupt = 130,
}

impl ExitCode {
    /// Map an error to an exit code, preferring the typed core error.
    fn from_error(error: &anyhow::Error) -> Self {
        if let Some(core) = error.downcast_ref::<k2pg_core::Error>() {
            return match core {
                k2pg_core::Error::Config(_) | k2pg_core::Error::Serialization(_) => {
                    ExitCode::ConfigError
                }
                k2pg_core::Error::Kafka(_) => ExitCode::KafkaError,
                k2pg_core::Error::Sink(_) => ExitCode::SinkError,
                k2pg_core::Error::Shutdown => ExitCode::SignalInterrupt,
                k2pg_core::Error::Pool(_) | k2pg_core::Error::Io(_) => ExitCode::RuntimeError,
            };
        }

        let error_str = error.to_string().to_lowercase();
        if error_str.contains("config") || error_str.contains("toml") {
            ExitCode::ConfigError
        } else if error_str.contains("kafka") || error_str.contains("producer") {
            ExitCode::KafkaError
        } else if error_str.contains("postgres") || error_str.contains("database") {
            ExitCode::SinkError
        } else {
            ExitCode::RuntimeError
        }
    }
}

mod commands;
mod server;

#[derive(Parser)]
#[command(name = "k2pg")]
#[command(about = "Kafka to Postgres batching ingestion CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume from Kafka and write batches to Postgres
    Ingest {
        /// Override Kafka bootstrap servers
        #[arg(long)]
        bootstrap_servers: Option<String>,

        /// Override Kafka topic
        #[arg(long)]
        topic: Option<String>,

        /// Override consumer group
        #[arg(long)]
        consumer_group: Option<String>,

        /// Override the Postgres connection URL
        #[arg(long)]
        database_url: Option<String>,

        /// Override the number of workers
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Produce synthetic load into the configured topic
    Generate(commands::generate::GenerateArgs),

    /// Show status and health
    Status {
        /// Health endpoint URL
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,

        /// Metrics endpoint URL
        #[arg(long, default_value = "http://localhost:2112")]
        metrics_url: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Logging comes up before full validation, so read the file leniently.
    let monitoring = cli
        .config
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.monitoring)
        .unwrap_or_default();

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(monitoring.log_level.as_str()),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match monitoring.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
        }
    }

    match execute_command(cli).await {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

async fn execute_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Ingest {
            bootstrap_servers,
            topic,
            consumer_group,
            database_url,
            workers,
        } => {
            let mut config = Config::load(cli.config.as_deref())?;
            let overrides = commands::ingest::Overrides {
                bootstrap_servers,
                topic,
                consumer_group,
                database_url,
                workers,
            };
            overrides.apply(&mut config);
            config.validate()?;
            commands::ingest::run(config).await?;
        }

        Commands::Generate(args) => {
            let config = load_kafka_only(cli.config.as_deref())?;
            commands::generate::run(config, args).await?;
        }

        Commands::Status { url, metrics_url } => {
            commands::status::run(&url, &metrics_url).await?;
        }

        Commands::Validate => {
            let path = cli.config.unwrap_or_else(|| PathBuf::from("config.toml"));
            Config::from_file(&path)?;
            println!("Configuration is valid");
        }
    }

    Ok(())
}

/// The generator only needs the Kafka section, so Postgres settings are
/// not validated.
fn load_kafka_only(path: Option<&std::path::Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => toml::from_str::<Config>(&std::fs::read_to_string(path)?)?,
        None => Config::default(),
    };
    config.apply_env_overrides()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k2pg_core::{KafkaError, SinkError};

    #[test]
    fn test_exit_code_from_core_errors() {
        let err = anyhow::Error::from(k2pg_core::Error::Config("missing url".into()));
        assert_eq!(ExitCode::from_error(&err), ExitCode::ConfigError);

        let err = anyhow::Error::from(k2pg_core::Error::Kafka(KafkaError::ConsumerClosed));
        assert_eq!(ExitCode::from_error(&err), ExitCode::KafkaError);

        let err = anyhow::Error::from(k2pg_core::Error::Sink(SinkError::Connection(
            "refused".into(),
        )));
        assert_eq!(ExitCode::from_error(&err), ExitCode::SinkError);
    }

    #[test]
    fn test_exit_code_fallback() {
        let err = anyhow::anyhow!("Producer queue full");
        assert_eq!(ExitCode::from_error(&err), ExitCode::KafkaError);

        let err = anyhow::anyhow!("something else");
        assert_eq!(ExitCode::from_error(&err), ExitCode::RuntimeError);
    }

    #[test]
    fn test_cli_parses_generate() {
        let cli = Cli::try_parse_from([
            "k2pg",
            "generate",
            "--rate",
            "500",
            "--total",
            "10",
            "--compression",
            "zstd",
        ])
        .unwrap();

        match cli.command {
            Commands::Generate(args) => {
                assert_eq!(args.rate, 500);
                assert_eq!(args.total, 10);
            }
            _ => panic!("expected generate"),
        }
    }
}
