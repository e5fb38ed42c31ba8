//! Status command implementation.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// Health report returned by `/health`.
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    #[serde(default)]
    job_running: bool,
    #[serde(default)]
    components: BTreeMap<String, ComponentStatus>,
}

#[derive(Debug, Deserialize)]
struct ComponentStatus {
    status: String,
    reason: Option<String>,
}

/// Show status and health.
pub async fn run(url: &str, metrics_url: &str) -> Result<()> {
    println!("Checking health at {}...\n", url);

    let health_url = format!("{}/health", url.trim_end_matches('/'));
    let client = reqwest::Client::new();

    match client.get(&health_url).send().await {
        Ok(response) => {
            let status_code = response.status();
            match response.json::<HealthResponse>().await {
                Ok(health) => print_health_status(&health, status_code.as_u16()),
                Err(e) => {
                    println!("Failed to parse health response: {}", e);
                    println!("HTTP Status: {}", status_code);
                }
            }
        }
        Err(e) => {
            println!("Failed to connect to health endpoint: {}", e);
            println!("\nIs the k2pg ingestion service running?");
            println!("Start it with: k2pg ingest --config <path-to-config>");
            return Ok(());
        }
    }

    let metrics_url = format!("{}/metrics", metrics_url.trim_end_matches('/'));
    println!("\n--- Metrics ---");
    println!("Fetching from {}...\n", metrics_url);

    match client.get(&metrics_url).send().await {
        Ok(response) => {
            let text = response.text().await.context("Failed to read metrics")?;
            print_metrics(&text);
        }
        Err(e) => {
            println!("Failed to fetch metrics: {}", e);
        }
    }

    Ok(())
}

fn status_tag(status: &str) -> &'static str {
    match status {
        "healthy" => "[OK]",
        "degraded" => "[WARN]",
        "unhealthy" => "[FAIL]",
        _ => "[?]",
    }
}

fn print_health_status(health: &HealthResponse, status_code: u16) {
    println!(
        "{} Overall Status: {} (HTTP {})",
        status_tag(&health.status),
        health.status.to_uppercase(),
        status_code
    );
    println!(
        "Ingestion job: {}",
        if health.job_running { "running" } else { "stopped" }
    );
    println!();

    if !health.components.is_empty() {
        println!("Components:");
        for (name, status) in &health.components {
            match &status.reason {
                Some(reason) => println!(
                    "  {} {}: {} ({})",
                    status_tag(&status.status),
                    name,
                    status.status,
                    reason
                ),
                None => println!("  {} {}: {}", status_tag(&status.status), name, status.status),
            }
        }
    }
}

/// Parse unlabeled `name value` samples from Prometheus text.
fn parse_samples(metrics_text: &str) -> HashMap<&str, u64> {
    metrics_text
        .lines()
        .filter(|line| !line.starts_with('#') && !line.is_empty())
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?;
            let value = parts.next()?.parse::<u64>().ok()?;
            Some((name, value))
        })
        .collect()
}

fn print_metrics(metrics_text: &str) {
    let values = parse_samples(metrics_text);

    let rows = [
        ("k2pg_messages_consumed_total", "Messages Consumed:    "),
        ("k2pg_records_flushed_total", "Records Flushed:      "),
        ("k2pg_batches_flushed_total", "Batches Flushed:      "),
        ("k2pg_errors_total", "Errors:               "),
        ("k2pg_retries_scheduled_total", "Retries Scheduled:    "),
        ("k2pg_jobs_dropped_total", "Jobs Dropped:         "),
        ("k2pg_submissions_rejected_total", "Submissions Rejected: "),
        ("k2pg_queue_depth", "Queue Depth:          "),
        ("k2pg_live_workers", "Live Workers:         "),
    ];

    for (name, label) in rows {
        if let Some(v) = values.get(name) {
            println!("{}{}", label, format_number(*v));
        }
    }

    if values.is_empty() {
        println!("No metrics available yet.");
    }
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000_000 {
        format!("{:.2}B", n as f64 / 1_000_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}
