// Telemetry module for structured logging and metrics

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging with JSON formatting.
///
/// `RUST_LOG` takes precedence over the configured level.
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| level_filter(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(json_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(
        log_level = log_level,
        "Structured logging initialized with JSON formatting"
    );

    Ok(())
}

/// Filter for a configured level directive such as `info,common=debug`
fn level_filter(log_level: &str) -> Result<EnvFilter, ParseError> {
    EnvFilter::try_new(log_level)
}

/// Initialize Prometheus metrics exporter and describe the scheduler metrics
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!("cron_job_launched_total", "Total number of job launches");
    describe_counter!("cron_job_failed_total", "Total number of failed job runs");
    describe_counter!(
        "cron_job_skipped_total",
        "Due runs skipped because the previous run still held the lock"
    );
    describe_histogram!(
        "cron_job_duration_seconds",
        "Duration of job runs in seconds"
    );
    describe_gauge!(
        "cron_job_behind_seconds",
        "How far a job is behind its schedule beyond its catch-up window"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_job_launched(job_id: &str) {
    counter!("cron_job_launched_total", "job_id" => job_id.to_string()).increment(1);
}

#[inline]
pub fn record_job_failure(job_id: &str, reason: &str) {
    counter!(
        "cron_job_failed_total",
        "job_id" => job_id.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_job_skipped(job_id: &str) {
    counter!("cron_job_skipped_total", "job_id" => job_id.to_string()).increment(1);
}

#[inline]
pub fn record_job_duration(job_id: &str, duration_seconds: f64) {
    histogram!("cron_job_duration_seconds", "job_id" => job_id.to_string())
        .record(duration_seconds);
}

/// Set how far behind a job is; zero when it is on schedule
#[inline]
pub fn update_job_behind(job_id: &str, behind_seconds: i64) {
    gauge!("cron_job_behind_seconds", "job_id" => job_id.to_string())
        .set(behind_seconds as f64);
}
