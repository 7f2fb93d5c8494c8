// Scheduler binary entry point

use anyhow::Context;
use common::clock::SystemClock;
use common::config::Settings;
use common::launcher::ProcessLauncher;
use common::lock::LocalLock;
use common::schedule::{job_skew, ScheduleTrigger};
use common::scheduler::{Scheduler, SchedulerConfig, SchedulerEngine};
use common::storage::FileStateStore;
use common::telemetry;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration before logging so the configured level applies
    let settings = Settings::load().context("Failed to load configuration")?;

    telemetry::init_logging(&settings.observability.log_level)?;
    info!("Starting crontab scheduler");

    settings.validate().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    let scheduler_config = SchedulerConfig::from_settings(&settings.scheduler)?;
    info!(
        timezone = %scheduler_config.timezone,
        poll_interval_seconds = scheduler_config.poll_interval_seconds,
        state_path = %settings.scheduler.state_path.display(),
        jobs = settings.jobs.len(),
        "Configuration loaded"
    );

    let now = chrono::Utc::now().timestamp();
    for job in &settings.jobs {
        let next = job
            .schedule
            .next_execution_time(&scheduler_config.timezone, job_skew(&job.id), now)?;
        info!(
            job_id = %job.id,
            title = job.label(),
            enabled = job.enabled,
            rules = ?job.schedule.rules(),
            next_run = ?next.and_then(|ts| chrono::DateTime::from_timestamp(ts, 0)),
            "Job registered"
        );
    }

    let store = FileStateStore::open(
        &settings.scheduler.state_path,
        settings.scheduler.history_limit,
    )
    .await
    .context("Failed to open run state")?;

    let scheduler = Arc::new(SchedulerEngine::new(
        scheduler_config,
        settings.jobs.clone(),
        Arc::new(SystemClock),
        Arc::new(store),
        Arc::new(LocalLock::new()),
        Arc::new(ProcessLauncher::new()),
    ));
    info!("Scheduler engine created");

    // Set up graceful shutdown
    let scheduler_for_shutdown = scheduler.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Received Ctrl+C signal, initiating graceful shutdown");
        if let Err(e) = scheduler_for_shutdown.stop().await {
            error!(error = %e, "Error during scheduler shutdown");
        }
    });

    info!("Starting scheduler polling loop");
    if let Err(e) = scheduler.start().await {
        error!(error = %e, "Scheduler error");
        return Err(anyhow::anyhow!(e));
    }

    // Runs launched before the shutdown signal finish and are recorded
    scheduler.wait_idle().await;
    info!("Scheduler stopped");
    Ok(())
}
