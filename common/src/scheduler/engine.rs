// Scheduler engine implementation

use crate::clock::Clock;
use crate::config;
use crate::errors::{ExecutionError, ScheduleError};
use crate::launcher::JobLauncher;
use crate::lock::{JobLock, LockGuard};
use crate::models::{CronJob, RunRecord, RunStatus};
use crate::schedule::{behind_by, default_timezone, job_skew, ScheduleTrigger};
use crate::storage::JobStateStore;
use crate::telemetry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

/// Configuration for the scheduler engine
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to evaluate the jobs (in seconds)
    pub poll_interval_seconds: u64,
    /// Minimum TTL for job locks (in seconds)
    pub lock_ttl_seconds: u64,
    /// Timezone rule fields are evaluated in
    pub timezone: Tz,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 60,
            lock_ttl_seconds: 3600,
            timezone: default_timezone(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_settings(settings: &config::SchedulerConfig) -> Result<Self, ScheduleError> {
        Ok(Self {
            poll_interval_seconds: settings.poll_interval_seconds,
            lock_ttl_seconds: settings.lock_ttl_seconds,
            timezone: settings.timezone()?,
        })
    }
}

/// Scheduler trait for job scheduling operations
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Start the scheduler polling loop
    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Stop the scheduler gracefully, waiting for running jobs
    async fn stop(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Launch the jobs that are due now, returning how many were launched
    async fn process_due_jobs(&self) -> Result<usize, Box<dyn std::error::Error + Send + Sync>>;
}

/// Collaborators a spawned run needs
#[derive(Clone)]
struct RunContext {
    clock: Arc<dyn Clock>,
    store: Arc<dyn JobStateStore>,
    launcher: Arc<dyn JobLauncher>,
}

/// Main scheduler engine implementation
pub struct SchedulerEngine {
    config: SchedulerConfig,
    jobs: Vec<CronJob>,
    ctx: RunContext,
    lock: Arc<dyn JobLock>,
    /// Start time of the latest launch or skip per job, covering runs that
    /// have not been recorded in the store yet
    last_launch: Mutex<HashMap<String, i64>>,
    running: Mutex<JoinSet<()>>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl SchedulerEngine {
    /// Create a new scheduler engine
    pub fn new(
        config: SchedulerConfig,
        jobs: Vec<CronJob>,
        clock: Arc<dyn Clock>,
        store: Arc<dyn JobStateStore>,
        lock: Arc<dyn JobLock>,
        launcher: Arc<dyn JobLauncher>,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel(1);

        Self {
            config,
            jobs,
            ctx: RunContext {
                clock,
                store,
                launcher,
            },
            lock,
            last_launch: Mutex::new(HashMap::new()),
            running: Mutex::new(JoinSet::new()),
            shutdown_tx,
        }
    }

    /// Get a shutdown signal receiver
    pub fn shutdown_receiver(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn jobs(&self) -> &[CronJob] {
        &self.jobs
    }

    /// Wait until every launched run has finished and been recorded
    pub async fn wait_idle(&self) {
        let mut running = self.running.lock().await;
        while let Some(result) = running.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Job run task failed");
            }
        }
    }

    /// Launch a job immediately, ignoring its schedule
    #[instrument(skip(self))]
    pub async fn trigger(&self, job_id: &str) -> Result<(), ExecutionError> {
        let job = self
            .jobs
            .iter()
            .find(|job| job.id == job_id)
            .ok_or_else(|| ExecutionError::JobNotFound(job_id.to_string()))?;
        self.launch(job, None, self.ctx.clock.now()).await;
        Ok(())
    }

    /// Last run of a job, taking unrecorded launches into account
    async fn last_run(&self, job_id: &str) -> Result<Option<i64>, crate::errors::StorageError> {
        let stored = self
            .ctx
            .store
            .last_run(job_id)
            .await?
            .map(|record| record.started_at.timestamp());
        let launched = self.last_launch.lock().await.get(job_id).copied();
        Ok(stored.max(launched))
    }

    /// Decide whether one job is due and launch it if so
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn evaluate_job(&self, job: &CronJob, now: i64) -> bool {
        let last_run = match self.last_run(&job.id).await {
            Ok(last_run) => last_run,
            Err(e) => {
                error!(error = %e, "Failed to read run state, skipping job");
                return false;
            }
        };

        let tz = &self.config.timezone;
        let due = match job.schedule.due_at(tz, job_skew(&job.id), last_run, now) {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Invalid schedule, skipping job");
                return false;
            }
        };

        match due {
            Some(scheduled) => {
                debug!(scheduled, last_run, "Job is due");
                self.launch(job, Some(scheduled), now).await
            }
            None => {
                self.check_behind(job, last_run, now);
                false
            }
        }
    }

    fn check_behind(&self, job: &CronJob, last_run: Option<i64>, now: i64) {
        match behind_by(job, &self.config.timezone, last_run, now) {
            Ok(Some(behind)) => {
                warn!(behind_seconds = behind, "Job is behind schedule");
                telemetry::update_job_behind(&job.id, behind);
            }
            Ok(None) => telemetry::update_job_behind(&job.id, 0),
            Err(e) => debug!(error = %e, "Could not compute schedule lag"),
        }
    }

    /// Take the job lock and spawn the run. Returns whether a run started.
    ///
    /// `now` is the instant the job was found due. It becomes the run's start
    /// time, so a later clock read cannot consume the next scheduled minute.
    async fn launch(&self, job: &CronJob, scheduled: Option<i64>, now: i64) -> bool {
        self.last_launch.lock().await.insert(job.id.clone(), now);
        let started_at = DateTime::from_timestamp(now, 0).unwrap_or_default();

        let guard = match self.acquire(job).await {
            Ok(guard) => guard,
            Err(reason) => {
                info!(reason = %reason, "Previous run still active, skipping");
                telemetry::record_job_skipped(&job.id);
                let record = RunRecord {
                    run_id: Uuid::new_v4(),
                    job_id: job.id.clone(),
                    scheduled_for: scheduled.and_then(|s| DateTime::from_timestamp(s, 0)),
                    started_at,
                    finished_at: started_at,
                    status: RunStatus::Skipped,
                    message: Some(reason),
                };
                if let Err(e) = self.ctx.store.record_run(record).await {
                    error!(error = %e, "Failed to record skipped run");
                }
                return false;
            }
        };

        let run_id = Uuid::new_v4();
        let ctx = self.ctx.clone();
        let job = job.clone();
        let span = tracing::info_span!("job_run", job_id = %job.id, run_id = %run_id);
        telemetry::record_job_launched(&job.id);
        info!(run_id = %run_id, scheduled, "Launching job");

        self.running.lock().await.spawn(
            async move {
                run_job(ctx, job, run_id, scheduled, started_at, guard).await;
            }
            .instrument(span),
        );
        true
    }

    async fn acquire(&self, job: &CronJob) -> Result<Option<LockGuard>, String> {
        if job.allow_concurrent {
            return Ok(None);
        }
        let ttl = Duration::from_secs(self.config.lock_ttl_seconds.max(job.timeout_seconds));
        self.lock
            .acquire(&format!("cron:job:{}", job.id), ttl)
            .await
            .map(Some)
            .map_err(|e| e.to_string())
    }
}

/// Run a launched job to completion and record the outcome
async fn run_job(
    ctx: RunContext,
    job: CronJob,
    run_id: Uuid,
    scheduled: Option<i64>,
    started_at: DateTime<Utc>,
    guard: Option<LockGuard>,
) {
    let result = ctx.launcher.launch(&job).await;
    let finished_at = ctx.clock.now_utc();

    let (status, message) = match result {
        Ok(outcome) => {
            info!(exit_code = outcome.exit_code, "Job finished");
            let message = (!outcome.output_tail.is_empty()).then_some(outcome.output_tail);
            (RunStatus::Success, message)
        }
        Err(ExecutionError::Timeout(secs)) => {
            error!(timeout_seconds = secs, "Job timed out");
            telemetry::record_job_failure(&job.id, "timeout");
            (RunStatus::TimedOut, Some(format!("timed out after {} seconds", secs)))
        }
        Err(e) => {
            error!(error = %e, "Job failed");
            telemetry::record_job_failure(&job.id, "error");
            (RunStatus::Failed, Some(e.to_string()))
        }
    };

    let record = RunRecord {
        run_id,
        job_id: job.id.clone(),
        scheduled_for: scheduled.and_then(|s| DateTime::from_timestamp(s, 0)),
        started_at,
        finished_at,
        status,
        message,
    };
    telemetry::record_job_duration(&job.id, record.duration_seconds());

    if let Err(e) = ctx.store.record_run(record).await {
        error!(error = %e, "Failed to record job run");
    }

    // Released only after the record is stored.
    if let Some(guard) = guard {
        debug!(
            resource = guard.resource(),
            held_ms = guard.elapsed().as_millis() as u64,
            "Releasing job lock"
        );
    }
}

#[async_trait]
impl Scheduler for SchedulerEngine {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(
            poll_interval_seconds = self.config.poll_interval_seconds,
            timezone = %self.config.timezone,
            jobs = self.jobs.len(),
            "Starting scheduler engine"
        );

        let mut poll_interval = interval(Duration::from_secs(self.config.poll_interval_seconds));
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_receiver();

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    debug!("Evaluating job schedules");

                    match self.process_due_jobs().await {
                        Ok(count) => {
                            if count > 0 {
                                info!(jobs_launched = count, "Launched due jobs");
                            } else {
                                debug!("No jobs due");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Error processing due jobs");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }

        info!("Scheduler engine stopped");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("Stopping scheduler engine");

        let _ = self.shutdown_tx.send(());
        self.wait_idle().await;

        info!("Scheduler engine stopped gracefully");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn process_due_jobs(&self) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        let now = self.ctx.clock.now();
        let mut launched = 0;

        for job in self.jobs.iter().filter(|job| job.enabled) {
            if self.evaluate_job(job, now).await {
                launched += 1;
            }
        }

        // Reap finished runs so the set does not grow unbounded.
        let mut running = self.running.lock().await;
        while let Some(result) = running.try_join_next() {
            if let Err(e) = result {
                error!(error = %e, "Job run task failed");
            }
        }

        Ok(launched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::launcher::LaunchOutcome;
    use crate::lock::LocalLock;
    use crate::models::{JobCommand, JobSchedule};
    use crate::storage::MemoryStateStore;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLauncher {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl JobLauncher for CountingLauncher {
        async fn launch(&self, _job: &CronJob) -> Result<LaunchOutcome, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ExecutionError::NonZeroExit {
                    code: Some(1),
                    stderr: "boom".to_string(),
                })
            } else {
                Ok(LaunchOutcome {
                    exit_code: Some(0),
                    output_tail: String::new(),
                })
            }
        }
    }

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap().timestamp()
    }

    fn noon_job() -> CronJob {
        CronJob {
            id: "noon".to_string(),
            title: None,
            enabled: true,
            schedule: JobSchedule::Crontab {
                rules: vec!["0 12 * * *".to_string()],
                catch_up: 3600,
            },
            command: JobCommand {
                program: "/bin/true".to_string(),
                ..Default::default()
            },
            timeout_seconds: 60,
            allow_concurrent: false,
        }
    }

    fn engine(
        jobs: Vec<CronJob>,
        now: i64,
        fail: bool,
    ) -> (SchedulerEngine, Arc<FixedClock>, Arc<MemoryStateStore>, Arc<CountingLauncher>) {
        let clock = Arc::new(FixedClock::new(now));
        let store = Arc::new(MemoryStateStore::new());
        let launcher = Arc::new(CountingLauncher {
            calls: AtomicUsize::new(0),
            fail,
        });
        let engine = SchedulerEngine::new(
            SchedulerConfig::default(),
            jobs,
            clock.clone(),
            store.clone(),
            Arc::new(LocalLock::new()),
            launcher.clone(),
        );
        (engine, clock, store, launcher)
    }

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.poll_interval_seconds, 60);
        assert_eq!(config.lock_ttl_seconds, 3600);
        assert_eq!(config.timezone, Tz::UTC);
    }

    #[test]
    fn test_scheduler_config_from_settings() {
        let mut settings = crate::config::SchedulerConfig::default();
        settings.timezone = "Asia/Ho_Chi_Minh".to_string();
        let config = SchedulerConfig::from_settings(&settings).unwrap();
        assert_eq!(config.timezone.to_string(), "Asia/Ho_Chi_Minh");

        settings.timezone = "bogus".to_string();
        assert!(SchedulerConfig::from_settings(&settings).is_err());
    }

    #[tokio::test]
    async fn test_due_job_runs_once_per_scheduled_minute() {
        let (engine, clock, store, launcher) = engine(vec![noon_job()], ts(2008, 1, 2, 12, 0), false);

        assert_eq!(engine.process_due_jobs().await.unwrap(), 1);
        engine.wait_idle().await;

        // Same scheduled minute on the next tick.
        clock.advance(60);
        assert_eq!(engine.process_due_jobs().await.unwrap(), 0);

        // Next day.
        clock.set(ts(2008, 1, 3, 12, 0));
        assert_eq!(engine.process_due_jobs().await.unwrap(), 1);
        engine.wait_idle().await;

        assert_eq!(launcher.calls.load(Ordering::SeqCst), 2);
        let history = store.history("noon", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.status == RunStatus::Success));
        assert_eq!(
            history[0].scheduled_for.map(|s| s.timestamp()),
            Some(ts(2008, 1, 3, 12, 0))
        );
    }

    /// Clock that moves one second forward on every read
    struct SteppingClock {
        now: std::sync::atomic::AtomicI64,
    }

    impl Clock for SteppingClock {
        fn now(&self) -> i64 {
            self.now.fetch_add(1, Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_launch_at_minute_end_keeps_next_minute() {
        let clock = Arc::new(SteppingClock {
            now: std::sync::atomic::AtomicI64::new(ts(2008, 1, 2, 12, 0) + 59),
        });
        let launcher = Arc::new(CountingLauncher {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let store = Arc::new(MemoryStateStore::new());
        let mut job = noon_job();
        job.schedule = JobSchedule::Crontab {
            rules: vec!["* * * * *".to_string()],
            catch_up: 300,
        };
        let engine = SchedulerEngine::new(
            SchedulerConfig::default(),
            vec![job],
            clock.clone(),
            store.clone(),
            Arc::new(LocalLock::new()),
            launcher.clone(),
        );

        // Evaluated at 12:00:59; later reads already fall in 12:01.
        assert_eq!(engine.process_due_jobs().await.unwrap(), 1);
        engine.wait_idle().await;
        let last = store.last_run("noon").await.unwrap().unwrap();
        assert_eq!(last.started_at.timestamp(), ts(2008, 1, 2, 12, 0) + 59);

        clock.now.store(ts(2008, 1, 2, 12, 1) + 30, Ordering::SeqCst);
        assert_eq!(engine.process_due_jobs().await.unwrap(), 1);
        engine.wait_idle().await;
        assert_eq!(launcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_not_due_outside_schedule() {
        let (engine, _clock, store, launcher) = engine(vec![noon_job()], ts(2008, 1, 2, 14, 0), false);
        assert_eq!(engine.process_due_jobs().await.unwrap(), 0);
        engine.wait_idle().await;
        assert_eq!(launcher.calls.load(Ordering::SeqCst), 0);
        assert!(store.history("noon", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_jobs_are_ignored() {
        let mut job = noon_job();
        job.enabled = false;
        let (engine, _clock, _store, launcher) = engine(vec![job], ts(2008, 1, 2, 12, 0), false);
        assert_eq!(engine.process_due_jobs().await.unwrap(), 0);
        assert_eq!(launcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_rule_does_not_block_other_jobs() {
        let mut broken = noon_job();
        broken.id = "broken".to_string();
        broken.schedule = JobSchedule::Crontab {
            rules: vec!["0 12 * *".to_string()],
            catch_up: 3600,
        };
        let (engine, _clock, _store, launcher) =
            engine(vec![broken, noon_job()], ts(2008, 1, 2, 12, 0), false);
        assert_eq!(engine.process_due_jobs().await.unwrap(), 1);
        engine.wait_idle().await;
        assert_eq!(launcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_recorded() {
        let (engine, _clock, store, _launcher) = engine(vec![noon_job()], ts(2008, 1, 2, 12, 0), true);
        assert_eq!(engine.process_due_jobs().await.unwrap(), 1);
        engine.wait_idle().await;

        let last = store.last_run("noon").await.unwrap().unwrap();
        assert_eq!(last.status, RunStatus::Failed);
        assert!(last.message.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_held_lock_records_skip() {
        let lock = Arc::new(LocalLock::new());
        let _held = lock
            .acquire("cron:job:noon", Duration::from_secs(600))
            .await
            .unwrap();
        let store = Arc::new(MemoryStateStore::new());
        let launcher = Arc::new(CountingLauncher {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let engine = SchedulerEngine::new(
            SchedulerConfig::default(),
            vec![noon_job()],
            Arc::new(FixedClock::new(ts(2008, 1, 2, 12, 0))),
            store.clone(),
            lock,
            launcher.clone(),
        );

        assert_eq!(engine.process_due_jobs().await.unwrap(), 0);
        assert_eq!(launcher.calls.load(Ordering::SeqCst), 0);
        let history = store.history("noon", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RunStatus::Skipped);
        // The slot is consumed; the next tick does not skip again.
        assert_eq!(engine.process_due_jobs().await.unwrap(), 0);
        assert_eq!(store.history("noon", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_trigger_runs_immediately() {
        let (engine, _clock, store, launcher) = engine(vec![noon_job()], ts(2008, 1, 2, 15, 0), false);
        engine.trigger("noon").await.unwrap();
        engine.wait_idle().await;
        assert_eq!(launcher.calls.load(Ordering::SeqCst), 1);
        let last = store.last_run("noon").await.unwrap().unwrap();
        assert_eq!(last.scheduled_for, None);

        assert!(matches!(
            engine.trigger("missing").await,
            Err(ExecutionError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_ends_start_loop() {
        let (engine, _clock, _store, _launcher) = engine(vec![], ts(2008, 1, 2, 15, 0), false);
        let engine = Arc::new(engine);
        let runner = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.start().await.map_err(|e| e.to_string()) })
        };
        // Let the loop subscribe and take its first tick.
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.stop().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), runner).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
