// Configuration management with layered configuration (file, env)

use crate::errors::{ScheduleError, ValidationError};
use crate::models::{CronJob, JobSchedule};
use crate::rule::CronRule;
use crate::schedule::{parse_timezone, ScheduleTrigger};
use crate::storage::DEFAULT_HISTORY_LIMIT;
use chrono_tz::Tz;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub jobs: Vec<CronJob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_seconds: u64,
    pub lock_ttl_seconds: u64,
    /// IANA timezone rules are evaluated in
    pub timezone: String,
    /// Upper bound accepted for any job's catch-up window
    pub max_catch_up_seconds: u64,
    pub state_path: PathBuf,
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 60,
            lock_ttl_seconds: 3600,
            timezone: "UTC".to_string(),
            max_catch_up_seconds: 366 * 24 * 3600,
            state_path: PathBuf::from("data/run-state.json"),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl SchedulerConfig {
    pub fn timezone(&self) -> Result<Tz, ScheduleError> {
        parse_timezone(&self.timezone)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: None,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // Add environment-specific configuration
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings.
    ///
    /// Malformed rules are reported here, before the scheduler starts.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let scheduler = &self.scheduler;
        if scheduler.poll_interval_seconds == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "scheduler.poll_interval_seconds".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        if scheduler.lock_ttl_seconds == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "scheduler.lock_ttl_seconds".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        if scheduler.history_limit == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "scheduler.history_limit".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        scheduler.timezone()?;

        let mut seen = HashSet::new();
        for job in &self.jobs {
            if job.id.trim().is_empty() {
                return Err(ValidationError::MissingField("jobs[].id".to_string()));
            }
            if !seen.insert(job.id.as_str()) {
                return Err(ValidationError::DuplicateJob(job.id.clone()));
            }
            self.validate_job(job)?;
        }

        Ok(())
    }

    fn validate_job(&self, job: &CronJob) -> Result<(), ValidationError> {
        if job.command.program.trim().is_empty() {
            return Err(ValidationError::MissingField(format!(
                "jobs.{}.command.program",
                job.id
            )));
        }
        if job.timeout_seconds == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: format!("jobs.{}.timeout_seconds", job.id),
                reason: "must be greater than 0".to_string(),
            });
        }

        if let JobSchedule::Crontab { rules, catch_up } = &job.schedule {
            if rules.is_empty() {
                return Err(ValidationError::MissingField(format!(
                    "jobs.{}.schedule.rules",
                    job.id
                )));
            }
            if *catch_up > self.scheduler.max_catch_up_seconds {
                return Err(ValidationError::InvalidFieldValue {
                    field: format!("jobs.{}.schedule.catch_up", job.id),
                    reason: format!(
                        "{} exceeds the maximum of {} seconds",
                        catch_up, self.scheduler.max_catch_up_seconds
                    ),
                });
            }
        }

        for rule in job.schedule.rules() {
            CronRule::parse(&rule)?;
        }

        if job.schedule.catch_up() < self.scheduler.poll_interval_seconds {
            warn!(
                job_id = %job.id,
                catch_up = job.schedule.catch_up(),
                poll_interval_seconds = self.scheduler.poll_interval_seconds,
                "Catch-up window is shorter than the poll interval, runs may be missed"
            );
        }

        Ok(())
    }
}
