use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

fn default_enabled() -> bool {
    true
}

fn default_timeout_seconds() -> u64 {
    3600
}

fn default_catch_up() -> u64 {
    300
}

// ============================================================================
// Job Models
// ============================================================================

/// CronJob is one scheduled command definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CronJob {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub schedule: JobSchedule,
    pub command: JobCommand,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub allow_concurrent: bool,
}

impl CronJob {
    /// Title for display, falling back to the id
    pub fn label(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.id)
    }
}

/// JobSchedule defines when a job should execute
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSchedule {
    /// One or more crontab rules; the job is due when any of them is
    Crontab {
        rules: Vec<String>,
        /// Maximum look-back in seconds for a missed run
        #[serde(default = "default_catch_up")]
        catch_up: u64,
    },
    /// A preset interval, skewed per job
    Simple { interval: SimpleInterval },
}

/// Preset intervals for simple schedules
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SimpleInterval {
    #[serde(rename = "every_minute")]
    EveryMinute,
    #[serde(rename = "every_5_minutes")]
    Every5Minutes,
    #[serde(rename = "every_10_minutes")]
    Every10Minutes,
    #[serde(rename = "every_15_minutes")]
    Every15Minutes,
    #[serde(rename = "every_30_minutes")]
    Every30Minutes,
    #[serde(rename = "every_hour")]
    EveryHour,
    #[serde(rename = "every_3_hours")]
    Every3Hours,
    #[serde(rename = "every_6_hours")]
    Every6Hours,
    #[serde(rename = "every_12_hours")]
    Every12Hours,
    #[serde(rename = "every_day")]
    EveryDay,
}

impl SimpleInterval {
    /// The crontab rule this preset expands to
    pub fn rule(self) -> &'static str {
        match self {
            SimpleInterval::EveryMinute => "* * * * *",
            SimpleInterval::Every5Minutes => "*/5+@ * * * *",
            SimpleInterval::Every10Minutes => "*/10+@ * * * *",
            SimpleInterval::Every15Minutes => "*/15+@ * * * *",
            SimpleInterval::Every30Minutes => "*/30+@ * * * *",
            SimpleInterval::EveryHour => "0+@ * * * *",
            SimpleInterval::Every3Hours => "0+@ */3 * * *",
            SimpleInterval::Every6Hours => "0+@ */6 * * *",
            SimpleInterval::Every12Hours => "0+@ */12 * * *",
            SimpleInterval::EveryDay => "0+@ 0 * * *",
        }
    }

    /// Length of the interval in seconds
    pub fn seconds(self) -> u64 {
        match self {
            SimpleInterval::EveryMinute => 60,
            SimpleInterval::Every5Minutes => 5 * 60,
            SimpleInterval::Every10Minutes => 10 * 60,
            SimpleInterval::Every15Minutes => 15 * 60,
            SimpleInterval::Every30Minutes => 30 * 60,
            SimpleInterval::EveryHour => 3600,
            SimpleInterval::Every3Hours => 3 * 3600,
            SimpleInterval::Every6Hours => 6 * 3600,
            SimpleInterval::Every12Hours => 12 * 3600,
            SimpleInterval::EveryDay => 24 * 3600,
        }
    }
}

/// JobCommand is the program a job runs. No shell is involved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct JobCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

// ============================================================================
// Run Models
// ============================================================================

/// RunStatus is the outcome of one job run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    TimedOut,
    /// Due, but not launched because a previous run still held the lock
    Skipped,
}

/// RunRecord is one entry of a job's run history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub job_id: String,
    /// Scheduled minute that made the job due
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RunRecord {
    /// Whether this record counts as a run of the job.
    ///
    /// Skipped entries are kept for history but do not move the last run.
    pub fn counts_as_run(&self) -> bool {
        self.status != RunStatus::Skipped
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}
