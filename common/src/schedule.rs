// Schedule evaluation for job definitions
//
// Binds the rule parser and matcher to `JobSchedule`: rule expansion for
// simple presets, per-job skew, due checks and behind-schedule detection.

use crate::errors::ScheduleError;
use crate::matcher::{due_at_in, next_schedule};
use crate::models::{CronJob, JobSchedule};
use crate::rule::CronRule;
use chrono_tz::Tz;
use sha2::{Digest, Sha256};
use std::str::FromStr;

/// ScheduleTrigger trait defines the interface for deciding when a job runs
pub trait ScheduleTrigger {
    /// Rule strings the schedule is made of
    fn rules(&self) -> Vec<String>;

    /// Maximum look-back window in seconds
    fn catch_up(&self) -> u64;

    /// Most recent scheduled minute that makes the job due at `now`, if any
    fn due_at(
        &self,
        timezone: &Tz,
        skew: u32,
        last_run: Option<i64>,
        now: i64,
    ) -> Result<Option<i64>, ScheduleError>;

    /// Earliest scheduled minute strictly after `after` across all rules
    fn next_execution_time(
        &self,
        timezone: &Tz,
        skew: u32,
        after: i64,
    ) -> Result<Option<i64>, ScheduleError>;
}

impl ScheduleTrigger for JobSchedule {
    fn rules(&self) -> Vec<String> {
        match self {
            JobSchedule::Crontab { rules, .. } => rules.clone(),
            JobSchedule::Simple { interval } => vec![interval.rule().to_string()],
        }
    }

    fn catch_up(&self) -> u64 {
        match self {
            JobSchedule::Crontab { catch_up, .. } => *catch_up,
            JobSchedule::Simple { interval } => interval.seconds(),
        }
    }

    fn due_at(
        &self,
        timezone: &Tz,
        skew: u32,
        last_run: Option<i64>,
        now: i64,
    ) -> Result<Option<i64>, ScheduleError> {
        let rules = self.rules();
        if rules.is_empty() {
            return Err(ScheduleError::InvalidConfiguration(
                "schedule has no rules".to_string(),
            ));
        }
        Ok(due_at_in(
            timezone,
            &rules,
            last_run,
            now,
            self.catch_up(),
            skew,
        )?)
    }

    fn next_execution_time(
        &self,
        timezone: &Tz,
        skew: u32,
        after: i64,
    ) -> Result<Option<i64>, ScheduleError> {
        let mut earliest: Option<i64> = None;
        for rule in self.rules() {
            let parsed = CronRule::parse_with_skew(&rule, skew)?;
            if let Some(next) = next_schedule(&parsed, timezone, after) {
                earliest = Some(earliest.map_or(next, |e| e.min(next)));
            }
        }
        Ok(earliest)
    }
}

/// Per-job skew used to resolve `@` offsets.
///
/// Derived from the last byte of the SHA-256 of the job id, so it is stable
/// across restarts and spreads jobs sharing a preset over the hour.
pub fn job_skew(job_id: &str) -> u32 {
    let digest = Sha256::digest(job_id.as_bytes());
    u32::from(digest[digest.len() - 1])
}

/// How many seconds a job is behind its schedule, if more than its catch-up.
///
/// Disabled jobs and jobs that never ran are never behind.
pub fn behind_by(
    job: &CronJob,
    timezone: &Tz,
    last_run: Option<i64>,
    now: i64,
) -> Result<Option<i64>, ScheduleError> {
    if !job.enabled {
        return Ok(None);
    }
    let Some(last) = last_run.filter(|l| *l != 0) else {
        return Ok(None);
    };

    let skew = job_skew(&job.id);
    let Some(next) = job.schedule.next_execution_time(timezone, skew, last)? else {
        return Ok(None);
    };

    let behind = now - next;
    let catch_up = i64::try_from(job.schedule.catch_up()).unwrap_or(i64::MAX);
    Ok((behind > catch_up).then_some(behind))
}

/// Parse an IANA timezone name
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    Tz::from_str(name).map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}

/// Get the default timezone for rule evaluation
pub fn default_timezone() -> Tz {
    Tz::UTC
}
