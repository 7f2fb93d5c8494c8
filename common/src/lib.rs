// Common library for the crontab rule scheduler: rule parsing and matching,
// job definitions, run state and the scheduler engine

pub mod clock;
pub mod config;
pub mod errors;
pub mod launcher;
pub mod lock;
pub mod matcher;
pub mod models;
pub mod rule;
pub mod schedule;
pub mod scheduler;
pub mod storage;
pub mod telemetry;

pub use errors::RuleSyntaxError;
pub use matcher::{should_run, should_run_in};
pub use rule::{CronRule, Intervals};
