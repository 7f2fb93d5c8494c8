// Error handling framework

use std::fmt;
use thiserror::Error;

/// One of the five positional fields of a crontab rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Minute,
    Hour,
    Day,
    Month,
    Weekday,
}

impl Field {
    /// All fields in rule order
    pub const ALL: [Field; 5] = [
        Field::Minute,
        Field::Hour,
        Field::Day,
        Field::Month,
        Field::Weekday,
    ];

    /// Inclusive bounds of the field domain
    pub fn bounds(self) -> (u32, u32) {
        match self {
            Field::Minute => (0, 59),
            Field::Hour => (0, 23),
            Field::Day => (1, 31),
            Field::Month => (1, 12),
            Field::Weekday => (0, 6),
        }
    }

    /// Number of values in the field domain
    pub fn size(self) -> u32 {
        let (min, max) = self.bounds();
        max - min + 1
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Minute => "minute",
            Field::Hour => "hour",
            Field::Day => "day",
            Field::Month => "month",
            Field::Weekday => "weekday",
        };
        f.write_str(name)
    }
}

/// Malformed crontab rule. This is a configuration error and is never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleSyntaxError {
    #[error("Invalid cron rule '{rule}': expected 5 fields, found {found}")]
    FieldCount { rule: String, found: usize },

    #[error("Invalid {field} field '{value}': {reason}")]
    InvalidField {
        field: Field,
        value: String,
        reason: String,
    },
}

impl RuleSyntaxError {
    pub(crate) fn invalid(field: Field, value: &str, reason: impl Into<String>) -> Self {
        RuleSyntaxError::InvalidField {
            field,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Schedule-related errors
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error(transparent)]
    RuleSyntax(#[from] RuleSyntaxError),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid schedule configuration: {0}")]
    InvalidConfiguration(String),
}

/// Job execution errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Failed to launch '{program}': {reason}")]
    LaunchFailed { program: String, reason: String },

    #[error("Process exited with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("Execution timeout after {0} seconds")]
    Timeout(u64),

    #[error("Invalid job definition: {0}")]
    InvalidJobDefinition(String),
}

/// Validation errors
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Duplicate job id: {0}")]
    DuplicateJob(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Run-state storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Filesystem error: {0}")]
    FileSystemError(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
}

/// Job lock errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Lock already held for resource: {0}")]
    AlreadyHeld(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::FileSystemError(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::InvalidJson(err.to_string())
    }
}

impl From<RuleSyntaxError> for ValidationError {
    fn from(err: RuleSyntaxError) -> Self {
        ValidationError::Schedule(ScheduleError::RuleSyntax(err))
    }
}
