// Job launcher
// Runs a job's command as a child process under the job timeout.

use crate::errors::ExecutionError;
use crate::models::CronJob;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// Bytes of stdout or stderr kept for run records
pub const OUTPUT_TAIL_BYTES: usize = 2048;

/// Result of a successful launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub exit_code: Option<i32>,
    /// Last bytes of stdout, lossily decoded
    pub output_tail: String,
}

/// JobLauncher trait defines how a due job is executed
#[async_trait]
pub trait JobLauncher: Send + Sync {
    /// Run the job to completion
    async fn launch(&self, job: &CronJob) -> Result<LaunchOutcome, ExecutionError>;
}

/// Launcher that spawns the job command directly, without a shell
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

fn tail(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(OUTPUT_TAIL_BYTES);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

#[async_trait]
impl JobLauncher for ProcessLauncher {
    #[instrument(skip(self, job), fields(job_id = %job.id, program = %job.command.program))]
    async fn launch(&self, job: &CronJob) -> Result<LaunchOutcome, ExecutionError> {
        if job.command.program.is_empty() {
            return Err(ExecutionError::InvalidJobDefinition(format!(
                "job '{}' has no program",
                job.id
            )));
        }

        let mut command = Command::new(&job.command.program);
        command
            .args(&job.command.args)
            .envs(&job.command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &job.command.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| ExecutionError::LaunchFailed {
            program: job.command.program.clone(),
            reason: e.to_string(),
        })?;
        debug!(pid = child.id(), "Process spawned");

        let timeout = Duration::from_secs(job.timeout_seconds);
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| ExecutionError::LaunchFailed {
                program: job.command.program.clone(),
                reason: e.to_string(),
            })?,
            Err(_) => {
                // The child is killed when its handle is dropped.
                warn!(timeout_seconds = job.timeout_seconds, "Job timed out");
                return Err(ExecutionError::Timeout(job.timeout_seconds));
            }
        };

        if output.status.success() {
            Ok(LaunchOutcome {
                exit_code: output.status.code(),
                output_tail: tail(&output.stdout),
            })
        } else {
            Err(ExecutionError::NonZeroExit {
                code: output.status.code(),
                stderr: tail(&output.stderr),
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::{JobCommand, JobSchedule, SimpleInterval};

    fn job(program: &str, args: &[&str], timeout_seconds: u64) -> CronJob {
        CronJob {
            id: "launcher-test".to_string(),
            title: None,
            enabled: true,
            schedule: JobSchedule::Simple {
                interval: SimpleInterval::EveryMinute,
            },
            command: JobCommand {
                program: program.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            timeout_seconds,
            allow_concurrent: false,
        }
    }

    #[tokio::test]
    async fn test_successful_launch_captures_output() {
        let outcome = ProcessLauncher::new()
            .launch(&job("sh", &["-c", "echo hello"], 10))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.output_tail, "hello");
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let err = ProcessLauncher::new()
            .launch(&job("sh", &["-c", "echo boom >&2; exit 3"], 10))
            .await
            .unwrap_err();
        match err {
            ExecutionError::NonZeroExit { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = ProcessLauncher::new()
            .launch(&job("sleep", &["5"], 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout(1)));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = ProcessLauncher::new()
            .launch(&job("/nonexistent/definitely-not-here", &[], 10))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::LaunchFailed { .. }));

        let err = ProcessLauncher::new().launch(&job("", &[], 10)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidJobDefinition(_)));
    }

    #[test]
    fn test_tail_keeps_end() {
        let long = vec![b'x'; OUTPUT_TAIL_BYTES + 10];
        assert_eq!(tail(&long).len(), OUTPUT_TAIL_BYTES);
        assert_eq!(tail(b"  ok \n"), "ok");
    }
}
