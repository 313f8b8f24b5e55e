use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::scheduler::{Grant, JobKind, Outcome};

/// Result of running one leased job
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub job_id: Uuid,
    pub outcome: Outcome,
    pub result_ref: Option<String>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn succeeded(job_id: Uuid, result_ref: Option<String>) -> Self {
        Self {
            job_id,
            outcome: Outcome::Succeeded,
            result_ref,
            error: None,
        }
    }

    pub fn failed(job_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            job_id,
            outcome: Outcome::Failed,
            result_ref: None,
            error: Some(error.into()),
        }
    }
}

/// Runs the Build or Translation task behind a grant.
///
/// `abort` fires when the lease is lost. Implementations must stop promptly
/// and leave nothing half-published; the result is discarded in that case.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, grant: &Grant, abort: CancellationToken) -> ExecutionResult;
}

/// Runs a shell command per job kind.
///
/// The payload JSON is written to the command's stdin and the job identity
/// is exported as `XEODOCS_*` environment variables. Exit status 0 is
/// success with trimmed stdout as the result reference; anything else is a
/// failure carrying stderr. The child is killed if the lease is lost.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    commands: HashMap<JobKind, String>,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        let mut executor = Self::new();
        for kind in [JobKind::Translation, JobKind::Build] {
            if let Some(cmd) = config.command_for(kind) {
                executor = executor.with_command(kind, cmd);
            }
        }
        executor
    }

    pub fn with_command(mut self, kind: JobKind, command: impl Into<String>) -> Self {
        self.commands.insert(kind, command.into());
        self
    }

    fn process_output(
        job_id: Uuid,
        result: std::io::Result<std::process::Output>,
    ) -> ExecutionResult {
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let exit_code = output.status.code();

                tracing::info!(
                    job_id = %job_id,
                    exit_code = ?exit_code,
                    "Task finished"
                );

                if output.status.success() {
                    ExecutionResult::succeeded(
                        job_id,
                        if stdout.is_empty() { None } else { Some(stdout) },
                    )
                } else if stderr.is_empty() {
                    ExecutionResult::failed(job_id, format!("Exit code: {:?}", exit_code))
                } else {
                    ExecutionResult::failed(job_id, stderr)
                }
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Task execution failed");
                ExecutionResult::failed(job_id, e.to_string())
            }
        }
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, grant: &Grant, abort: CancellationToken) -> ExecutionResult {
        let Some(command) = self.commands.get(&grant.kind) else {
            return ExecutionResult::failed(
                grant.job_id,
                format!("no command configured for {} jobs", grant.kind),
            );
        };
        tracing::info!(
            job_id = %grant.job_id,
            project_id = %grant.project_id,
            kind = %grant.kind,
            command = %command,
            "Executing task"
        );

        let spawned = Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("XEODOCS_JOB_ID", grant.job_id.to_string())
            .env("XEODOCS_PROJECT_ID", &grant.project_id)
            .env("XEODOCS_JOB_KIND", grant.kind.to_string())
            .env("XEODOCS_ATTEMPT", grant.attempt_count.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => return Self::process_output(grant.job_id, Err(e)),
        };

        // Stdin is fed while stdout/stderr drain, all under the abort select.
        let job_id = grant.job_id;
        let stdin = child.stdin.take();
        let payload = serde_json::to_vec(&grant.payload).unwrap_or_default();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A command that ignores stdin may close it early.
                if let Err(e) = stdin.write_all(&payload).await {
                    tracing::debug!(job_id = %job_id, error = %e, "Payload not consumed");
                }
            }
        };
        let run = async move {
            let ((), result) = tokio::join!(feed, child.wait_with_output());
            result
        };

        tokio::select! {
            result = run => Self::process_output(grant.job_id, result),
            _ = abort.cancelled() => {
                // Dropping `run` drops the child, which kills it.
                tracing::warn!(job_id = %grant.job_id, "Lease lost, task killed");
                ExecutionResult::failed(grant.job_id, "abandoned: lease lost")
            }
        }
    }
}
