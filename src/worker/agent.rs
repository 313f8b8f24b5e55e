use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{RetryPolicy, WorkerConfig};
use crate::error::Result;
use crate::retry::{jittered, retry_transient};
use crate::scheduler::{Grant, JobKind, JobState, Outcome};
use crate::worker::client::SchedulerClient;
use crate::worker::executor::TaskExecutor;
use crate::worker::heartbeat::HeartbeatSender;

/// What happened to one leased job on this worker.
#[derive(Debug, Clone, PartialEq)]
pub enum JobReport {
    /// Outcome reported; the job is now in `state`.
    Released {
        job_id: Uuid,
        outcome: Outcome,
        state: JobState,
    },
    /// The lease was lost mid-run and the result was thrown away.
    Abandoned { job_id: Uuid },
    /// The outcome could not be delivered. The scheduler keeps the lease,
    /// so the reaper requeues the job once it expires.
    ReleaseFailed { job_id: Uuid, error: String },
}

impl JobReport {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobReport::Released { job_id, .. }
            | JobReport::Abandoned { job_id }
            | JobReport::ReleaseFailed { job_id, .. } => *job_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentStats {
    pub acquired: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub release_errors: u64,
}

impl AgentStats {
    fn record(&mut self, report: &JobReport) {
        self.acquired += 1;
        match report {
            JobReport::Released {
                outcome: Outcome::Succeeded,
                ..
            } => self.succeeded += 1,
            JobReport::Released { .. } => self.failed += 1,
            JobReport::Abandoned { .. } => self.abandoned += 1,
            JobReport::ReleaseFailed { .. } => self.release_errors += 1,
        }
    }
}

/// Pulls leases from the scheduler and runs them one at a time.
///
/// While a job runs a [`HeartbeatSender`] keeps its lease alive. If the
/// lease is lost the executor is told to abort and the result is dropped
/// without calling release, so a stale worker never overwrites the job.
pub struct WorkerAgent {
    id: String,
    client: Arc<dyn SchedulerClient>,
    executor: Arc<dyn TaskExecutor>,
    capabilities: Vec<JobKind>,
    wait: Duration,
    retry: RetryPolicy,
}

impl WorkerAgent {
    pub fn new(
        client: Arc<dyn SchedulerClient>,
        executor: Arc<dyn TaskExecutor>,
        capabilities: Vec<JobKind>,
    ) -> Self {
        Self {
            id: format!("worker-{}", Uuid::new_v4()),
            client,
            executor,
            capabilities,
            wait: Duration::from_secs(20),
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(
        config: &WorkerConfig,
        client: Arc<dyn SchedulerClient>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        Self::new(client, executor, config.capabilities.clone())
            .with_wait(Duration::from_millis(config.wait_ms))
            .with_retry(config.retry.clone())
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Poll and execute until `shutdown` fires. A job already running when
    /// shutdown arrives is finished and released before returning.
    pub async fn run(&self, shutdown: CancellationToken) -> AgentStats {
        let mut stats = AgentStats::default();
        let mut errors = 0;
        tracing::info!(
            worker_id = %self.id,
            capabilities = ?self.capabilities,
            "Worker agent started"
        );

        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.client.acquire(&self.id, &self.capabilities, self.wait) => polled,
            };

            match polled {
                Ok(Some(grant)) => {
                    errors = 0;
                    let report = self.run_job(grant).await;
                    stats.record(&report);
                }
                Ok(None) => {
                    errors = 0;
                }
                Err(e) => {
                    let delay = jittered(self.retry.backoff(errors));
                    errors = errors.saturating_add(1);
                    tracing::warn!(
                        worker_id = %self.id,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Acquire failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        tracing::info!(worker_id = %self.id, stats = ?stats, "Worker agent stopped");
        stats
    }

    /// Take at most one job, waiting up to the configured poll time.
    pub async fn run_once(&self) -> Result<Option<JobReport>> {
        match self
            .client
            .acquire(&self.id, &self.capabilities, self.wait)
            .await?
        {
            Some(grant) => Ok(Some(self.run_job(grant).await)),
            None => Ok(None),
        }
    }

    pub async fn run_job(&self, grant: Grant) -> JobReport {
        let job_id = grant.job_id;
        tracing::info!(
            worker_id = %self.id,
            job_id = %job_id,
            kind = %grant.kind,
            attempt = grant.attempt_count + 1,
            "Job leased"
        );

        let done = CancellationToken::new();
        let lease_lost = CancellationToken::new();
        let heartbeat = HeartbeatSender::new(self.client.clone(), grant.token, grant.lease_ttl_ms);
        let heartbeat_task = {
            let done = done.clone();
            let lease_lost = lease_lost.clone();
            tokio::spawn(async move { heartbeat.run(done, lease_lost).await })
        };

        let result = self.executor.execute(&grant, lease_lost.clone()).await;
        done.cancel();
        if let Err(e) = heartbeat_task.await {
            tracing::error!(job_id = %job_id, error = %e, "Heartbeat task panicked");
        }

        if lease_lost.is_cancelled() {
            tracing::warn!(worker_id = %self.id, job_id = %job_id, "Result discarded, lease lost");
            return JobReport::Abandoned { job_id };
        }

        let released = retry_transient(&self.retry, "release", || {
            self.client.release(
                grant.token,
                result.outcome,
                result.result_ref.clone(),
                result.error.clone(),
            )
        })
        .await;

        match released {
            Ok(state) => {
                tracing::info!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    outcome = ?result.outcome,
                    state = %state,
                    "Job released"
                );
                JobReport::Released {
                    job_id,
                    outcome: result.outcome,
                    state,
                }
            }
            Err(e) if e.is_lease_lost() => {
                tracing::warn!(worker_id = %self.id, job_id = %job_id, error = %e, "Release rejected");
                JobReport::Abandoned { job_id }
            }
            Err(e) => {
                tracing::error!(worker_id = %self.id, job_id = %job_id, error = %e, "Release failed");
                JobReport::ReleaseFailed {
                    job_id,
                    error: e.to_string(),
                }
            }
        }
    }
}
