use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::api::types::{
    AcquireRequest, ErrorResponse, JobResponse, ReleaseRequest, ReleaseResponse, RenewRequest,
    RenewResponse, SubmitJobResponse,
};
use crate::error::{Result, SchedulerError};
use crate::scheduler::{
    Grant, JobFilter, JobKind, JobSpec, JobState, Outcome, Scheduler, TransitionEvent,
};

/// The worker-facing half of the scheduler, as seen from a worker agent.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Long-poll for a lease. `Ok(None)` means no job turned up in time.
    async fn acquire(
        &self,
        worker_id: &str,
        capabilities: &[JobKind],
        wait: Duration,
    ) -> Result<Option<Grant>>;

    /// Heartbeat. Returns the new expiry.
    async fn renew(&self, token: Uuid) -> Result<DateTime<Utc>>;

    /// Report the outcome. Returns the job's state afterwards.
    async fn release(
        &self,
        token: Uuid,
        outcome: Outcome,
        result_ref: Option<String>,
        error: Option<String>,
    ) -> Result<JobState>;
}

/// Talks to a scheduler in the same process.
#[derive(Clone)]
pub struct LocalSchedulerClient {
    scheduler: Arc<Scheduler>,
}

impl LocalSchedulerClient {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl SchedulerClient for LocalSchedulerClient {
    async fn acquire(
        &self,
        worker_id: &str,
        capabilities: &[JobKind],
        wait: Duration,
    ) -> Result<Option<Grant>> {
        self.scheduler
            .acquire(worker_id, capabilities, Some(wait))
            .await
    }

    async fn renew(&self, token: Uuid) -> Result<DateTime<Utc>> {
        Ok(self.scheduler.renew(&token)?.expires_at)
    }

    async fn release(
        &self,
        token: Uuid,
        outcome: Outcome,
        result_ref: Option<String>,
        error: Option<String>,
    ) -> Result<JobState> {
        Ok(self
            .scheduler
            .release(&token, outcome, result_ref, error)?
            .state)
    }
}

/// Talks to a remote scheduler over its HTTP API. Workers use it through
/// [`SchedulerClient`]; the job routes serve the command-line client.
#[derive(Debug, Clone)]
pub struct HttpSchedulerClient {
    base_url: String,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl HttpSchedulerClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            request_timeout: Duration::from_secs(10),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn error_from(response: reqwest::Response) -> SchedulerError {
        let status = response.status();
        match response.json::<ErrorResponse>().await {
            Ok(body) => body.into(),
            Err(_) if status.is_server_error() => {
                SchedulerError::Transport(format!("scheduler answered {}", status))
            }
            Err(_) => SchedulerError::Internal(format!("unexpected status {}", status)),
        }
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        Ok(response.json::<T>().await?)
    }

    // ------------------------------------------------------------------
    // Job routes
    // ------------------------------------------------------------------

    pub async fn submit(&self, spec: &JobSpec) -> Result<SubmitJobResponse> {
        let response = self
            .http
            .post(self.url("/jobs"))
            .timeout(self.request_timeout)
            .json(spec)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn status(&self, job_id: Uuid) -> Result<JobResponse> {
        let response = self
            .http
            .get(self.url(&format!("/jobs/{}", job_id)))
            .timeout(self.request_timeout)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn cancel(&self, job_id: Uuid) -> Result<JobResponse> {
        let response = self
            .http
            .delete(self.url(&format!("/jobs/{}", job_id)))
            .timeout(self.request_timeout)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<JobResponse>> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(state) = filter.state {
            query.push(("state", state.to_string()));
        }
        if let Some(project_id) = &filter.project_id {
            query.push(("project_id", project_id.clone()));
        }
        let response = self
            .http
            .get(self.url("/jobs"))
            .timeout(self.request_timeout)
            .query(&query)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn history(&self, job_id: Uuid) -> Result<Vec<TransitionEvent>> {
        let response = self
            .http
            .get(self.url(&format!("/jobs/{}/history", job_id)))
            .timeout(self.request_timeout)
            .send()
            .await?;
        Self::decode(response).await
    }
}

#[async_trait]
impl SchedulerClient for HttpSchedulerClient {
    async fn acquire(
        &self,
        worker_id: &str,
        capabilities: &[JobKind],
        wait: Duration,
    ) -> Result<Option<Grant>> {
        let request = AcquireRequest {
            worker_id: worker_id.to_string(),
            capabilities: capabilities.to_vec(),
            wait_ms: Some(wait.as_millis() as u64),
        };
        let response = self
            .http
            .post(self.url("/lease/acquire"))
            .timeout(wait + self.request_timeout)
            .json(&request)
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            s if s.is_success() => Ok(Some(response.json::<Grant>().await?)),
            _ => Err(Self::error_from(response).await),
        }
    }

    async fn renew(&self, token: Uuid) -> Result<DateTime<Utc>> {
        let response = self
            .http
            .post(self.url("/lease/renew"))
            .timeout(self.request_timeout)
            .json(&RenewRequest { token })
            .send()
            .await?;
        Ok(Self::decode::<RenewResponse>(response).await?.expires_at)
    }

    async fn release(
        &self,
        token: Uuid,
        outcome: Outcome,
        result_ref: Option<String>,
        error: Option<String>,
    ) -> Result<JobState> {
        let request = ReleaseRequest {
            token,
            outcome,
            result_ref,
            error,
        };
        let response = self
            .http
            .post(self.url("/lease/release"))
            .timeout(self.request_timeout)
            .json(&request)
            .send()
            .await?;
        Ok(Self::decode::<ReleaseResponse>(response).await?.state)
    }
}
