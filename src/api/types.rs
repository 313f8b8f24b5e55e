//! Request and response bodies shared by the HTTP server and client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::{Job, JobKind, JobState, Outcome};
use crate::scheduler::registry::WorkerInfo;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub id: Uuid,
    pub state: JobState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: Uuid,
    pub project_id: String,
    pub kind: JobKind,
    pub state: JobState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub dependencies: Vec<Uuid>,
    pub worker_id: Option<String>,
    pub result_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            project_id: job.project_id,
            kind: job.kind,
            state: job.state,
            attempt_count: job.attempt_count,
            max_attempts: job.max_attempts,
            dependencies: job.dependencies,
            worker_id: job.worker_id,
            result_ref: job.result_ref,
            failure_reason: job.failure_reason,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListJobsQuery {
    pub state: Option<JobState>,
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireRequest {
    pub worker_id: String,
    pub capabilities: Vec<JobKind>,
    /// Long-poll wait; the server default applies when absent
    #[serde(default)]
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewRequest {
    pub token: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewResponse {
    pub job_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub token: Uuid,
    pub outcome: Outcome,
    #[serde(default)]
    pub result_ref: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub job_id: Uuid,
    pub state: JobState,
    pub attempt_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub jobs: usize,
    pub active_leases: usize,
    pub workers: usize,
}

pub type WorkerResponse = WorkerInfo;
