use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a job does. Workers advertise the kinds they can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Translation,
    Build,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Translation => write!(f, "translation"),
            JobKind::Build => write!(f, "build"),
        }
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "translation" => Ok(JobKind::Translation),
            "build" => Ok(JobKind::Build),
            other => Err(format!("unknown job kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Ready,
    Leased,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Edges of the job state machine. Everything else is rejected.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Pending, Ready)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Ready, Leased)
                | (Ready, Cancelled)
                | (Leased, Succeeded)
                | (Leased, Ready)
                | (Leased, Failed)
                | (Leased, Cancelled)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Ready => write!(f, "ready"),
            JobState::Leased => write!(f, "leased"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "ready" => Ok(JobState::Ready),
            "leased" => Ok(JobState::Leased),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(format!("unknown job state: {}", other)),
        }
    }
}

/// Result a worker reports when releasing a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Succeeded,
    Failed,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Succeeded => write!(f, "succeeded"),
            Outcome::Failed => write!(f, "failed"),
        }
    }
}

/// Caller-supplied description of a job to submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub project_id: String,
    pub kind: JobKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
}

impl JobSpec {
    pub fn new(project_id: impl Into<String>, kind: JobKind) -> Self {
        Self {
            project_id: project_id.into(),
            kind,
            payload: serde_json::Value::Null,
            dependencies: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn depends_on(mut self, job_id: Uuid) -> Self {
        self.dependencies.push(job_id);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub project_id: String,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub dependencies: Vec<Uuid>,
    pub state: JobState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Submission order, assigned by the store
    pub seq: u64,
    pub worker_id: Option<String>,
    pub result_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(spec: JobSpec, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: spec.project_id,
            kind: spec.kind,
            payload: spec.payload,
            dependencies: spec.dependencies,
            state: JobState::Pending,
            attempt_count: 0,
            max_attempts,
            seq: 0,
            worker_id: None,
            result_ref: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the next failed lease cycle uses up the last attempt.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt_count + 1 >= self.max_attempts
    }
}
