use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::JobState;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Conflict on job {job_id}: expected {expected}, found {actual}")]
    Conflict {
        job_id: Uuid,
        expected: JobState,
        actual: JobState,
    },

    #[error("Job {0} is already leased")]
    AlreadyLeased(Uuid),

    #[error("Lease expired for job {0}")]
    LeaseExpired(Uuid),

    #[error("Lease token is not valid")]
    InvalidLease,

    #[error("Job {0} was cancelled")]
    JobCancelled(Uuid),

    #[error("Invalid dependency: {0}")]
    InvalidDependency(String),

    #[error("Worker capabilities do not match: {0}")]
    CapabilityMismatch(String),

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobState,
        to: JobState,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Job store is at capacity")]
    QueueFull,

    #[error("Job store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Errors that a retry with backoff may clear.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SchedulerError::Conflict { .. }
                | SchedulerError::StoreUnavailable(_)
                | SchedulerError::Transport(_)
        )
    }

    /// Errors telling a worker that its lease is gone and the work must be dropped.
    pub fn is_lease_lost(&self) -> bool {
        matches!(
            self,
            SchedulerError::LeaseExpired(_)
                | SchedulerError::InvalidLease
                | SchedulerError::JobCancelled(_)
        )
    }

    /// The job an error is about, when there is one.
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            SchedulerError::JobNotFound(id)
            | SchedulerError::AlreadyLeased(id)
            | SchedulerError::LeaseExpired(id)
            | SchedulerError::JobCancelled(id) => Some(*id),
            SchedulerError::Conflict { job_id, .. }
            | SchedulerError::InvalidTransition { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::JobNotFound(_) => "not_found",
            SchedulerError::Conflict { .. } => "conflict",
            SchedulerError::AlreadyLeased(_) => "already_leased",
            SchedulerError::LeaseExpired(_) => "lease_expired",
            SchedulerError::InvalidLease => "invalid_lease",
            SchedulerError::JobCancelled(_) => "job_cancelled",
            SchedulerError::InvalidDependency(_) => "invalid_dependency",
            SchedulerError::CapabilityMismatch(_) => "capability_mismatch",
            SchedulerError::InvalidTransition { .. } => "invalid_transition",
            SchedulerError::InvalidRequest(_) => "invalid_request",
            SchedulerError::QueueFull => "queue_full",
            SchedulerError::StoreUnavailable(_) => "store_unavailable",
            SchedulerError::Config(_) => "config",
            SchedulerError::Transport(_) => "transport",
            SchedulerError::Internal(_) => "internal",
        }
    }
}

impl From<reqwest::Error> for SchedulerError {
    fn from(e: reqwest::Error) -> Self {
        SchedulerError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
