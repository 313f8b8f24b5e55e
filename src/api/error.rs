use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use crate::api::types::ErrorResponse;
use crate::error::SchedulerError;

impl SchedulerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SchedulerError::JobNotFound(_) => StatusCode::NOT_FOUND,
            SchedulerError::Conflict { .. }
            | SchedulerError::AlreadyLeased(_)
            | SchedulerError::InvalidTransition { .. } => StatusCode::CONFLICT,
            SchedulerError::LeaseExpired(_)
            | SchedulerError::InvalidLease
            | SchedulerError::JobCancelled(_) => StatusCode::GONE,
            SchedulerError::InvalidDependency(_) | SchedulerError::CapabilityMismatch(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            SchedulerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SchedulerError::QueueFull | SchedulerError::StoreUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            SchedulerError::Transport(_) => StatusCode::BAD_GATEWAY,
            SchedulerError::Config(_) | SchedulerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for SchedulerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
            job_id: self.job_id(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<ErrorResponse> for SchedulerError {
    /// Rebuild the error a remote scheduler reported. States are not carried
    /// over the wire, so conflict details collapse into `InvalidRequest`.
    fn from(body: ErrorResponse) -> Self {
        let job_id = body.job_id.unwrap_or_else(Uuid::nil);
        match body.code.as_str() {
            "not_found" => SchedulerError::JobNotFound(job_id),
            "already_leased" => SchedulerError::AlreadyLeased(job_id),
            "lease_expired" => SchedulerError::LeaseExpired(job_id),
            "invalid_lease" => SchedulerError::InvalidLease,
            "job_cancelled" => SchedulerError::JobCancelled(job_id),
            "invalid_dependency" => SchedulerError::InvalidDependency(body.message),
            "capability_mismatch" => SchedulerError::CapabilityMismatch(body.message),
            "queue_full" => SchedulerError::QueueFull,
            "store_unavailable" => SchedulerError::StoreUnavailable(body.message),
            "conflict" | "invalid_transition" | "invalid_request" => {
                SchedulerError::InvalidRequest(body.message)
            }
            _ => SchedulerError::Internal(body.message),
        }
    }
}
