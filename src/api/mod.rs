//! HTTP/JSON surface of the scheduler.
//!
//! Caller-facing routes manage jobs; worker-facing routes run the lease
//! protocol. Every handler is a thin shim over [`Scheduler`].

pub mod error;
pub mod types;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::scheduler::{JobFilter, JobSpec, Scheduler, TransitionEvent};
use types::{
    AcquireRequest, HealthResponse, JobResponse, ListJobsQuery, ReleaseRequest, ReleaseResponse,
    RenewRequest, RenewResponse, SubmitJobResponse, WorkerResponse,
};

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
}

impl ApiState {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/jobs/{id}", get(job_status_handler).delete(cancel_job_handler))
        .route("/jobs/{id}/history", get(job_history_handler))
        .route("/lease/acquire", post(acquire_handler))
        .route("/lease/renew", post(renew_handler))
        .route("/lease/release", post(release_handler))
        .route("/workers", get(list_workers_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` fires.
pub async fn run_server(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Starting scheduler API");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health_handler(State(state): State<ApiState>) -> Response {
    let scheduler = &state.scheduler;
    let healthy = scheduler.store().health().is_ok();
    let body = HealthResponse {
        status: if healthy { "ok" } else { "unavailable" }.to_string(),
        jobs: scheduler.store().len(),
        active_leases: scheduler.leases().len(),
        workers: scheduler.workers().all().len(),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    Json(spec): Json<JobSpec>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), SchedulerError> {
    let job = state.scheduler.submit(spec)?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitJobResponse {
            id: job.id,
            state: job.state,
        }),
    ))
}

async fn list_jobs_handler(
    State(state): State<ApiState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobResponse>>, SchedulerError> {
    let filter = JobFilter {
        state: query.state,
        project_id: query.project_id,
    };
    let jobs = state.scheduler.list(&filter)?;
    Ok(Json(jobs.into_iter().map(JobResponse::from).collect()))
}

async fn job_status_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobResponse>, SchedulerError> {
    Ok(Json(state.scheduler.status(&id)?.into()))
}

async fn cancel_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobResponse>, SchedulerError> {
    Ok(Json(state.scheduler.cancel(&id)?.into()))
}

async fn job_history_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<TransitionEvent>>, SchedulerError> {
    Ok(Json(state.scheduler.history(&id)?))
}

async fn acquire_handler(
    State(state): State<ApiState>,
    Json(req): Json<AcquireRequest>,
) -> Result<Response, SchedulerError> {
    let grant = state
        .scheduler
        .acquire(
            &req.worker_id,
            &req.capabilities,
            req.wait_ms.map(Duration::from_millis),
        )
        .await?;
    Ok(match grant {
        Some(grant) => Json(grant).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn renew_handler(
    State(state): State<ApiState>,
    Json(req): Json<RenewRequest>,
) -> Result<Json<RenewResponse>, SchedulerError> {
    let lease = state.scheduler.renew(&req.token)?;
    Ok(Json(RenewResponse {
        job_id: lease.job_id,
        expires_at: lease.expires_at,
    }))
}

async fn release_handler(
    State(state): State<ApiState>,
    Json(req): Json<ReleaseRequest>,
) -> Result<Json<ReleaseResponse>, SchedulerError> {
    let job = state
        .scheduler
        .release(&req.token, req.outcome, req.result_ref, req.error)?;
    Ok(Json(ReleaseResponse {
        job_id: job.id,
        state: job.state,
        attempt_count: job.attempt_count,
    }))
}

async fn list_workers_handler(State(state): State<ApiState>) -> Json<Vec<WorkerResponse>> {
    Json(state.scheduler.workers().all())
}
