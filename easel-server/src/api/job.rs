//! Job API Handlers
//!
//! Submission and status endpoints, both answered through the coordinator.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use easel_core::domain::job::Job;
use easel_core::dto::job::{CreateJob, CreateJobResponse, JobStatusView};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::ApiResult;

/// POST /job
/// Validate settings and queue a new render job
pub async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJob>,
) -> ApiResult<(StatusCode, Json<CreateJobResponse>)> {
    let job = Job::new(req)?;
    let id = job.id;
    tracing::info!(job_id = %id, "Submitting job");

    state
        .coordinator
        .add_job(job, state.request_timeout)
        .await?;

    Ok((StatusCode::CREATED, Json(CreateJobResponse { id })))
}

/// GET /job/{id}
/// Get job state and queue position
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobStatusView>> {
    tracing::debug!("Getting job: {}", id);

    let lookup = state
        .coordinator
        .get_job_status(id, state.request_timeout)
        .await?;

    Ok(Json(JobStatusView::try_from(lookup)?))
}
