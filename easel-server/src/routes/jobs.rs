//! Job endpoints shared by both API versions.

use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::info;

use easel_core::{AppType, Job, JobFilter, JobStatus, SortOrder};

use crate::error::ApiError;
use crate::schemas::{
    CancelResponse, DeleteResponse, JobStatusView, JobView, JobsListResponse, JobsQuery,
};
use crate::state::AppState;

/// Routes common to v1 and v2.  Deletion is a v1-only administrative
/// operation; v1 adds it on top.
pub fn router(include_delete: bool) -> Router<AppState> {
    let by_id = if include_delete {
        get(get_job).delete(delete_job)
    } else {
        get(get_job)
    };
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", by_id)
        .route("/jobs/{id}/status", get(job_status))
        .route("/jobs/{id}/cancel", post(cancel_job))
}

#[utoipa::path(
    get,
    path = "/api/v1/jobs",
    tag = "jobs",
    params(JobsQuery),
    responses(
        (status = 200, description = "Jobs listed", body = JobsListResponse),
        (status = 400, description = "Invalid filter"),
    )
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(q): Query<JobsQuery>,
) -> Result<Json<JobsListResponse>, ApiError> {
    let filter = parse_filter(&q)?;
    let (total, jobs) = state.queue.list(&filter).await?;
    Ok(Json(JobsListResponse {
        total,
        jobs: jobs.into_iter().map(JobView::from).collect(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/jobs/{id}",
    tag = "jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job retrieved", body = JobView),
        (status = 404, description = "Job not found"),
    )
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let job = fetch_job(&state, &id).await?;
    Ok(Json(job.into()))
}

#[utoipa::path(
    get,
    path = "/api/v1/jobs/{id}/status",
    tag = "jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job with scheduling context", body = JobStatusView),
        (status = 404, description = "Job not found"),
    )
)]
pub async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatusView>, ApiError> {
    let job = fetch_job(&state, &id).await?;
    let queue_position = state.queue.pending_position(&id).await?;
    let estimated_time_remaining = estimate_remaining(&job);
    Ok(Json(JobStatusView {
        job: job.into(),
        queue_position,
        estimated_time_remaining,
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/jobs/{id}/cancel",
    tag = "jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job cancelled", body = CancelResponse),
        (status = 400, description = "Job already terminal"),
        (status = 404, description = "Job not found"),
    )
)]
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let job = state.queue.cancel(&id).await?;
    // An owning monitor (if any) observes this at its next tick.
    state.cancels.cancel(&id);
    info!(job_id = %id, "job cancelled via api");
    Ok(Json(CancelResponse {
        success: true,
        job: job.into(),
    }))
}

#[utoipa::path(
    delete,
    path = "/api/v1/jobs/{id}",
    tag = "jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job deleted", body = DeleteResponse),
        (status = 400, description = "Job is not terminal"),
        (status = 404, description = "Job not found"),
    )
)]
pub async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    state.queue.delete(&id).await?;
    info!(job_id = %id, "job deleted");
    Ok(Json(DeleteResponse {
        success: true,
        job_id: id,
    }))
}

async fn fetch_job(state: &AppState, id: &str) -> Result<Job, ApiError> {
    state
        .queue
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {id} not found")))
}

fn parse_filter(q: &JobsQuery) -> Result<JobFilter, ApiError> {
    let status = q
        .status
        .as_deref()
        .map(JobStatus::from_str)
        .transpose()?;
    let app_type = q
        .app_type
        .as_deref()
        .map(AppType::from_str)
        .transpose()?;
    let order = match q.order.as_deref() {
        None | Some("desc") => SortOrder::Desc,
        Some("asc") => SortOrder::Asc,
        Some(other) => {
            return Err(ApiError::bad_request(format!(
                "order must be 'asc' or 'desc', got '{other}'"
            )))
        }
    };
    Ok(JobFilter {
        status,
        app_type,
        limit: Some(q.limit.unwrap_or(50).clamp(1, 500)),
        offset: q.offset.unwrap_or(0).max(0),
        order,
    })
}

/// Steps-based remaining-time estimate; only meaningful while processing.
fn estimate_remaining(job: &Job) -> Option<u64> {
    if job.status != JobStatus::Processing {
        return None;
    }
    let steps = job
        .generation_params
        .get("steps")
        .and_then(|v| v.as_u64())
        .unwrap_or(20);
    let total_secs = (steps * 2) as f64;
    let done = job.result.progress_percent.unwrap_or(0.0).clamp(0.0, 100.0) / 100.0;
    Some((total_secs * (1.0 - done)).ceil() as u64)
}
