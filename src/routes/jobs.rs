use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use serde::Deserialize;
use std::collections::BTreeSet;
use uuid::Uuid;

use super::{ApiResult, AppError};
use crate::app_state::AppState;
use crate::models::job::{CreateJobRequest, Job, JobStatus, JobSummary};
use crate::services::processor::JobProcessor;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

/// Run a job in the background. Outside dry runs the job must already be
/// marked running so the worker does not pick it up as well.
fn spawn_processing(processor: JobProcessor, job_id: Uuid) {
    tokio::spawn(async move {
        match processor.process_job(job_id).await {
            Ok(report) => tracing::info!(
                job_id = %job_id,
                status = %report.status,
                succeeded = report.counts.succeeded,
                failed = report.counts.failed,
                skipped = report.counts.skipped,
                "Background job run finished"
            ),
            Err(err) => tracing::error!(job_id = %job_id, error = %err, "Background job run failed"),
        }
    });
}

/// POST /api/v1/jobs: submit work items as a new job.
pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    request
        .validate()
        .map_err(|report| AppError::new(StatusCode::BAD_REQUEST, report.to_string()))?;

    let unknown: BTreeSet<&str> = request
        .items
        .iter()
        .map(|item| item.variant_name.as_str())
        .filter(|name| state.catalog().get(name).is_none())
        .collect();
    if !unknown.is_empty() {
        let names: Vec<&str> = unknown.into_iter().collect();
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            format!("unknown variants: {}", names.join(", ")),
        ));
    }

    let mut job = state
        .store()
        .create_job(&request.items, request.batch_size, false)
        .await?;
    tracing::info!(job_id = %job.id, items = job.total_items, batch_size = job.batch_size, "Job created");

    if request.start {
        if !state.settings().dry_run {
            job = state.store().update_job_status(job.id, JobStatus::Running, None).await?;
        }
        spawn_processing(state.processor.clone(), job.id);
    }

    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /api/v1/jobs: most recent jobs first.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<Job>>> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    Ok(Json(state.store().list_jobs(limit).await?))
}

/// GET /api/v1/jobs/{id}: counts, pending total and recent failures.
pub async fn get_job(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> ApiResult<Json<JobSummary>> {
    Ok(Json(state.store().get_job_status(job_id).await?))
}

/// POST /api/v1/jobs/{id}/pause
pub async fn pause_job(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> ApiResult<Json<Job>> {
    Ok(Json(state.processor.pause_job(job_id).await?))
}

/// POST /api/v1/jobs/{id}/resume: continue with the items still pending.
pub async fn resume_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let job = state.store().get_job(job_id).await?;
    if !job.status.is_resumable(state.settings().dry_run) {
        return Err(AppError::new(
            StatusCode::CONFLICT,
            format!("job is {}; only paused or failed jobs can be resumed", job.status),
        ));
    }
    let job = if state.settings().dry_run {
        job
    } else {
        state.store().update_job_status(job_id, JobStatus::Running, None).await?
    };
    tracing::info!(job_id = %job_id, pending = job.pending_items(), "Job resume requested");
    spawn_processing(state.processor.clone(), job_id);
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// DELETE /api/v1/jobs/{id}
pub async fn delete_job(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> ApiResult<StatusCode> {
    let job = state.store().get_job(job_id).await?;
    if job.status == JobStatus::Running {
        return Err(AppError::new(StatusCode::CONFLICT, "pause the job before deleting it"));
    }
    state.store().delete_job(job_id).await?;
    tracing::info!(job_id = %job_id, "Job deleted");
    Ok(StatusCode::NO_CONTENT)
}
