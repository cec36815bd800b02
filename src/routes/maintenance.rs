use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use serde::{Deserialize, Serialize};

use super::{ApiResult, AppError};
use crate::app_state::AppState;
use crate::models::job::numeric_id;
use crate::services::activation::{self, ActivationReport, Direction};
use crate::services::audit::{self, AuditReport};
use crate::services::dedup::{self, DedupReport};

#[derive(Debug, Deserialize, Validate)]
pub struct AuditRequest {
    #[garde(length(min = 1, max = 50), custom(numeric_id))]
    pub customer_id: String,

    /// Restrict the audit to these variants; all variants when empty
    #[garde(skip)]
    #[serde(default)]
    pub variants: Vec<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CustomerRequest {
    #[garde(length(min = 1, max = 50), custom(numeric_id))]
    pub customer_id: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct DedupRequest {
    #[garde(length(min = 1, max = 50), custom(numeric_id))]
    pub customer_id: String,

    /// Groups to scan; the whole account when empty
    #[garde(inner(custom(numeric_id)))]
    #[serde(default)]
    pub group_ids: Vec<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SwitchRequest {
    #[garde(length(min = 1, max = 50), custom(numeric_id))]
    pub customer_id: String,

    #[garde(length(min = 1, max = 100))]
    pub variant_name: String,

    #[garde(inner(custom(numeric_id)))]
    #[serde(default)]
    pub group_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub customer_id: String,
    pub groups_reset: usize,
}

fn validated<T: Validate<Context = ()>>(request: &T) -> Result<(), AppError> {
    request
        .validate()
        .map_err(|report| AppError::new(StatusCode::BAD_REQUEST, report.to_string()))
}

/// POST /api/v1/audit: verify done labels and queue a repair job for violations.
pub async fn run_audit(
    State(state): State<AppState>,
    Json(request): Json<AuditRequest>,
) -> ApiResult<Json<AuditReport>> {
    validated(&request)?;
    let report = audit::run_audit(
        state.batcher(),
        state.store(),
        state.catalog(),
        state.settings(),
        &request.customer_id,
        &request.variants,
    )
    .await?;
    Ok(Json(report))
}

/// POST /api/v1/audit/reset: clear the audited label from every group.
pub async fn reset_audit(
    State(state): State<AppState>,
    Json(request): Json<CustomerRequest>,
) -> ApiResult<Json<ResetResponse>> {
    validated(&request)?;
    let groups_reset =
        audit::reset_audit_markers(state.batcher(), &request.customer_id, &state.settings().audited_label)
            .await?;
    Ok(Json(ResetResponse {
        customer_id: request.customer_id,
        groups_reset,
    }))
}

/// POST /api/v1/dedup
pub async fn run_dedup(
    State(state): State<AppState>,
    Json(request): Json<DedupRequest>,
) -> ApiResult<Json<DedupReport>> {
    validated(&request)?;
    let report = dedup::run_dedup(
        state.batcher(),
        state.catalog(),
        &request.customer_id,
        &request.group_ids,
        state.settings().query_chunk_size,
    )
    .await?;
    Ok(Json(report))
}

async fn switch(state: &AppState, request: SwitchRequest, direction: Direction) -> ApiResult<Json<ActivationReport>> {
    validated(&request)?;
    let report = activation::switch_variant(
        state.batcher(),
        state.catalog(),
        &request.customer_id,
        &request.variant_name,
        direction,
        &request.group_ids,
        state.settings().query_chunk_size,
    )
    .await?;
    Ok(Json(report))
}

/// POST /api/v1/activate: serve a variant's ads in place of the others.
pub async fn activate(
    State(state): State<AppState>,
    Json(request): Json<SwitchRequest>,
) -> ApiResult<Json<ActivationReport>> {
    switch(&state, request, Direction::Activate).await
}

/// POST /api/v1/deactivate: back to the baseline ads.
pub async fn deactivate(
    State(state): State<AppState>,
    Json(request): Json<SwitchRequest>,
) -> ApiResult<Json<ActivationReport>> {
    switch(&state, request, Direction::Deactivate).await
}
