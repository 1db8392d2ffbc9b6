//! Scheduled maintenance entry points

use axum::{
    extract::{Path, State},
    Json,
};
use coachledger_billing::{InvariantCheckSummary, MaintenanceJob, MaintenanceReport};
use time::OffsetDateTime;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub async fn run_job(
    State(state): State<AppState>,
    Path(job): Path<String>,
) -> ApiResult<Json<MaintenanceReport>> {
    let job: MaintenanceJob = job.parse()?;

    tracing::info!(job = job.as_str(), "Maintenance job triggered");
    let report = state
        .billing
        .maintenance
        .run(job, OffsetDateTime::now_utc())
        .await?;

    Ok(Json(report))
}

pub async fn run_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let checker = state
        .billing
        .invariants
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("Invariant checks need a database".to_string()))?;

    Ok(Json(checker.run_all_checks().await?))
}
