//! Redirect-side purchase confirmation

use axum::{
    extract::{rejection::JsonRejection, State},
    Extension, Json,
};
use coachledger_billing::ConfirmOutcome;
use serde::Deserialize;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub session_id: String,
}

/// Confirm a checkout session on behalf of the authenticated payer
pub async fn confirm_purchase(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    payload: Result<Json<ConfirmRequest>, JsonRejection>,
) -> ApiResult<Json<ConfirmOutcome>> {
    let Json(request) = payload.map_err(|e| ApiError::Validation(e.body_text()))?;

    let outcome = state
        .billing
        .reconciler
        .confirm(&request.session_id, auth_user.user_id)
        .await?;

    Ok(Json(outcome))
}
