//! Credit balance and usage endpoints

use axum::{
    extract::{Path, State},
    routing::get,
    Extension, Json, Router,
};
use revisume_billing::{CreditSummary, FeatureUsageSummary};
use revisume_shared::CreditType;
use serde::Serialize;
use time::{Date, OffsetDateTime, Time};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/credits", get(get_summary))
        .route("/api/v1/credits/{credit_type}", get(get_balance))
        .route("/api/v1/usage", get(get_usage))
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub credit_type: CreditType,
    pub amount: i32,
}

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    #[serde(with = "time::serde::rfc3339")]
    pub since: OffsetDateTime,
    pub features: Vec<FeatureUsageSummary>,
}

pub async fn get_summary(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<CreditSummary>> {
    state
        .engine
        .credits
        .credit_summary(user.user_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("User not found".into()))
}

pub async fn get_balance(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(credit_type): Path<String>,
) -> ApiResult<Json<BalanceResponse>> {
    let credit_type = CreditType::from(credit_type);
    let amount = state
        .engine
        .credits
        .get_user_credits(user.user_id, &credit_type)
        .await;
    Ok(Json(BalanceResponse {
        credit_type,
        amount,
    }))
}

/// Usage for the current calendar month (UTC).
pub async fn get_usage(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<UsageResponse>> {
    let now = state.engine.clock().now_utc();
    let since = Date::from_calendar_date(now.year(), now.month(), 1)
        .map(|date| date.with_time(Time::MIDNIGHT).assume_utc())
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let features = state.engine.usage.summarize(user.user_id, Some(since)).await?;
    Ok(Json(UsageResponse { since, features }))
}
