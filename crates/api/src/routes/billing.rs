//! Stripe checkout endpoint

use axum::{extract::State, routing::post, Extension, Json, Router};
use revisume_billing::{BillingError, CheckoutProduct, CheckoutResponse};
use serde::Deserialize;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/v1/billing/checkout", post(create_checkout))
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub product: CheckoutProduct,
}

pub async fn create_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let checkout = state
        .billing_service()
        .and_then(|billing| billing.checkout.as_ref())
        .ok_or_else(|| ApiError::ServiceUnavailable("Billing is not configured".into()))?;

    let user = state
        .engine
        .store()
        .find_user(auth_user.user_id)
        .await
        .map_err(BillingError::from)?
        .ok_or_else(|| ApiError::NotFound("User not found".into()))?;

    let session = checkout.create_session(&user, req.product).await?;
    Ok(Json(session))
}
