//! Stripe webhook endpoint
//!
//! Status codes drive Stripe's redelivery: 400 for payloads that can never
//! succeed, 5xx for transient failures, 2xx once the event is durably
//! handled or deliberately ignored.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::json;

use crate::state::AppState;

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

pub fn routes() -> Router<AppState> {
    Router::new().route("/stripe_webhook", post(stripe_webhook))
}

fn reply(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": message,
            "code": status.as_u16()
        })),
    )
        .into_response()
}

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(billing) = state.billing_service() else {
        tracing::warn!("Stripe webhook received but billing is not configured");
        return reply(StatusCode::SERVICE_UNAVAILABLE, "Billing is not configured");
    };

    let Some(signature) = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
    else {
        tracing::warn!("Stripe webhook missing signature header");
        return reply(StatusCode::BAD_REQUEST, "Missing Stripe-Signature header");
    };

    let Ok(payload) = std::str::from_utf8(&body) else {
        return reply(StatusCode::BAD_REQUEST, "Payload is not valid UTF-8");
    };

    let event = match billing.webhooks.verify_event(payload, signature) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected Stripe webhook");
            let status = if e.is_client_error() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            };
            return reply(status, &e.to_string());
        }
    };

    match billing.webhooks.handle_event(event).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({ "received": true, "outcome": outcome })),
        )
            .into_response(),
        // Any processing failure was rolled back; ask Stripe to retry
        Err(e) => {
            tracing::error!(error = %e, retryable = e.is_retryable(), "Stripe webhook processing failed");
            reply(StatusCode::INTERNAL_SERVER_ERROR, "Webhook processing failed")
        }
    }
}
