//! Metered feature endpoints
//!
//! Each endpoint is gated by a tier requirement and spends one credit of
//! its credit type before the feature runs. The feature work itself is
//! performed by downstream services; these handlers only decide whether it
//! may proceed.

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::post,
    Extension, Json, Router,
};
use revisume_billing::ConsumeOutcome;
use revisume_shared::{CreditType, SubscriptionTier};
use serde::Serialize;

use crate::{
    auth::AuthUser,
    entitlement::{deny, require_tier, ResponseFormat, TierRequirement},
    state::AppState,
};

const PAID_TIERS: &[SubscriptionTier] = &[SubscriptionTier::Starter, SubscriptionTier::Pro];
// Requirements are upward-closed, so free admits every tier
const ANY_TIER: &[SubscriptionTier] = &[SubscriptionTier::Free];

#[derive(Debug)]
pub struct MeteredFeature {
    pub name: &'static str,
    pub path: &'static str,
    pub credit_type: CreditType,
    pub requirement: TierRequirement,
}

pub static METERED_FEATURES: [MeteredFeature; 5] = [
    MeteredFeature {
        name: "resume_recommendations",
        path: "/api/v1/resume/recommendations",
        credit_type: CreditType::ResumeAi,
        requirement: TierRequirement::any_of(PAID_TIERS),
    },
    MeteredFeature {
        name: "cover_letter_generation",
        path: "/api/v1/cover-letters/generate",
        credit_type: CreditType::CoverLetterAi,
        requirement: TierRequirement::any_of(PAID_TIERS),
    },
    MeteredFeature {
        name: "job_market_deep_dive",
        path: "/api/v1/insights/job-market",
        credit_type: CreditType::DeepDive,
        requirement: TierRequirement::any_of(PAID_TIERS),
    },
    MeteredFeature {
        name: "new_cover_letter",
        path: "/api/v1/cover-letters",
        credit_type: CreditType::Legacy,
        requirement: TierRequirement::any_of(ANY_TIER),
    },
    MeteredFeature {
        name: "new_mock_interview",
        path: "/api/v1/mock-interviews",
        credit_type: CreditType::Legacy,
        requirement: TierRequirement::any_of(ANY_TIER),
    },
];

pub fn routes() -> Router<AppState> {
    METERED_FEATURES.iter().fold(Router::new(), |router, feature| {
        router.route(
            feature.path,
            post(consume_metered)
                .layer(Extension(feature))
                .route_layer(middleware::from_fn_with_state(
                    feature.requirement,
                    require_tier,
                )),
        )
    })
}

#[derive(Debug, Serialize)]
pub struct FeatureGrant {
    pub feature: &'static str,
    pub credit_type: CreditType,
    pub credits_used: i32,
    /// `None` for unlimited tiers
    pub remaining: Option<i32>,
}

pub async fn consume_metered(
    State(state): State<AppState>,
    Extension(feature): Extension<&'static MeteredFeature>,
    Extension(user): Extension<AuthUser>,
    format: ResponseFormat,
) -> Response {
    let outcome = state
        .engine
        .credits
        .consume_for_feature(user.user_id, feature.name, &feature.credit_type, 1)
        .await;

    match outcome {
        ConsumeOutcome::Consumed {
            credits_used,
            remaining,
        } => Json(FeatureGrant {
            feature: feature.name,
            credit_type: feature.credit_type.clone(),
            credits_used,
            remaining: Some(remaining),
        })
        .into_response(),
        ConsumeOutcome::Unlimited => Json(FeatureGrant {
            feature: feature.name,
            credit_type: feature.credit_type.clone(),
            credits_used: 0,
            remaining: None,
        })
        .into_response(),
        ConsumeOutcome::Insufficient { available } => {
            tracing::info!(
                user_id = %user.user_id,
                feature = feature.name,
                credit_type = %feature.credit_type,
                available = available,
                "Insufficient credits"
            );
            match format {
                ResponseFormat::Json => (
                    StatusCode::PAYMENT_REQUIRED,
                    Json(serde_json::json!({
                        "error": format!("Not enough {} credits", feature.credit_type),
                        "code": StatusCode::PAYMENT_REQUIRED.as_u16(),
                        "credit_type": feature.credit_type,
                        "available": available,
                    })),
                )
                    .into_response(),
                ResponseFormat::Html => deny(
                    format,
                    StatusCode::PAYMENT_REQUIRED,
                    "You have run out of credits for this feature",
                ),
            }
        }
        ConsumeOutcome::UnknownUser => deny(format, StatusCode::FORBIDDEN, "Account not found"),
        ConsumeOutcome::Failed => deny(
            format,
            StatusCode::SERVICE_UNAVAILABLE,
            "Credits are temporarily unavailable, please retry",
        ),
    }
}
