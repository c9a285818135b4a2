//! Server-rendered pages

use axum::{
    extract::State,
    middleware,
    response::Html,
    routing::get,
    Extension, Router,
};
use revisume_shared::{CreditType, SubscriptionTier};

use crate::{
    auth::AuthUser,
    entitlement::{require_tier, TierRequirement},
    state::AppState,
};

const COVER_LETTER_GENERATOR: TierRequirement =
    TierRequirement::any_of(&[SubscriptionTier::Starter, SubscriptionTier::Pro]);

pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/cover-letters/generate",
        get(cover_letter_generator).route_layer(middleware::from_fn_with_state(
            COVER_LETTER_GENERATOR,
            require_tier,
        )),
    )
}

pub async fn cover_letter_generator(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Html<String> {
    let remaining = if state.engine.policy().is_unlimited(user.tier) {
        "unlimited".to_string()
    } else {
        state
            .engine
            .credits
            .get_user_credits(user.user_id, &CreditType::CoverLetterAi)
            .await
            .to_string()
    };

    Html(format!(
        "<!doctype html>\n<html>\n<head><title>Cover Letter Generator</title></head>\n<body>\n\
         <h1>Cover Letter Generator</h1>\n\
         <p>Plan: {}</p>\n\
         <p>AI generations left this month: {}</p>\n\
         <form method=\"post\" action=\"/api/v1/cover-letters/generate\">\n\
         <textarea name=\"job_description\"></textarea>\n\
         <button type=\"submit\">Generate</button>\n\
         </form>\n</body>\n</html>\n",
        user.tier, remaining
    ))
}
