//! Tier entitlement guard
//!
//! Routers declare how denials are rendered by layering a [`ResponseFormat`]
//! extension: API routers answer with JSON status codes, page routers
//! redirect home with a flash message.

use std::convert::Infallible;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use revisume_shared::SubscriptionTier;
use serde_json::json;

use crate::auth::AuthUser;

/// Cookie carrying a one-shot user-visible message across a redirect
pub const FLASH_COOKIE: &str = "flash";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    #[default]
    Json,
    Html,
}

impl ResponseFormat {
    /// Format declared on the request, JSON when no router set one.
    pub fn of(request: &Request) -> Self {
        request
            .extensions()
            .get::<ResponseFormat>()
            .copied()
            .unwrap_or_default()
    }
}

impl<S: Send + Sync> FromRequestParts<S> for ResponseFormat {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<ResponseFormat>()
            .copied()
            .unwrap_or_default())
    }
}

/// Render a denial in the request's format.
pub fn deny(format: ResponseFormat, status: StatusCode, message: &str) -> Response {
    match format {
        ResponseFormat::Json => (
            status,
            Json(json!({
                "error": message,
                "code": status.as_u16()
            })),
        )
            .into_response(),
        ResponseFormat::Html => redirect_with_flash("/", message),
    }
}

pub fn redirect_with_flash(location: &'static str, message: &str) -> Response {
    let encoded: String = url::form_urlencoded::byte_serialize(message.as_bytes()).collect();
    let cookie = format!(
        "{}={}; Path=/; Max-Age=60; HttpOnly; SameSite=Lax",
        FLASH_COOKIE, encoded
    );

    let mut response = StatusCode::FOUND.into_response();
    let headers = response.headers_mut();
    headers.insert(header::LOCATION, HeaderValue::from_static(location));
    match HeaderValue::from_str(&cookie) {
        Ok(value) => {
            headers.insert(header::SET_COOKIE, value);
        }
        Err(e) => tracing::warn!(error = %e, "Dropping unencodable flash message"),
    }
    response
}

fn rank(tier: SubscriptionTier) -> u8 {
    match tier {
        SubscriptionTier::Free => 0,
        SubscriptionTier::Starter => 1,
        SubscriptionTier::Pro => 2,
    }
}

/// Set of tiers a route accepts. Membership is upward-closed: naming a
/// tier admits every tier above it.
#[derive(Debug, Clone, Copy)]
pub struct TierRequirement {
    required: &'static [SubscriptionTier],
}

impl TierRequirement {
    pub const fn any_of(required: &'static [SubscriptionTier]) -> Self {
        Self { required }
    }

    pub fn allows(&self, tier: SubscriptionTier) -> bool {
        self.required.iter().any(|r| rank(tier) >= rank(*r))
    }

    pub fn describe(&self) -> String {
        let lowest = self.required.iter().copied().min_by_key(|t| rank(*t));
        match lowest {
            Some(SubscriptionTier::Free) => "An account is required".to_string(),
            Some(SubscriptionTier::Starter) => "Starter or Pro tier required".to_string(),
            Some(SubscriptionTier::Pro) => "Pro tier required".to_string(),
            None => "This feature is not available on any tier".to_string(),
        }
    }
}

/// Middleware rejecting authenticated users outside the required tiers.
///
/// Must run after `require_auth`; a request without an [`AuthUser`] is
/// treated as not entitled.
pub async fn require_tier(
    State(requirement): State<TierRequirement>,
    request: Request,
    next: Next,
) -> Response {
    let format = ResponseFormat::of(&request);
    let path = request.uri().path().to_string();

    let Some(user) = request.extensions().get::<AuthUser>() else {
        tracing::warn!(path = %path, "require_tier: no authenticated user");
        return deny(format, StatusCode::FORBIDDEN, &requirement.describe());
    };

    if !requirement.allows(user.tier) {
        tracing::info!(
            path = %path,
            user_id = %user.user_id,
            tier = %user.tier,
            "require_tier: access denied"
        );
        return deny(format, StatusCode::FORBIDDEN, &requirement.describe());
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAID: TierRequirement =
        TierRequirement::any_of(&[SubscriptionTier::Starter, SubscriptionTier::Pro]);

    #[test]
    fn test_membership_is_upward_closed() {
        let pro_only = TierRequirement::any_of(&[SubscriptionTier::Pro]);
        assert!(pro_only.allows(SubscriptionTier::Pro));
        assert!(!pro_only.allows(SubscriptionTier::Starter));

        let starter = TierRequirement::any_of(&[SubscriptionTier::Starter]);
        assert!(starter.allows(SubscriptionTier::Pro));
        assert!(!starter.allows(SubscriptionTier::Free));

        let anyone = TierRequirement::any_of(&[SubscriptionTier::Free]);
        for tier in SubscriptionTier::ALL {
            assert!(anyone.allows(tier));
        }

        assert!(!PAID.allows(SubscriptionTier::Free));
    }

    #[test]
    fn test_json_denial() {
        let response = deny(ResponseFormat::Json, StatusCode::FORBIDDEN, "Pro tier required");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_html_denial_sets_flash() {
        let response = deny(ResponseFormat::Html, StatusCode::FORBIDDEN, "Starter or Pro tier required");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "/");
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("flash=Starter+or+Pro+tier+required;"));
    }
}
