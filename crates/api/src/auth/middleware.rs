//! Authentication middleware for Axum

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE},
        StatusCode,
    },
    middleware::Next,
    response::Response,
};
use revisume_billing::CreditStore;
use revisume_shared::{SubscriptionTier, User, UserId};

use super::jwt::{JwtError, JwtManager};
use crate::entitlement::{deny, ResponseFormat};

/// Cookie holding the session token for HTML clients
pub const AUTH_COOKIE: &str = "revisume_auth_token";

/// Authenticated user attached to request extensions.
///
/// The tier is read from the store on every request, never from the token,
/// so a billing downgrade takes effect immediately.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: UserId,
    pub email: String,
    pub tier: SubscriptionTier,
}

impl From<&User> for AuthUser {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id,
            email: user.email.clone(),
            tier: user.tier,
        }
    }
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
    pub store: Arc<dyn CreditStore>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingAuth | AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &'static str {
        match self {
            AuthError::MissingAuth => "Authentication required",
            AuthError::InvalidToken => "Invalid or expired token",
            AuthError::Internal(_) => "Internal server error",
        }
    }
}

fn extract_token_from_cookie(request: &Request) -> Option<String> {
    request
        .headers()
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|cookie| {
                cookie
                    .trim()
                    .strip_prefix(AUTH_COOKIE)
                    .and_then(|rest| rest.strip_prefix('='))
                    .map(str::to_string)
            })
        })
}

/// Extract bearer token from Authorization header or the auth cookie.
/// The header wins when both are present.
pub(crate) fn extract_bearer_token(request: &Request) -> Option<String> {
    if let Some(header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }

    extract_token_from_cookie(request)
}

/// Middleware that requires authentication
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let format = ResponseFormat::of(&request);

    let auth_result = match extract_bearer_token(&request) {
        Some(token) => authenticate_jwt(&auth_state, &token).await,
        None => Err(AuthError::MissingAuth),
    };

    match auth_result {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                user_id = %auth_user.user_id,
                tier = %auth_user.tier,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = %err, "require_auth: authentication failed");
            deny(format, err.status(), err.message())
        }
    }
}

async fn authenticate_jwt(auth_state: &AuthState, token: &str) -> Result<AuthUser, AuthError> {
    let claims = auth_state
        .jwt_manager
        .validate_token(token)
        .map_err(|e| match e {
            JwtError::Expired | JwtError::Invalid(_) => AuthError::InvalidToken,
            JwtError::Encode(msg) => AuthError::Internal(msg),
        })?;

    // Tokens for deleted users are rejected
    let user = auth_state
        .store
        .find_user(claims.sub)
        .await
        .map_err(|e| AuthError::Internal(e.to_string()))?
        .ok_or(AuthError::InvalidToken)?;

    Ok(AuthUser::from(&user))
}
