//! Registration, login and profile

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use revisume_billing::{BillingError, StoreError};
use revisume_shared::{NewUser, User};
use serde::{Deserialize, Serialize};

use crate::{
    auth::{hash_password, validate_password_strength, verify_password, AuthUser},
    error::{ApiError, ApiResult},
    state::AppState,
};

pub fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/auth/register", post(register))
        .route("/api/v1/auth/login", post(login))
}

pub fn protected_routes() -> Router<AppState> {
    Router::new().route("/api/v1/auth/me", get(me))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub user: User,
}

fn issue_token(state: &AppState, user: User) -> ApiResult<AuthResponse> {
    let (access_token, _jti) = state
        .jwt_manager
        .generate_access_token(user.id, &user.email)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(AuthResponse {
        access_token,
        token_type: "Bearer",
        expires_in: state.jwt_manager.access_token_expiry_seconds(),
        user,
    })
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<AuthResponse>)> {
    let email = req.email.trim().to_lowercase();
    let username = req.username.trim().to_string();
    if !email.contains('@') || email.len() < 3 {
        return Err(ApiError::BadRequest("A valid email address is required".into()));
    }
    if username.is_empty() {
        return Err(ApiError::BadRequest("Username is required".into()));
    }
    validate_password_strength(&req.password)?;

    let new_user = NewUser {
        email,
        username,
        password_hash: hash_password(&req.password)?,
    };

    let user = match state.engine.credits.open_account(&new_user).await {
        Ok(user) => user,
        Err(BillingError::Store(StoreError::DuplicateKey(constraint))) => {
            tracing::info!(constraint = %constraint, "Registration rejected: duplicate");
            return Err(ApiError::Conflict(
                "Email or username already registered".into(),
            ));
        }
        Err(e) => return Err(e.into()),
    };

    tracing::info!(user_id = %user.id, "User registered");
    Ok((StatusCode::CREATED, Json(issue_token(&state, user)?)))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    let email = req.email.trim().to_lowercase();
    let user = state
        .engine
        .store()
        .find_user_by_email(&email)
        .await
        .map_err(BillingError::from)?
        .filter(|user| verify_password(&req.password, &user.password_hash))
        .ok_or(ApiError::InvalidCredentials)?;

    // Starter balances are brought into the current month at login
    if state
        .engine
        .credits
        .reset_monthly_credits_for_user(user.id)
        .await
    {
        tracing::info!(user_id = %user.id, "Monthly credits refilled at login");
    }

    tracing::info!(user_id = %user.id, "User logged in");
    Ok(Json(issue_token(&state, user)?))
}

pub async fn me(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<User>> {
    let user = state
        .engine
        .store()
        .find_user(auth_user.user_id)
        .await
        .map_err(BillingError::from)?
        .ok_or_else(|| ApiError::NotFound("User not found".into()))?;
    Ok(Json(user))
}
