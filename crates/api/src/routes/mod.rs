//! HTTP routes

pub mod auth;
pub mod billing;
pub mod credits;
pub mod features;
pub mod pages;
pub mod webhooks;

use axum::{middleware, routing::get, Extension, Router};

use crate::{auth::require_auth, entitlement::ResponseFormat, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    let public = Router::new()
        .route("/health", get(health))
        .merge(auth::public_routes())
        .merge(webhooks::routes());

    let api = Router::new()
        .merge(auth::protected_routes())
        .merge(credits::routes())
        .merge(billing::routes())
        .merge(features::routes())
        .route_layer(middleware::from_fn_with_state(auth_state.clone(), require_auth))
        .layer(Extension(ResponseFormat::Json));

    let html = pages::routes()
        .route_layer(middleware::from_fn_with_state(auth_state, require_auth))
        .layer(Extension(ResponseFormat::Html));

    Router::new()
        .merge(public)
        .merge(api)
        .merge(html)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
