// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Revisume API Library
//!
//! This crate contains the HTTP server components for Revisume: account
//! registration, metered feature endpoints behind the tier guard, credit
//! balances, checkout and the Stripe webhook.

pub mod auth;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod routes;
pub mod state;

#[cfg(test)]
mod edge_case_tests;

pub use config::{Config, StoreBackend};
pub use entitlement::{ResponseFormat, TierRequirement};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
