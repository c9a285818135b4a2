// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Revisume shared types and database helpers
//!
//! Used by the API server, the billing engine and the background worker.

pub mod db;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use types::{
    Credit, CreditType, FeatureUsageLog, NewUser, SubscriptionTier, User, UserId,
    PRO_UNLIMITED_CREDITS,
};
