// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Revisume Credit & Entitlement Engine
//!
//! Decides whether a user may invoke a metered feature and keeps the
//! balances behind that decision consistent with Stripe.
//!
//! ## Features
//!
//! - **Tier Policy**: per-tier monthly quotas and the unlimited sentinel
//! - **Credit Store**: transactional balance storage (Postgres or in-memory)
//! - **Quota Scheduler**: lazy calendar-month refills for starter users
//! - **Consumption Gate**: atomic check-and-decrement with usage logging
//! - **Webhooks**: Stripe events drive tier changes and pack grants
//! - **Checkout**: hosted Stripe Checkout sessions
//! - **Invariants**: read-only consistency checks

use std::sync::Arc;

pub mod checkout;
pub mod client;
pub mod clock;
pub mod credits;
pub mod error;
pub mod events;
pub mod invariants;
pub mod policy;
pub mod quota;
pub mod store;
pub mod usage;
pub mod webhooks;


// Checkout
pub use checkout::{CheckoutProduct, CheckoutResponse, CheckoutService};

// Client
pub use client::{PriceCatalog, PriceIds, PricePurpose, StripeClient, StripeConfig};

// Clock
pub use clock::{Clock, SystemClock, TestClock};

// Credits
pub use credits::{ConsumeOutcome, CreditBalance, CreditService, CreditSummary};

// Error
pub use error::{BillingError, BillingResult, StoreError, StoreResult};

// Events
pub use events::{parse_stripe_event, BillingEvent, BillingEventKind};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Policy
pub use policy::{QuotaEntry, RefillMode, TierPolicy};

// Quota
pub use quota::{is_refill_due, QuotaScheduler};

// Store
pub use store::{CreditStore, MemoryCreditStore, PgCreditStore, StoreTx};

// Usage
pub use usage::{FeatureUsageSummary, UsageLog};

// Webhooks
pub use webhooks::{
    compute_signature, StripeWebhookVerifier, WebhookHandler, WebhookOutcome,
    SIGNATURE_TOLERANCE_SECS,
};

/// Credit-side services sharing one store, policy and clock
#[derive(Clone)]
pub struct CreditEngine {
    pub credits: CreditService,
    pub usage: UsageLog,
    pub invariants: Arc<InvariantChecker>,
    store: Arc<dyn CreditStore>,
    policy: Arc<TierPolicy>,
    clock: Arc<dyn Clock>,
}

impl CreditEngine {
    pub fn new(store: Arc<dyn CreditStore>, policy: TierPolicy, clock: Arc<dyn Clock>) -> Self {
        let policy = Arc::new(policy);
        Self {
            credits: CreditService::new(store.clone(), policy.clone(), clock.clone()),
            usage: UsageLog::new(store.clone()),
            invariants: Arc::new(InvariantChecker::new(
                store.clone(),
                policy.clone(),
                clock.clone(),
            )),
            store,
            policy,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn CreditStore> {
        &self.store
    }

    pub fn policy(&self) -> &TierPolicy {
        &self.policy
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

/// Stripe-facing services
pub struct BillingService {
    pub webhooks: WebhookHandler,
    /// Present only when a secret API key is configured
    pub checkout: Option<CheckoutService>,
}

impl BillingService {
    pub fn new(engine: &CreditEngine, config: StripeConfig) -> Self {
        let prices = PriceCatalog::from_price_ids(&config.price_ids, config.credit_pack_size);
        let verifier = StripeWebhookVerifier::new(config.webhook_secret.clone(), engine.clock.clone());
        let webhooks = WebhookHandler::new(
            engine.credits.clone(),
            prices.clone(),
            verifier,
            engine.clock.clone(),
        );

        let checkout = if config.has_api_key() {
            Some(CheckoutService::new(StripeClient::new(config), prices))
        } else {
            tracing::warn!("STRIPE_SECRET_KEY not set; checkout disabled");
            None
        };

        Self { webhooks, checkout }
    }

    /// Create from environment variables
    pub fn from_env(engine: &CreditEngine) -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(engine, config))
    }
}
