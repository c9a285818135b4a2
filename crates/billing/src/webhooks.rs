//! Stripe webhook handling
//!
//! Verification and parsing happen before any state is touched. Each event
//! is then processed in a single store transaction that also claims its
//! event id, so a replay of a committed event is a no-op and a failure
//! leaves neither effects nor a claim behind.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use revisume_shared::{SubscriptionTier, User, UserId};
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::client::PriceCatalog;
use crate::clock::Clock;
use crate::credits::CreditService;
use crate::error::{BillingError, BillingResult};
use crate::events::{parse_stripe_event, BillingEvent, BillingEventKind};
use crate::store::StoreTx;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age (and clock skew) accepted for a signed payload
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Checks the `Stripe-Signature` header against the endpoint secret.
#[derive(Clone)]
pub struct StripeWebhookVerifier {
    secret: String,
    tolerance_secs: i64,
    clock: Arc<dyn Clock>,
}

impl StripeWebhookVerifier {
    pub fn new(secret: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs: SIGNATURE_TOLERANCE_SECS,
            clock,
        }
    }

    /// Verify a header of the form `t=<unix>,v1=<hex>[,v1=<hex>...]`.
    ///
    /// Any matching `v1` entry is accepted; `v0` entries are ignored.
    pub fn verify(&self, payload: &str, signature_header: &str) -> BillingResult<()> {
        if self.secret.is_empty() {
            return Err(BillingError::NotConfigured(
                "webhook secret not configured".into(),
            ));
        }

        let mut timestamp: Option<i64> = None;
        let mut signatures: Vec<&str> = Vec::new();
        for part in signature_header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;
        if signatures.is_empty() {
            tracing::warn!("Missing v1 signature in signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let now = self.clock.now_utc().unix_timestamp();
        if (now - timestamp).abs() > self.tolerance_secs {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                diff = (now - timestamp).abs(),
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let expected = compute_signature(&self.secret, timestamp, payload)?;
        let matched = signatures
            .iter()
            .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));
        if !matched {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }
        Ok(())
    }
}

/// Hex HMAC-SHA256 of `"{timestamp}.{payload}"` keyed with the endpoint secret.
pub fn compute_signature(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| BillingError::Internal(format!("invalid webhook secret: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// What happened to a delivered event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed,
    /// Event id already committed
    Duplicate,
    /// Acknowledged without state change
    Ignored { reason: String },
}

impl WebhookOutcome {
    fn ignored(reason: impl Into<String>) -> Self {
        Self::Ignored {
            reason: reason.into(),
        }
    }
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    credits: CreditService,
    prices: PriceCatalog,
    verifier: StripeWebhookVerifier,
    clock: Arc<dyn Clock>,
}

impl WebhookHandler {
    pub fn new(
        credits: CreditService,
        prices: PriceCatalog,
        verifier: StripeWebhookVerifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            credits,
            prices,
            verifier,
            clock,
        }
    }

    /// Verify the signature, then parse the payload into a [`BillingEvent`].
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<BillingEvent> {
        self.verifier.verify(payload, signature)?;
        let event = parse_stripe_event(payload)?;
        tracing::debug!(
            event_id = %event.id,
            event_type = %event.kind.name(),
            "Webhook signature verified"
        );
        Ok(event)
    }

    /// Handle a verified event atomically.
    pub async fn handle_event(&self, event: BillingEvent) -> BillingResult<WebhookOutcome> {
        let now = self.clock.now_utc();
        let mut tx = self.credits.store().begin().await?;

        if !tx.claim_event(&event.id, event.kind.name(), now).await? {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.kind.name(),
                "Duplicate webhook event; already processed"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        let outcome = match self.process_event_internal(&mut *tx, &event, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.kind.name(),
                    error = %e,
                    "Webhook processing failed; rolled back"
                );
                return Err(e);
            }
        };

        tx.commit().await?;

        match &outcome {
            WebhookOutcome::Ignored { reason } => tracing::warn!(
                event_id = %event.id,
                event_type = %event.kind.name(),
                reason = %reason,
                "Webhook event acknowledged without changes"
            ),
            _ => tracing::info!(
                event_id = %event.id,
                event_type = %event.kind.name(),
                "Webhook event processed"
            ),
        }
        Ok(outcome)
    }

    async fn process_event_internal(
        &self,
        tx: &mut dyn StoreTx,
        event: &BillingEvent,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        match &event.kind {
            BillingEventKind::SubscriptionCheckoutCompleted {
                user_id,
                customer_id,
                subscription_id,
                price_id,
            } => {
                self.handle_subscription_checkout(
                    tx,
                    *user_id,
                    customer_id,
                    subscription_id,
                    price_id,
                    now,
                )
                .await
            }
            BillingEventKind::PackCheckoutCompleted {
                user_id,
                customer_id,
                price_id,
            } => {
                self.handle_pack_checkout(tx, *user_id, customer_id.as_deref(), price_id, now)
                    .await
            }
            BillingEventKind::InvoicePaid {
                customer_id,
                subscription_id,
            } => {
                self.handle_invoice_paid(tx, customer_id.as_deref(), subscription_id.as_deref(), now)
                    .await
            }
            BillingEventKind::InvoicePaymentFailed {
                customer_id,
                subscription_id,
            } => {
                self.handle_invoice_payment_failed(
                    tx,
                    customer_id.as_deref(),
                    subscription_id.as_deref(),
                )
                .await
            }
            BillingEventKind::SubscriptionUpdated {
                subscription_id,
                price_id,
                status,
                ..
            } => {
                self.handle_subscription_updated(
                    tx,
                    subscription_id,
                    price_id.as_deref(),
                    status,
                    now,
                )
                .await
            }
            BillingEventKind::SubscriptionDeleted {
                subscription_id, ..
            } => self.handle_subscription_deleted(tx, subscription_id).await,
            BillingEventKind::Unhandled { provider_type } => {
                tracing::info!(
                    event_type = %provider_type,
                    event_id = %event.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
                Ok(WebhookOutcome::ignored("unhandled event type"))
            }
        }
    }

    async fn handle_subscription_checkout(
        &self,
        tx: &mut dyn StoreTx,
        user_id: UserId,
        customer_id: &str,
        subscription_id: &str,
        price_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let Some(tier) = self.prices.tier_for(price_id) else {
            tracing::error!(price_id = %price_id, "Subscription price does not map to a tier");
            return Ok(WebhookOutcome::ignored(
                BillingError::UnknownPrice(price_id.to_string()).to_string(),
            ));
        };
        let Some(user) = tx.user_for_update(user_id).await? else {
            tracing::error!(user_id = %user_id, "Checkout completed for unknown user");
            return Ok(WebhookOutcome::ignored(
                BillingError::UnknownUser(user_id.to_string()).to_string(),
            ));
        };

        if let Some(existing) = user.stripe_customer_id.as_deref() {
            if existing != customer_id {
                let conflict = BillingError::IdentifierConflict(format!(
                    "user {} is bound to customer {}, event carries {}",
                    user.id, existing, customer_id
                ));
                tracing::error!(user_id = %user.id, error = %conflict, "Refusing to rebind customer");
                return Ok(WebhookOutcome::ignored(conflict.to_string()));
            }
        }
        if let Some(existing) = user.stripe_subscription_id.as_deref() {
            if existing != subscription_id {
                tracing::warn!(
                    user_id = %user.id,
                    previous = %existing,
                    subscription_id = %subscription_id,
                    "Replacing subscription identifier"
                );
            }
        }

        tx.bind_billing_ids(user.id, Some(customer_id), Some(subscription_id))
            .await?;
        tx.set_tier(user.id, tier).await?;
        self.credits
            .scheduler()
            .seed_tier(tx, user.id, tier, now)
            .await?;

        tracing::info!(
            user_id = %user.id,
            previous_tier = %user.tier,
            tier = %tier,
            subscription_id = %subscription_id,
            "Subscription activated"
        );
        Ok(WebhookOutcome::Processed)
    }

    async fn handle_pack_checkout(
        &self,
        tx: &mut dyn StoreTx,
        user_id: UserId,
        customer_id: Option<&str>,
        price_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let Some((credit_type, amount)) = self.prices.pack_for(price_id) else {
            tracing::error!(price_id = %price_id, "Payment price does not map to a credit pack");
            return Ok(WebhookOutcome::ignored(
                BillingError::UnknownPrice(price_id.to_string()).to_string(),
            ));
        };
        let Some(user) = tx.user_for_update(user_id).await? else {
            tracing::error!(user_id = %user_id, "Pack purchased by unknown user");
            return Ok(WebhookOutcome::ignored(
                BillingError::UnknownUser(user_id.to_string()).to_string(),
            ));
        };

        // The payment went through; a customer mismatch must not block the grant
        match (user.stripe_customer_id.as_deref(), customer_id) {
            (None, Some(customer_id)) => {
                tx.bind_billing_ids(
                    user.id,
                    Some(customer_id),
                    user.stripe_subscription_id.as_deref(),
                )
                .await?;
            }
            (Some(existing), Some(customer_id)) if existing != customer_id => {
                tracing::warn!(
                    user_id = %user.id,
                    bound = %existing,
                    customer_id = %customer_id,
                    "Pack purchased under a different customer; keeping existing binding"
                );
            }
            _ => {}
        }

        self.credits
            .grant_in(tx, &user, credit_type, amount, now)
            .await?;
        Ok(WebhookOutcome::Processed)
    }

    async fn handle_invoice_paid(
        &self,
        tx: &mut dyn StoreTx,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let Some(user) = self.locate_user(tx, customer_id, subscription_id).await? else {
            return Ok(WebhookOutcome::ignored("no user for invoice"));
        };

        match user.tier {
            SubscriptionTier::Starter => {
                let changed = self
                    .credits
                    .scheduler()
                    .refill_user(tx, &user, now)
                    .await?;
                tracing::info!(user_id = %user.id, refilled = changed, "Starter renewal");
            }
            SubscriptionTier::Pro => {
                self.credits
                    .scheduler()
                    .seed_tier(tx, user.id, SubscriptionTier::Pro, now)
                    .await?;
                tracing::info!(user_id = %user.id, "Pro renewal");
            }
            SubscriptionTier::Free => {
                return Ok(WebhookOutcome::ignored("invoice paid for free-tier user"));
            }
        }
        Ok(WebhookOutcome::Processed)
    }

    async fn handle_invoice_payment_failed(
        &self,
        tx: &mut dyn StoreTx,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
    ) -> BillingResult<WebhookOutcome> {
        let Some(user) = self.locate_user(tx, customer_id, subscription_id).await? else {
            return Ok(WebhookOutcome::ignored("no user for invoice"));
        };
        if user.tier == SubscriptionTier::Free {
            return Ok(WebhookOutcome::ignored("user already on free tier"));
        }

        self.downgrade(tx, &user).await?;
        tracing::warn!(
            user_id = %user.id,
            previous_tier = %user.tier,
            subscription_id = ?subscription_id,
            "User downgraded to free after payment failure"
        );
        Ok(WebhookOutcome::Processed)
    }

    async fn handle_subscription_updated(
        &self,
        tx: &mut dyn StoreTx,
        subscription_id: &str,
        price_id: Option<&str>,
        status: &str,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        if !matches!(status, "active" | "trialing") {
            return Ok(WebhookOutcome::ignored(format!(
                "subscription status {}",
                status
            )));
        }
        let Some(tier) = price_id.and_then(|price_id| self.prices.tier_for(price_id)) else {
            return Ok(WebhookOutcome::ignored("subscription price does not map to a tier"));
        };
        let Some(user) = tx.user_by_subscription_id(subscription_id).await? else {
            return Ok(WebhookOutcome::ignored("no user for subscription"));
        };
        if user.tier == tier {
            return Ok(WebhookOutcome::ignored("tier unchanged"));
        }

        tx.set_tier(user.id, tier).await?;
        self.credits
            .scheduler()
            .seed_tier(tx, user.id, tier, now)
            .await?;
        tracing::info!(
            user_id = %user.id,
            previous_tier = %user.tier,
            tier = %tier,
            "Subscription plan changed"
        );
        Ok(WebhookOutcome::Processed)
    }

    async fn handle_subscription_deleted(
        &self,
        tx: &mut dyn StoreTx,
        subscription_id: &str,
    ) -> BillingResult<WebhookOutcome> {
        let Some(user) = tx.user_by_subscription_id(subscription_id).await? else {
            return Ok(WebhookOutcome::ignored("no user for subscription"));
        };

        tx.bind_billing_ids(user.id, user.stripe_customer_id.as_deref(), None)
            .await?;
        if user.tier != SubscriptionTier::Free {
            self.downgrade(tx, &user).await?;
        }
        tracing::info!(
            user_id = %user.id,
            subscription_id = %subscription_id,
            "Subscription deleted"
        );
        Ok(WebhookOutcome::Processed)
    }

    /// Move to free, applying the configured credit policy.
    async fn downgrade(&self, tx: &mut dyn StoreTx, user: &User) -> BillingResult<()> {
        tx.set_tier(user.id, SubscriptionTier::Free).await?;
        if !self.credits.policy().downgrade_preserves_credits() {
            self.credits.scheduler().clear_seeded(tx, user.id).await?;
        }
        Ok(())
    }

    /// Subscription id wins when present so a stale subscription on a
    /// reused customer cannot affect the current one.
    async fn locate_user(
        &self,
        tx: &mut dyn StoreTx,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
    ) -> BillingResult<Option<User>> {
        let user = match (subscription_id, customer_id) {
            (Some(subscription_id), _) => tx.user_by_subscription_id(subscription_id).await?,
            (None, Some(customer_id)) => tx.user_by_customer_id(customer_id).await?,
            (None, None) => None,
        };
        if user.is_none() {
            tracing::warn!(
                customer_id = ?customer_id,
                subscription_id = ?subscription_id,
                "Webhook: user not found for billing identifiers"
            );
        }
        Ok(user)
    }
}
