//! Stripe Checkout session creation

use std::collections::HashMap;

use revisume_shared::{SubscriptionTier, User};
use serde::{Deserialize, Serialize};
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CustomerId,
};

use crate::client::{PriceCatalog, StripeClient};
use crate::error::{BillingError, BillingResult};

/// Product a user can check out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutProduct {
    Starter,
    Pro,
    CreditPack,
}

impl CheckoutProduct {
    fn mode(&self) -> CheckoutSessionMode {
        match self {
            Self::Starter | Self::Pro => CheckoutSessionMode::Subscription,
            Self::CreditPack => CheckoutSessionMode::Payment,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: String,
}

pub struct CheckoutService {
    stripe: StripeClient,
    prices: PriceCatalog,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, prices: PriceCatalog) -> Self {
        Self { stripe, prices }
    }

    /// Resolve the configured price for `product`.
    pub fn price_for(&self, product: CheckoutProduct) -> BillingResult<&str> {
        let price = match product {
            CheckoutProduct::Starter => self.prices.price_for_tier(SubscriptionTier::Starter),
            CheckoutProduct::Pro => self.prices.price_for_tier(SubscriptionTier::Pro),
            CheckoutProduct::CreditPack => self.prices.pack_price(),
        };
        price.ok_or_else(|| {
            BillingError::NotConfigured(format!("no Stripe price configured for {:?}", product))
        })
    }

    /// Create a hosted checkout session. The session carries the user id as
    /// `client_reference_id` and the price in metadata so the completion
    /// webhook can be attributed without expanding line items.
    pub async fn create_session(
        &self,
        user: &User,
        product: CheckoutProduct,
    ) -> BillingResult<CheckoutResponse> {
        if !self.stripe.config().has_api_key() {
            return Err(BillingError::NotConfigured("STRIPE_SECRET_KEY not set".into()));
        }
        if product != CheckoutProduct::CreditPack && user.tier.is_paid() {
            return Err(BillingError::InvalidInput(format!(
                "user already has an active {} subscription",
                user.tier
            )));
        }

        let price_id = self.price_for(product)?.to_string();
        let user_id = user.id.to_string();
        let config = self.stripe.config();

        let customer = user
            .stripe_customer_id
            .as_deref()
            .map(|id| id.parse::<CustomerId>())
            .transpose()
            .map_err(|e| BillingError::Internal(format!("invalid stored customer id: {}", e)))?;

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.clone());
        metadata.insert("price_id".to_string(), price_id.clone());

        let params = CreateCheckoutSession {
            customer_email: if customer.is_none() {
                Some(user.email.as_str())
            } else {
                None
            },
            customer,
            client_reference_id: Some(&user_id),
            mode: Some(product.mode()),
            line_items: Some(vec![CreateCheckoutSessionLineItems {
                price: Some(price_id.clone()),
                quantity: Some(1),
                ..Default::default()
            }]),
            success_url: Some(&config.success_url),
            cancel_url: Some(&config.cancel_url),
            metadata: Some(metadata),
            ..Default::default()
        };

        let session = match CheckoutSession::create(self.stripe.inner(), params).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(
                    user_id = %user.id,
                    error = %e,
                    "Stripe Checkout Session creation failed"
                );
                return Err(e.into());
            }
        };

        let url = session.url.clone().ok_or_else(|| {
            BillingError::StripeApi("checkout session returned without a URL".into())
        })?;

        tracing::info!(
            user_id = %user.id,
            session_id = %session.id,
            product = ?product,
            price_id = %price_id,
            "Created Checkout Session"
        );

        Ok(CheckoutResponse {
            session_id: session.id.to_string(),
            url,
        })
    }
}
