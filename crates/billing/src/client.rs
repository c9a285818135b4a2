//! Stripe configuration, price catalog and client wrapper

use std::collections::HashMap;
use std::sync::Arc;

use revisume_shared::{CreditType, SubscriptionTier};

use crate::error::{BillingError, BillingResult};

const DEFAULT_CREDIT_PACK_SIZE: i32 = 5;
const DEFAULT_SUCCESS_URL: &str = "http://localhost:5000/pricing?checkout=success";
const DEFAULT_CANCEL_URL: &str = "http://localhost:5000/pricing?checkout=cancelled";

/// Stripe price ids for each product
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceIds {
    pub starter: String,
    pub pro: String,
    pub credit_pack: String,
}

impl PriceIds {
    pub fn from_env() -> Self {
        Self {
            starter: std::env::var("STRIPE_STARTER_PRICE_ID").unwrap_or_default(),
            pro: std::env::var("STRIPE_PRO_PRICE_ID").unwrap_or_default(),
            credit_pack: std::env::var("STRIPE_CREDIT_PACK_PRICE_ID").unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Secret API key; empty when only webhooks are handled
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_ids: PriceIds,
    pub credit_pack_size: i32,
    pub success_url: String,
    pub cancel_url: String,
}

impl StripeConfig {
    /// Load Stripe settings from the environment.
    ///
    /// `STRIPE_WEBHOOK_SECRET` is required; without it no billing event can
    /// be trusted and billing is reported as not configured.
    pub fn from_env() -> BillingResult<Self> {
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| BillingError::NotConfigured("STRIPE_WEBHOOK_SECRET not set".into()))?;

        let credit_pack_size = match std::env::var("STRIPE_CREDIT_PACK_SIZE") {
            Ok(raw) => raw.trim().parse::<i32>().map_err(|_| {
                BillingError::NotConfigured(format!("STRIPE_CREDIT_PACK_SIZE is not a number: {}", raw))
            })?,
            Err(_) => DEFAULT_CREDIT_PACK_SIZE,
        };
        if credit_pack_size <= 0 {
            return Err(BillingError::NotConfigured(
                "STRIPE_CREDIT_PACK_SIZE must be positive".into(),
            ));
        }

        let price_ids = PriceIds::from_env();
        if price_ids.starter.is_empty() || price_ids.pro.is_empty() {
            tracing::warn!("STRIPE_STARTER_PRICE_ID or STRIPE_PRO_PRICE_ID not set; subscription events will be ignored");
        }

        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY").unwrap_or_default(),
            webhook_secret,
            price_ids,
            credit_pack_size,
            success_url: std::env::var("CHECKOUT_SUCCESS_URL")
                .unwrap_or_else(|_| DEFAULT_SUCCESS_URL.to_string()),
            cancel_url: std::env::var("CHECKOUT_CANCEL_URL")
                .unwrap_or_else(|_| DEFAULT_CANCEL_URL.to_string()),
        })
    }

    pub fn has_api_key(&self) -> bool {
        !self.secret_key.trim().is_empty()
    }
}

/// What a purchased price entitles the user to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PricePurpose {
    Subscription(SubscriptionTier),
    Pack { credit_type: CreditType, amount: i32 },
}

/// Lookup from Stripe price id to internal meaning
#[derive(Debug, Clone, Default)]
pub struct PriceCatalog {
    entries: HashMap<String, PricePurpose>,
}

impl PriceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starter and pro map to their tiers; the credit pack grants
    /// `pack_size` `legacy` credits.
    pub fn from_price_ids(ids: &PriceIds, pack_size: i32) -> Self {
        Self::new()
            .with_price(&ids.starter, PricePurpose::Subscription(SubscriptionTier::Starter))
            .with_price(&ids.pro, PricePurpose::Subscription(SubscriptionTier::Pro))
            .with_price(
                &ids.credit_pack,
                PricePurpose::Pack {
                    credit_type: CreditType::Legacy,
                    amount: pack_size,
                },
            )
    }

    /// Register a price. Empty ids are skipped so unset configuration never matches.
    pub fn with_price(mut self, price_id: &str, purpose: PricePurpose) -> Self {
        if !price_id.is_empty() {
            self.entries.insert(price_id.to_string(), purpose);
        }
        self
    }

    pub fn resolve(&self, price_id: &str) -> Option<&PricePurpose> {
        self.entries.get(price_id)
    }

    pub fn tier_for(&self, price_id: &str) -> Option<SubscriptionTier> {
        match self.resolve(price_id)? {
            PricePurpose::Subscription(tier) => Some(*tier),
            PricePurpose::Pack { .. } => None,
        }
    }

    pub fn pack_for(&self, price_id: &str) -> Option<(&CreditType, i32)> {
        match self.resolve(price_id)? {
            PricePurpose::Pack {
                credit_type,
                amount,
            } => Some((credit_type, *amount)),
            PricePurpose::Subscription(_) => None,
        }
    }

    pub fn price_for_tier(&self, tier: SubscriptionTier) -> Option<&str> {
        self.entries.iter().find_map(|(price_id, purpose)| {
            (purpose == &PricePurpose::Subscription(tier)).then_some(price_id.as_str())
        })
    }

    pub fn pack_price(&self) -> Option<&str> {
        self.entries.iter().find_map(|(price_id, purpose)| {
            matches!(purpose, PricePurpose::Pack { .. }).then_some(price_id.as_str())
        })
    }
}

/// Stripe API client bundled with its configuration
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self {
            inner,
            config: Arc::new(config),
        }
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
