//! Application state

use std::sync::Arc;

use revisume_billing::{BillingService, CreditEngine};

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub engine: CreditEngine,
    pub jwt_manager: JwtManager,
    /// Stripe services; `None` when billing is disabled or unconfigured
    pub billing: Option<Arc<BillingService>>,
}

impl AppState {
    pub fn new(engine: CreditEngine, config: Config) -> Self {
        let billing = if config.enable_billing {
            match BillingService::from_env(&engine) {
                Ok(svc) => {
                    tracing::info!(
                        checkout = svc.checkout.is_some(),
                        "Stripe billing service initialized"
                    );
                    Some(Arc::new(svc))
                }
                Err(e) => {
                    tracing::warn!("Stripe billing not configured: {}", e);
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled via config (ENABLE_BILLING=false)");
            None
        };

        Self::with_billing(engine, config, billing)
    }

    pub fn with_billing(
        engine: CreditEngine,
        config: Config,
        billing: Option<Arc<BillingService>>,
    ) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        Self {
            config,
            engine,
            jwt_manager,
            billing,
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
            store: self.engine.store().clone(),
        }
    }

    pub fn billing_service(&self) -> Option<&Arc<BillingService>> {
        self.billing.as_ref()
    }
}
