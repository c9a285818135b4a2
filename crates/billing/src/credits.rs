//! Consumption gate and credit reads
//!
//! Every public operation runs in one store transaction. Failures are
//! rolled back, logged and reported as a refusal: callers never proceed with
//! a metered feature on an error path.

use std::sync::Arc;

use revisume_shared::{Credit, CreditType, NewUser, SubscriptionTier, User, UserId};
use serde::Serialize;
use time::OffsetDateTime;

use crate::clock::Clock;
use crate::error::{BillingError, BillingResult, StoreResult};
use crate::policy::TierPolicy;
use crate::quota::QuotaScheduler;
use crate::store::{CreditStore, StoreTx};
use crate::usage::UsageLog;

/// Result of a consumption attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConsumeOutcome {
    /// Balance decremented and usage recorded
    Consumed { credits_used: i32, remaining: i32 },
    /// Pro tier: usage recorded with zero credits, balance untouched
    Unlimited,
    /// Balance too low; nothing written
    Insufficient { available: i32 },
    UnknownUser,
    /// Storage error; rolled back, nothing written
    Failed,
}

impl ConsumeOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Consumed { .. } | Self::Unlimited)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreditBalance {
    pub credit_type: CreditType,
    pub amount: i32,
    pub unlimited: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_reset: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreditSummary {
    pub user_id: UserId,
    pub tier: SubscriptionTier,
    pub balances: Vec<CreditBalance>,
}

#[derive(Clone)]
pub struct CreditService {
    store: Arc<dyn CreditStore>,
    scheduler: QuotaScheduler,
    clock: Arc<dyn Clock>,
}

impl CreditService {
    pub fn new(store: Arc<dyn CreditStore>, policy: Arc<TierPolicy>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            scheduler: QuotaScheduler::new(policy),
            clock,
        }
    }

    pub fn policy(&self) -> &TierPolicy {
        self.scheduler.policy()
    }

    pub fn scheduler(&self) -> &QuotaScheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<dyn CreditStore> {
        &self.store
    }

    /// Spend `n` credits of `credit_type`, logging the credit type as the feature.
    pub async fn consume_credit(&self, user_id: UserId, credit_type: &CreditType, n: i32) -> bool {
        self.consume_for_feature(user_id, credit_type.as_str(), credit_type, n)
            .await
            .is_allowed()
    }

    /// Spend `n` credits on behalf of `feature_name`.
    ///
    /// Errors are logged and reported as [`ConsumeOutcome::Failed`].
    pub async fn consume_for_feature(
        &self,
        user_id: UserId,
        feature_name: &str,
        credit_type: &CreditType,
        n: i32,
    ) -> ConsumeOutcome {
        match self.try_consume(user_id, feature_name, credit_type, n).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    credit_type = %credit_type,
                    feature = %feature_name,
                    error = %e,
                    "Credit consumption failed; rolled back"
                );
                ConsumeOutcome::Failed
            }
        }
    }

    /// Fallible form of [`Self::consume_for_feature`].
    pub async fn try_consume(
        &self,
        user_id: UserId,
        feature_name: &str,
        credit_type: &CreditType,
        n: i32,
    ) -> BillingResult<ConsumeOutcome> {
        if n < 0 {
            return Err(BillingError::InvalidInput(format!(
                "cannot consume a negative amount ({})",
                n
            )));
        }

        let now = self.clock.now_utc();
        let mut tx = self.store.begin().await?;
        let Some(user) = tx.get_user(user_id).await? else {
            tracing::warn!(user_id = %user_id, "Consume for unknown user");
            return Ok(ConsumeOutcome::UnknownUser);
        };

        if self.policy().is_unlimited(user.tier) {
            if n > self.policy().unlimited() {
                return Ok(ConsumeOutcome::Insufficient {
                    available: self.policy().unlimited(),
                });
            }
            UsageLog::record_in(&mut *tx, user.id, feature_name, 0, now).await?;
            tx.commit().await?;
            return Ok(ConsumeOutcome::Unlimited);
        }

        let credit = self
            .scheduler
            .fetch_or_create(&mut *tx, &user, credit_type, now)
            .await?;
        let credit = self.scheduler.maybe_refill(&mut *tx, &user, credit, now).await?;

        if credit.amount < n {
            // Keep any row creation or refill; they are read effects, not consumption
            tx.commit().await?;
            tracing::info!(
                user_id = %user.id,
                credit_type = %credit_type,
                available = credit.amount,
                requested = n,
                "Insufficient credits"
            );
            return Ok(ConsumeOutcome::Insufficient {
                available: credit.amount,
            });
        }

        let credit = tx.update_amount(&credit, -n).await?;
        UsageLog::record_in(&mut *tx, user.id, feature_name, n, now).await?;
        tx.commit().await?;

        tracing::info!(
            user_id = %user.id,
            credit_type = %credit_type,
            credits_used = n,
            remaining = credit.amount,
            "Credits consumed"
        );
        Ok(ConsumeOutcome::Consumed {
            credits_used: n,
            remaining: credit.amount,
        })
    }

    /// Current balance, applying a due refill. Unknown users and errors read as 0.
    pub async fn get_user_credits(&self, user_id: UserId, credit_type: &CreditType) -> i32 {
        match self.balance(user_id, credit_type).await {
            Ok(Some(amount)) => amount,
            Ok(None) => 0,
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    credit_type = %credit_type,
                    error = %e,
                    "Failed to read credits"
                );
                0
            }
        }
    }

    /// Current balance, or `None` for an unknown user.
    ///
    /// Existing rows are refilled when due. Missing rows are not created;
    /// they report the amount lazy initialization would give them.
    pub async fn balance(
        &self,
        user_id: UserId,
        credit_type: &CreditType,
    ) -> BillingResult<Option<i32>> {
        let now = self.clock.now_utc();
        let mut tx = self.store.begin().await?;
        let Some(user) = tx.get_user(user_id).await? else {
            return Ok(None);
        };
        if self.policy().is_unlimited(user.tier) {
            return Ok(Some(self.policy().unlimited()));
        }
        let amount = self
            .read_balance(&mut *tx, &user, credit_type, now)
            .await?
            .amount;
        tx.commit().await?;
        Ok(Some(amount))
    }

    /// Balances for every known credit type plus any other stored rows.
    pub async fn credit_summary(&self, user_id: UserId) -> BillingResult<Option<CreditSummary>> {
        let now = self.clock.now_utc();
        let mut tx = self.store.begin().await?;
        let Some(user) = tx.get_user(user_id).await? else {
            return Ok(None);
        };
        let unlimited = self.policy().is_unlimited(user.tier);

        let mut balances = Vec::new();
        for credit_type in CreditType::known_types() {
            let balance = self.read_balance(&mut *tx, &user, &credit_type, now).await?;
            balances.push(CreditBalance {
                amount: if unlimited {
                    self.policy().unlimited()
                } else {
                    balance.amount
                },
                unlimited,
                last_reset: balance.last_reset,
                credit_type,
            });
        }
        tx.commit().await?;

        for credit in self.store.list_credits(user_id).await? {
            if matches!(credit.credit_type, CreditType::Other(_)) {
                balances.push(CreditBalance {
                    credit_type: credit.credit_type,
                    amount: credit.amount,
                    unlimited,
                    last_reset: credit.last_reset,
                });
            }
        }

        Ok(Some(CreditSummary {
            user_id: user.id,
            tier: user.tier,
            balances,
        }))
    }

    /// Refill every due quota row of a starter user. Returns `true` if
    /// anything changed; non-starter users and errors return `false`.
    pub async fn reset_monthly_credits_for_user(&self, user_id: UserId) -> bool {
        match self.try_reset_monthly_credits(user_id).await {
            Ok(changed) => changed,
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    error = %e,
                    "Monthly credit reset failed; rolled back"
                );
                false
            }
        }
    }

    async fn try_reset_monthly_credits(&self, user_id: UserId) -> BillingResult<bool> {
        let now = self.clock.now_utc();
        let mut tx = self.store.begin().await?;
        let Some(user) = tx.user_for_update(user_id).await? else {
            return Ok(false);
        };
        if user.tier != SubscriptionTier::Starter {
            return Ok(false);
        }
        let changed = self.scheduler.refill_user(&mut *tx, &user, now).await?;
        if changed {
            tx.commit().await?;
            tracing::info!(user_id = %user.id, "Monthly credits reset");
        }
        Ok(changed)
    }

    /// Add `n` credits of `credit_type`, clamped at the ceiling. Returns the new balance.
    pub async fn grant_credits(
        &self,
        user_id: UserId,
        credit_type: &CreditType,
        n: i32,
    ) -> BillingResult<i32> {
        if n < 0 {
            return Err(BillingError::InvalidInput(format!(
                "cannot grant a negative amount ({})",
                n
            )));
        }
        let now = self.clock.now_utc();
        let mut tx = self.store.begin().await?;
        let user = tx
            .user_for_update(user_id)
            .await?
            .ok_or_else(|| BillingError::UnknownUser(user_id.to_string()))?;
        let credit = self.grant_in(&mut *tx, &user, credit_type, n, now).await?;
        tx.commit().await?;
        Ok(credit.amount)
    }

    /// Grant inside an open transaction. A due refill is applied first so
    /// it cannot later overwrite the grant within the same month.
    pub(crate) async fn grant_in(
        &self,
        tx: &mut dyn StoreTx,
        user: &User,
        credit_type: &CreditType,
        n: i32,
        now: OffsetDateTime,
    ) -> StoreResult<Credit> {
        let credit = self
            .scheduler
            .fetch_or_create(tx, user, credit_type, now)
            .await?;
        let credit = self.scheduler.maybe_refill(tx, user, credit, now).await?;

        let headroom = self.policy().unlimited() - credit.amount;
        let delta = n.min(headroom.max(0));
        if delta < n {
            tracing::warn!(
                user_id = %user.id,
                credit_type = %credit_type,
                requested = n,
                granted = delta,
                "Credit grant clamped at ceiling"
            );
        }
        let credit = tx.update_amount(&credit, delta).await?;
        tracing::info!(
            user_id = %user.id,
            credit_type = %credit_type,
            granted = delta,
            amount = credit.amount,
            "Credits granted"
        );
        Ok(credit)
    }

    /// Create a free-tier user with zeroed rows for every quota type.
    pub async fn open_account(&self, new_user: &NewUser) -> BillingResult<User> {
        let now = self.clock.now_utc();
        let mut tx = self.store.begin().await?;
        let user = tx.insert_user(new_user, now).await?;
        for entry in self.policy().quotas() {
            tx.create_credit(user.id, &entry.credit_type, 0, Some(now))
                .await?;
        }
        tx.commit().await?;
        tracing::info!(user_id = %user.id, "Account opened");
        Ok(user)
    }

    async fn read_balance(
        &self,
        tx: &mut dyn StoreTx,
        user: &User,
        credit_type: &CreditType,
        now: OffsetDateTime,
    ) -> StoreResult<CreditBalance> {
        let unlimited = self.policy().is_unlimited(user.tier);
        Ok(match tx.find_credit(user.id, credit_type).await? {
            Some(credit) => {
                let credit = self.scheduler.maybe_refill(tx, user, credit, now).await?;
                CreditBalance {
                    credit_type: credit.credit_type,
                    amount: credit.amount,
                    unlimited,
                    last_reset: credit.last_reset,
                }
            }
            None => CreditBalance {
                credit_type: credit_type.clone(),
                amount: self.policy().initial_amount(user.tier, credit_type),
                unlimited,
                last_reset: None,
            },
        })
    }
}
