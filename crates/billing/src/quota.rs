//! Monthly quota refill and tier seeding
//!
//! Refills are lazy: a starter row is brought up to its quota the first time
//! it is read or consumed in a calendar month (UTC) later than its
//! `last_reset`. The daily worker sweep calls the same code path, so lazy and
//! scheduled refills can never both apply in one month.

use std::sync::Arc;

use revisume_shared::{Credit, CreditType, SubscriptionTier, User, UserId};
use time::{OffsetDateTime, UtcOffset};

use crate::error::{StoreError, StoreResult};
use crate::policy::TierPolicy;
use crate::store::StoreTx;

/// Whether a row last refilled at `last_reset` is due for a refill at `now`.
///
/// A missing timestamp is always due. A timestamp in the future (clock skew)
/// is never due.
pub fn is_refill_due(last_reset: Option<OffsetDateTime>, now: OffsetDateTime) -> bool {
    let Some(last) = last_reset else {
        return true;
    };
    let last = last.to_offset(UtcOffset::UTC);
    let now = now.to_offset(UtcOffset::UTC);
    (now.year(), u8::from(now.month())) > (last.year(), u8::from(last.month()))
}

#[derive(Clone)]
pub struct QuotaScheduler {
    policy: Arc<TierPolicy>,
}

impl QuotaScheduler {
    pub fn new(policy: Arc<TierPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &TierPolicy {
        &self.policy
    }

    /// Read the `(user, credit_type)` row, creating it with the tier's
    /// initial amount if absent.
    pub async fn fetch_or_create(
        &self,
        tx: &mut dyn StoreTx,
        user: &User,
        credit_type: &CreditType,
        now: OffsetDateTime,
    ) -> StoreResult<Credit> {
        if let Some(credit) = tx.find_credit(user.id, credit_type).await? {
            return Ok(credit);
        }

        let initial = self.policy.initial_amount(user.tier, credit_type);
        match tx.create_credit(user.id, credit_type, initial, Some(now)).await {
            Ok(credit) => {
                tracing::debug!(
                    user_id = %user.id,
                    credit_type = %credit_type,
                    amount = credit.amount,
                    "Created credit row"
                );
                Ok(credit)
            }
            // A concurrent writer created it first
            Err(StoreError::DuplicateKey(_)) => tx
                .find_credit(user.id, credit_type)
                .await?
                .ok_or_else(|| {
                    StoreError::NotFound(format!("credit {} for user {}", credit_type, user.id))
                }),
            Err(e) => Err(e),
        }
    }

    /// Apply the monthly refill to `credit` if the user is on the starter
    /// tier, the type has a quota and the row is due. Returns the row as
    /// it stands afterwards.
    pub async fn maybe_refill(
        &self,
        tx: &mut dyn StoreTx,
        user: &User,
        credit: Credit,
        now: OffsetDateTime,
    ) -> StoreResult<Credit> {
        if user.tier != SubscriptionTier::Starter || !is_refill_due(credit.last_reset, now) {
            return Ok(credit);
        }
        let Some(amount) = self.policy.refilled_amount(&credit.credit_type, credit.amount) else {
            return Ok(credit);
        };

        let refilled = tx.set_amount(&credit, amount, Some(now)).await?;
        tracing::info!(
            user_id = %user.id,
            credit_type = %credit.credit_type,
            previous = credit.amount,
            amount = refilled.amount,
            "Monthly credits refilled"
        );
        Ok(refilled)
    }

    /// Refill every quota-bearing row of a starter user that is due,
    /// creating missing rows at the quota. Returns `true` if anything changed.
    pub async fn refill_user(
        &self,
        tx: &mut dyn StoreTx,
        user: &User,
        now: OffsetDateTime,
    ) -> StoreResult<bool> {
        if user.tier != SubscriptionTier::Starter {
            return Ok(false);
        }

        let mut changed = false;
        for entry in self.policy.quotas() {
            let credit = match tx.find_credit(user.id, &entry.credit_type).await? {
                Some(credit) => credit,
                None => {
                    self.fetch_or_create(tx, user, &entry.credit_type, now)
                        .await?;
                    changed = true;
                    continue;
                }
            };
            let before = (credit.amount, credit.last_reset);
            let after = self.maybe_refill(tx, user, credit, now).await?;
            changed |= before != (after.amount, after.last_reset);
        }
        Ok(changed)
    }

    /// Overwrite the seeded credit types with `tier`'s allocation, as on
    /// subscription activation or a plan change.
    ///
    /// Top-up types are raised to their quota on starter and left alone on
    /// pro, so purchased pack credits survive.
    pub async fn seed_tier(
        &self,
        tx: &mut dyn StoreTx,
        user_id: UserId,
        tier: SubscriptionTier,
        now: OffsetDateTime,
    ) -> StoreResult<()> {
        if !tier.is_paid() {
            return Ok(());
        }

        for entry in self.policy.quotas() {
            let seeded = self
                .policy
                .seeded_types()
                .any(|credit_type| credit_type == &entry.credit_type);
            if !seeded && tier == SubscriptionTier::Pro {
                continue;
            }

            let target = self.policy.monthly_quota(tier, &entry.credit_type);
            match tx.find_credit(user_id, &entry.credit_type).await? {
                Some(credit) => {
                    let amount = if seeded {
                        target
                    } else {
                        credit.amount.max(target)
                    };
                    tx.set_amount(&credit, amount, Some(now)).await?;
                }
                None => {
                    tx.create_credit(user_id, &entry.credit_type, target, Some(now))
                        .await?;
                }
            }
        }

        tracing::info!(user_id = %user_id, tier = %tier, "Seeded tier credits");
        Ok(())
    }

    /// Zero the seeded credit types, used on downgrade when the policy does
    /// not preserve balances.
    pub async fn clear_seeded(&self, tx: &mut dyn StoreTx, user_id: UserId) -> StoreResult<()> {
        for credit_type in self.policy.seeded_types() {
            if let Some(credit) = tx.find_credit(user_id, credit_type).await? {
                tx.set_amount(&credit, 0, None).await?;
            }
        }
        Ok(())
    }
}
