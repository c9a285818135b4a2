//! Credit store abstraction
//!
//! All balance, tier and usage mutations go through a [`StoreTx`]. A
//! transaction is committed explicitly; dropping it without calling
//! [`StoreTx::commit`] rolls every write back.
//!
//! Two implementations ship with the crate:
//!
//! - [`PgCreditStore`]: PostgreSQL via sqlx, row locks with `SELECT ... FOR UPDATE`
//! - [`MemoryCreditStore`]: process-local, transactions serialized behind one lock

mod memory;
mod postgres;

pub use memory::MemoryCreditStore;
pub use postgres::PgCreditStore;

use async_trait::async_trait;
use revisume_shared::{
    Credit, CreditType, FeatureUsageLog, NewUser, SubscriptionTier, User, UserId,
};
use time::OffsetDateTime;

use crate::error::StoreResult;

#[async_trait]
pub trait CreditStore: Send + Sync {
    /// Open a transaction.
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>>;

    async fn find_user(&self, user_id: UserId) -> StoreResult<Option<User>>;

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    async fn find_credit(
        &self,
        user_id: UserId,
        credit_type: &CreditType,
    ) -> StoreResult<Option<Credit>>;

    async fn list_credits(&self, user_id: UserId) -> StoreResult<Vec<Credit>>;

    /// Usage history for a user, oldest first.
    async fn list_usage(&self, user_id: UserId) -> StoreResult<Vec<FeatureUsageLog>>;

    async fn list_users(&self) -> StoreResult<Vec<User>>;

    async fn list_user_ids_by_tier(&self, tier: SubscriptionTier) -> StoreResult<Vec<UserId>>;

    async fn list_all_credits(&self) -> StoreResult<Vec<Credit>>;
}

#[async_trait]
pub trait StoreTx: Send {
    /// Insert a user on the free tier with no billing identifiers.
    ///
    /// Fails with `DuplicateKey` when the email or username is taken.
    async fn insert_user(&mut self, user: &NewUser, created_at: OffsetDateTime) -> StoreResult<User>;

    /// Read a user without locking.
    async fn get_user(&mut self, user_id: UserId) -> StoreResult<Option<User>>;

    /// Read and lock a user row until commit.
    async fn user_for_update(&mut self, user_id: UserId) -> StoreResult<Option<User>>;

    async fn user_by_customer_id(&mut self, customer_id: &str) -> StoreResult<Option<User>>;

    async fn user_by_subscription_id(&mut self, subscription_id: &str)
        -> StoreResult<Option<User>>;

    async fn set_tier(&mut self, user_id: UserId, tier: SubscriptionTier) -> StoreResult<()>;

    /// Overwrite both billing identifiers; `None` clears a column.
    async fn bind_billing_ids(
        &mut self,
        user_id: UserId,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
    ) -> StoreResult<()>;

    /// Read and lock the credit row for `(user_id, credit_type)`.
    async fn find_credit(
        &mut self,
        user_id: UserId,
        credit_type: &CreditType,
    ) -> StoreResult<Option<Credit>>;

    /// Create the credit row for `(user_id, credit_type)`.
    ///
    /// Fails with `DuplicateKey` if a concurrent writer created it first; the
    /// transaction stays usable and the caller should re-read the row.
    async fn create_credit(
        &mut self,
        user_id: UserId,
        credit_type: &CreditType,
        amount: i32,
        last_reset: Option<OffsetDateTime>,
    ) -> StoreResult<Credit>;

    /// Add `delta` to the balance, rejecting results outside `0..=ceiling`.
    async fn update_amount(&mut self, credit: &Credit, delta: i32) -> StoreResult<Credit>;

    /// Set the balance to `amount`. `last_reset: None` leaves the timestamp unchanged.
    async fn set_amount(
        &mut self,
        credit: &Credit,
        amount: i32,
        last_reset: Option<OffsetDateTime>,
    ) -> StoreResult<Credit>;

    async fn append_usage(
        &mut self,
        user_id: UserId,
        feature_name: &str,
        credits_used: i32,
        at: OffsetDateTime,
    ) -> StoreResult<FeatureUsageLog>;

    /// Record a processed billing event. Returns `false` if the id was
    /// already recorded.
    async fn claim_event(
        &mut self,
        event_id: &str,
        event_type: &str,
        at: OffsetDateTime,
    ) -> StoreResult<bool>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

/// Validate a balance against `0..=ceiling` before it is written.
pub(crate) fn check_balance(
    credit: &Credit,
    delta: i32,
    ceiling: i32,
) -> StoreResult<i32> {
    use crate::error::StoreError;

    let next = credit.amount.checked_add(delta).ok_or(StoreError::CeilingExceeded {
        user_id: credit.user_id,
        credit_type: credit.credit_type.clone(),
        ceiling,
    })?;
    if next < 0 {
        return Err(StoreError::Underflow {
            user_id: credit.user_id,
            credit_type: credit.credit_type.clone(),
            amount: credit.amount,
            delta,
        });
    }
    if next > ceiling {
        return Err(StoreError::CeilingExceeded {
            user_id: credit.user_id,
            credit_type: credit.credit_type.clone(),
            ceiling,
        });
    }
    Ok(next)
}
