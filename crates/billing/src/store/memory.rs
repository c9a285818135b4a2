//! In-memory credit store
//!
//! Used for local development (`CREDIT_STORE=memory`) and throughout the
//! test suite. Transactions take an owned lock on the whole state and work
//! on a copy, so at most one transaction is in flight and a dropped
//! transaction leaves nothing behind.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use revisume_shared::{
    Credit, CreditType, FeatureUsageLog, NewUser, SubscriptionTier, User, UserId,
    PRO_UNLIMITED_CREDITS,
};
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{check_balance, CreditStore, StoreTx};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    last_user_id: i64,
    last_credit_id: i64,
    last_usage_id: i64,
    users: BTreeMap<UserId, User>,
    credits: HashMap<(UserId, CreditType), Credit>,
    usage: Vec<FeatureUsageLog>,
    events: HashMap<String, String>,
}

impl MemoryState {
    fn check_unique_user(&self, user: &NewUser) -> StoreResult<()> {
        for existing in self.users.values() {
            if existing.email == user.email {
                return Err(StoreError::DuplicateKey("users_email_key".to_string()));
            }
            if existing.username == user.username {
                return Err(StoreError::DuplicateKey("users_username_key".to_string()));
            }
        }
        Ok(())
    }

    fn check_unique_billing_ids(
        &self,
        user_id: UserId,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
    ) -> StoreResult<()> {
        for other in self.users.values().filter(|u| u.id != user_id) {
            if customer_id.is_some() && other.stripe_customer_id.as_deref() == customer_id {
                return Err(StoreError::DuplicateKey(
                    "users_stripe_customer_id_key".to_string(),
                ));
            }
            if subscription_id.is_some()
                && other.stripe_subscription_id.as_deref() == subscription_id
            {
                return Err(StoreError::DuplicateKey(
                    "users_stripe_subscription_id_key".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn user_mut(&mut self, user_id: UserId) -> StoreResult<&mut User> {
        self.users
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))
    }

    fn credit_mut(&mut self, credit: &Credit) -> StoreResult<&mut Credit> {
        self.credits
            .get_mut(&(credit.user_id, credit.credit_type.clone()))
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "credit {} for user {}",
                    credit.credit_type, credit.user_id
                ))
            })
    }
}

#[derive(Clone, Default)]
pub struct MemoryCreditStore {
    state: Arc<Mutex<MemoryState>>,
    fail_next_commit: Arc<AtomicBool>,
}

impl MemoryCreditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully specified user, bypassing registration.
    pub async fn seed_user(&self, user: User) {
        let mut state = self.state.lock().await;
        state.last_user_id = state.last_user_id.max(user.id.0);
        state.users.insert(user.id, user);
    }

    /// Insert or overwrite a credit row.
    pub async fn seed_credit(
        &self,
        user_id: UserId,
        credit_type: CreditType,
        amount: i32,
        last_reset: Option<OffsetDateTime>,
    ) -> Credit {
        let mut state = self.state.lock().await;
        let id = match state.credits.get(&(user_id, credit_type.clone())) {
            Some(existing) => existing.id,
            None => {
                state.last_credit_id += 1;
                state.last_credit_id
            }
        };
        let credit = Credit {
            id,
            user_id,
            credit_type: credit_type.clone(),
            amount,
            last_reset,
        };
        state.credits.insert((user_id, credit_type), credit.clone());
        credit
    }

    /// Make the next commit fail with a database error, leaving state untouched.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Number of recorded billing events.
    pub async fn processed_event_count(&self) -> usize {
        self.state.lock().await.events.len()
    }
}

#[async_trait]
impl CreditStore for MemoryCreditStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            working,
            fail_commit: Arc::clone(&self.fail_next_commit),
        }))
    }

    async fn find_user(&self, user_id: UserId) -> StoreResult<Option<User>> {
        Ok(self.state.lock().await.users.get(&user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        Ok(self
            .state
            .lock()
            .await
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn find_credit(
        &self,
        user_id: UserId,
        credit_type: &CreditType,
    ) -> StoreResult<Option<Credit>> {
        Ok(self
            .state
            .lock()
            .await
            .credits
            .get(&(user_id, credit_type.clone()))
            .cloned())
    }

    async fn list_credits(&self, user_id: UserId) -> StoreResult<Vec<Credit>> {
        let state = self.state.lock().await;
        let mut credits: Vec<Credit> = state
            .credits
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        credits.sort_by_key(|c| c.id);
        Ok(credits)
    }

    async fn list_usage(&self, user_id: UserId) -> StoreResult<Vec<FeatureUsageLog>> {
        Ok(self
            .state
            .lock()
            .await
            .usage
            .iter()
            .filter(|log| log.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_users(&self) -> StoreResult<Vec<User>> {
        Ok(self.state.lock().await.users.values().cloned().collect())
    }

    async fn list_user_ids_by_tier(&self, tier: SubscriptionTier) -> StoreResult<Vec<UserId>> {
        Ok(self
            .state
            .lock()
            .await
            .users
            .values()
            .filter(|u| u.tier == tier)
            .map(|u| u.id)
            .collect())
    }

    async fn list_all_credits(&self) -> StoreResult<Vec<Credit>> {
        let state = self.state.lock().await;
        let mut credits: Vec<Credit> = state.credits.values().cloned().collect();
        credits.sort_by_key(|c| c.id);
        Ok(credits)
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    fail_commit: Arc<AtomicBool>,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn insert_user(&mut self, user: &NewUser, created_at: OffsetDateTime) -> StoreResult<User> {
        self.working.check_unique_user(user)?;
        self.working.last_user_id += 1;
        let created = User {
            id: UserId(self.working.last_user_id),
            email: user.email.clone(),
            username: user.username.clone(),
            password_hash: user.password_hash.clone(),
            tier: SubscriptionTier::Free,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            created_at,
        };
        self.working.users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_user(&mut self, user_id: UserId) -> StoreResult<Option<User>> {
        Ok(self.working.users.get(&user_id).cloned())
    }

    async fn user_for_update(&mut self, user_id: UserId) -> StoreResult<Option<User>> {
        Ok(self.working.users.get(&user_id).cloned())
    }

    async fn user_by_customer_id(&mut self, customer_id: &str) -> StoreResult<Option<User>> {
        Ok(self
            .working
            .users
            .values()
            .find(|u| u.stripe_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn user_by_subscription_id(
        &mut self,
        subscription_id: &str,
    ) -> StoreResult<Option<User>> {
        Ok(self
            .working
            .users
            .values()
            .find(|u| u.stripe_subscription_id.as_deref() == Some(subscription_id))
            .cloned())
    }

    async fn set_tier(&mut self, user_id: UserId, tier: SubscriptionTier) -> StoreResult<()> {
        self.working.user_mut(user_id)?.tier = tier;
        Ok(())
    }

    async fn bind_billing_ids(
        &mut self,
        user_id: UserId,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
    ) -> StoreResult<()> {
        self.working
            .check_unique_billing_ids(user_id, customer_id, subscription_id)?;
        let user = self.working.user_mut(user_id)?;
        user.stripe_customer_id = customer_id.map(str::to_string);
        user.stripe_subscription_id = subscription_id.map(str::to_string);
        Ok(())
    }

    async fn find_credit(
        &mut self,
        user_id: UserId,
        credit_type: &CreditType,
    ) -> StoreResult<Option<Credit>> {
        Ok(self
            .working
            .credits
            .get(&(user_id, credit_type.clone()))
            .cloned())
    }

    async fn create_credit(
        &mut self,
        user_id: UserId,
        credit_type: &CreditType,
        amount: i32,
        last_reset: Option<OffsetDateTime>,
    ) -> StoreResult<Credit> {
        if !self.working.users.contains_key(&user_id) {
            return Err(StoreError::NotFound(format!("user {}", user_id)));
        }
        let key = (user_id, credit_type.clone());
        if self.working.credits.contains_key(&key) {
            return Err(StoreError::DuplicateKey("uq_user_credit_type".to_string()));
        }
        self.working.last_credit_id += 1;
        let credit = Credit {
            id: self.working.last_credit_id,
            user_id,
            credit_type: credit_type.clone(),
            amount: 0,
            last_reset,
        };
        let amount = check_balance(&credit, amount, PRO_UNLIMITED_CREDITS)?;
        let credit = Credit { amount, ..credit };
        self.working.credits.insert(key, credit.clone());
        Ok(credit)
    }

    async fn update_amount(&mut self, credit: &Credit, delta: i32) -> StoreResult<Credit> {
        let row = self.working.credit_mut(credit)?;
        row.amount = check_balance(row, delta, PRO_UNLIMITED_CREDITS)?;
        Ok(row.clone())
    }

    async fn set_amount(
        &mut self,
        credit: &Credit,
        amount: i32,
        last_reset: Option<OffsetDateTime>,
    ) -> StoreResult<Credit> {
        let row = self.working.credit_mut(credit)?;
        let zeroed = Credit { amount: 0, ..row.clone() };
        row.amount = check_balance(&zeroed, amount, PRO_UNLIMITED_CREDITS)?;
        if last_reset.is_some() {
            row.last_reset = last_reset;
        }
        Ok(row.clone())
    }

    async fn append_usage(
        &mut self,
        user_id: UserId,
        feature_name: &str,
        credits_used: i32,
        at: OffsetDateTime,
    ) -> StoreResult<FeatureUsageLog> {
        if credits_used < 0 {
            return Err(StoreError::Database(
                "feature_usage_logs.credits_used must be non-negative".to_string(),
            ));
        }
        self.working.last_usage_id += 1;
        let log = FeatureUsageLog {
            id: self.working.last_usage_id,
            user_id,
            feature_name: feature_name.to_string(),
            credits_used,
            timestamp: at,
        };
        self.working.usage.push(log.clone());
        Ok(log)
    }

    async fn claim_event(
        &mut self,
        event_id: &str,
        event_type: &str,
        _at: OffsetDateTime,
    ) -> StoreResult<bool> {
        if self.working.events.contains_key(event_id) {
            return Ok(false);
        }
        self.working
            .events
            .insert(event_id.to_string(), event_type.to_string());
        Ok(true)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTx {
            mut guard,
            working,
            fail_commit,
        } = *self;
        if fail_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Database("commit failed".to_string()));
        }
        *guard = working;
        Ok(())
    }
}
