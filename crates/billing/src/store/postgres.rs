//! PostgreSQL credit store

use async_trait::async_trait;
use revisume_shared::{
    Credit, CreditType, FeatureUsageLog, NewUser, SubscriptionTier, User, UserId,
    PRO_UNLIMITED_CREDITS,
};
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;

use super::{check_balance, CreditStore, StoreTx};
use crate::error::{StoreError, StoreResult};

const USER_COLUMNS: &str = "id, email, username, password_hash, tier, stripe_customer_id, \
                            stripe_subscription_id, created_at";
const CREDIT_COLUMNS: &str = "id, user_id, credit_type, amount, last_reset";
const USAGE_COLUMNS: &str = "id, user_id, feature_name, credits_used, timestamp";

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: i64,
    email: String,
    username: String,
    password_hash: String,
    tier: String,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    created_at: OffsetDateTime,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let tier = row.tier.parse::<SubscriptionTier>().map_err(StoreError::Database)?;
        Ok(User {
            id: UserId(row.id),
            email: row.email,
            username: row.username,
            password_hash: row.password_hash,
            tier,
            stripe_customer_id: row.stripe_customer_id,
            stripe_subscription_id: row.stripe_subscription_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CreditRow {
    id: i64,
    user_id: i64,
    credit_type: String,
    amount: i32,
    last_reset: Option<OffsetDateTime>,
}

impl From<CreditRow> for Credit {
    fn from(row: CreditRow) -> Self {
        Credit {
            id: row.id,
            user_id: UserId(row.user_id),
            credit_type: CreditType::from(row.credit_type),
            amount: row.amount,
            last_reset: row.last_reset,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UsageRow {
    id: i64,
    user_id: i64,
    feature_name: String,
    credits_used: i32,
    timestamp: OffsetDateTime,
}

impl From<UsageRow> for FeatureUsageLog {
    fn from(row: UsageRow) -> Self {
        FeatureUsageLog {
            id: row.id,
            user_id: UserId(row.user_id),
            feature_name: row.feature_name,
            credits_used: row.credits_used,
            timestamp: row.timestamp,
        }
    }
}

fn into_user(row: Option<UserRow>) -> StoreResult<Option<User>> {
    row.map(User::try_from).transpose()
}

#[derive(Clone)]
pub struct PgCreditStore {
    pool: PgPool,
}

impl PgCreditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CreditStore for PgCreditStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTx { tx }))
    }

    async fn find_user(&self, user_id: UserId) -> StoreResult<Option<User>> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS))
                .bind(user_id.0)
                .fetch_optional(&self.pool)
                .await?;
        into_user(row)
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as(&format!(
            "SELECT {} FROM users WHERE email = $1",
            USER_COLUMNS
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        into_user(row)
    }

    async fn find_credit(
        &self,
        user_id: UserId,
        credit_type: &CreditType,
    ) -> StoreResult<Option<Credit>> {
        let row: Option<CreditRow> = sqlx::query_as(&format!(
            "SELECT {} FROM credits WHERE user_id = $1 AND credit_type = $2",
            CREDIT_COLUMNS
        ))
        .bind(user_id.0)
        .bind(credit_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Credit::from))
    }

    async fn list_credits(&self, user_id: UserId) -> StoreResult<Vec<Credit>> {
        let rows: Vec<CreditRow> = sqlx::query_as(&format!(
            "SELECT {} FROM credits WHERE user_id = $1 ORDER BY id",
            CREDIT_COLUMNS
        ))
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Credit::from).collect())
    }

    async fn list_usage(&self, user_id: UserId) -> StoreResult<Vec<FeatureUsageLog>> {
        let rows: Vec<UsageRow> = sqlx::query_as(&format!(
            "SELECT {} FROM feature_usage_logs WHERE user_id = $1 ORDER BY timestamp, id",
            USAGE_COLUMNS
        ))
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeatureUsageLog::from).collect())
    }

    async fn list_users(&self) -> StoreResult<Vec<User>> {
        let rows: Vec<UserRow> =
            sqlx::query_as(&format!("SELECT {} FROM users ORDER BY id", USER_COLUMNS))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(User::try_from).collect()
    }

    async fn list_user_ids_by_tier(&self, tier: SubscriptionTier) -> StoreResult<Vec<UserId>> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM users WHERE tier = $1 ORDER BY id")
            .bind(tier.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| UserId(id)).collect())
    }

    async fn list_all_credits(&self) -> StoreResult<Vec<Credit>> {
        let rows: Vec<CreditRow> =
            sqlx::query_as(&format!("SELECT {} FROM credits ORDER BY id", CREDIT_COLUMNS))
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Credit::from).collect())
    }
}

struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn insert_user(&mut self, user: &NewUser, created_at: OffsetDateTime) -> StoreResult<User> {
        let row: UserRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO users (email, username, password_hash, tier, created_at, updated_at)
            VALUES ($1, $2, $3, 'free', $4, $4)
            RETURNING {}
            "#,
            USER_COLUMNS
        ))
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(created_at)
        .fetch_one(&mut *self.tx)
        .await?;
        User::try_from(row)
    }

    async fn get_user(&mut self, user_id: UserId) -> StoreResult<Option<User>> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS))
                .bind(user_id.0)
                .fetch_optional(&mut *self.tx)
                .await?;
        into_user(row)
    }

    async fn user_for_update(&mut self, user_id: UserId) -> StoreResult<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as(&format!(
            "SELECT {} FROM users WHERE id = $1 FOR UPDATE",
            USER_COLUMNS
        ))
        .bind(user_id.0)
        .fetch_optional(&mut *self.tx)
        .await?;
        into_user(row)
    }

    async fn user_by_customer_id(&mut self, customer_id: &str) -> StoreResult<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as(&format!(
            "SELECT {} FROM users WHERE stripe_customer_id = $1 FOR UPDATE",
            USER_COLUMNS
        ))
        .bind(customer_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        into_user(row)
    }

    async fn user_by_subscription_id(
        &mut self,
        subscription_id: &str,
    ) -> StoreResult<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as(&format!(
            "SELECT {} FROM users WHERE stripe_subscription_id = $1 FOR UPDATE",
            USER_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        into_user(row)
    }

    async fn set_tier(&mut self, user_id: UserId, tier: SubscriptionTier) -> StoreResult<()> {
        let result = sqlx::query("UPDATE users SET tier = $1, updated_at = NOW() WHERE id = $2")
            .bind(tier.as_str())
            .bind(user_id.0)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {}", user_id)));
        }
        Ok(())
    }

    async fn bind_billing_ids(
        &mut self,
        user_id: UserId,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET stripe_customer_id = $1, stripe_subscription_id = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(customer_id)
        .bind(subscription_id)
        .bind(user_id.0)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {}", user_id)));
        }
        Ok(())
    }

    async fn find_credit(
        &mut self,
        user_id: UserId,
        credit_type: &CreditType,
    ) -> StoreResult<Option<Credit>> {
        let row: Option<CreditRow> = sqlx::query_as(&format!(
            "SELECT {} FROM credits WHERE user_id = $1 AND credit_type = $2 FOR UPDATE",
            CREDIT_COLUMNS
        ))
        .bind(user_id.0)
        .bind(credit_type.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(Credit::from))
    }

    async fn create_credit(
        &mut self,
        user_id: UserId,
        credit_type: &CreditType,
        amount: i32,
        last_reset: Option<OffsetDateTime>,
    ) -> StoreResult<Credit> {
        let empty = Credit {
            id: 0,
            user_id,
            credit_type: credit_type.clone(),
            amount: 0,
            last_reset,
        };
        let amount = check_balance(&empty, amount, PRO_UNLIMITED_CREDITS)?;

        // ON CONFLICT keeps the transaction usable when a concurrent writer wins
        let row: Option<CreditRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO credits (user_id, credit_type, amount, last_reset)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, credit_type) DO NOTHING
            RETURNING {}
            "#,
            CREDIT_COLUMNS
        ))
        .bind(user_id.0)
        .bind(credit_type.as_str())
        .bind(amount)
        .bind(last_reset)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(Credit::from)
            .ok_or_else(|| StoreError::DuplicateKey("uq_user_credit_type".to_string()))
    }

    async fn update_amount(&mut self, credit: &Credit, delta: i32) -> StoreResult<Credit> {
        check_balance(credit, delta, PRO_UNLIMITED_CREDITS)?;
        let row: Option<CreditRow> = sqlx::query_as(&format!(
            r#"
            UPDATE credits SET amount = amount + $1
            WHERE id = $2 AND amount + $1 >= 0 AND amount + $1 <= $3
            RETURNING {}
            "#,
            CREDIT_COLUMNS
        ))
        .bind(delta)
        .bind(credit.id)
        .bind(PRO_UNLIMITED_CREDITS)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(Credit::from).ok_or_else(|| StoreError::Underflow {
            user_id: credit.user_id,
            credit_type: credit.credit_type.clone(),
            amount: credit.amount,
            delta,
        })
    }

    async fn set_amount(
        &mut self,
        credit: &Credit,
        amount: i32,
        last_reset: Option<OffsetDateTime>,
    ) -> StoreResult<Credit> {
        let zeroed = Credit {
            amount: 0,
            ..credit.clone()
        };
        let amount = check_balance(&zeroed, amount, PRO_UNLIMITED_CREDITS)?;
        let row: Option<CreditRow> = sqlx::query_as(&format!(
            r#"
            UPDATE credits SET amount = $1, last_reset = COALESCE($2, last_reset)
            WHERE id = $3
            RETURNING {}
            "#,
            CREDIT_COLUMNS
        ))
        .bind(amount)
        .bind(last_reset)
        .bind(credit.id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(Credit::from).ok_or_else(|| {
            StoreError::NotFound(format!("credit {} for user {}", credit.credit_type, credit.user_id))
        })
    }

    async fn append_usage(
        &mut self,
        user_id: UserId,
        feature_name: &str,
        credits_used: i32,
        at: OffsetDateTime,
    ) -> StoreResult<FeatureUsageLog> {
        let row: UsageRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO feature_usage_logs (user_id, feature_name, credits_used, timestamp)
            VALUES ($1, $2, $3, $4)
            RETURNING {}
            "#,
            USAGE_COLUMNS
        ))
        .bind(user_id.0)
        .bind(feature_name)
        .bind(credits_used)
        .bind(at)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(FeatureUsageLog::from(row))
    }

    async fn claim_event(
        &mut self,
        event_id: &str,
        event_type: &str,
        at: OffsetDateTime,
    ) -> StoreResult<bool> {
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_events (event_id, event_type, processed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(at)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(claimed.is_some())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    //! Require a live database: `DATABASE_URL=... cargo test -- --ignored`

    use super::*;

    async fn store() -> PgCreditStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = revisume_shared::create_pool(&url).await.unwrap();
        revisume_shared::run_migrations(&pool).await.unwrap();
        PgCreditStore::new(pool)
    }

    fn unique_user() -> NewUser {
        let suffix = OffsetDateTime::now_utc().unix_timestamp_nanos();
        NewUser {
            email: format!("pg-{}@example.com", suffix),
            username: format!("pg-{}", suffix),
            password_hash: "hash".to_string(),
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_credit_round_trip() {
        let store = store().await;
        let mut tx = store.begin().await.unwrap();
        let user = tx
            .insert_user(&unique_user(), OffsetDateTime::now_utc())
            .await
            .unwrap();
        let credit = tx
            .create_credit(user.id, &CreditType::Legacy, 2, None)
            .await
            .unwrap();
        let dup = tx
            .create_credit(user.id, &CreditType::Legacy, 2, None)
            .await
            .unwrap_err();
        assert!(matches!(dup, StoreError::DuplicateKey(_)));

        let credit = tx.update_amount(&credit, 5).await.unwrap();
        assert_eq!(credit.amount, 7);
        let err = tx.update_amount(&credit, -8).await.unwrap_err();
        assert!(matches!(err, StoreError::Underflow { .. }));
        tx.commit().await.unwrap();

        let stored = store
            .find_credit(user.id, &CreditType::Legacy)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.amount, 7);
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_claim_event_is_idempotent() {
        let store = store().await;
        let event_id = format!("evt_{}", OffsetDateTime::now_utc().unix_timestamp_nanos());

        let mut tx = store.begin().await.unwrap();
        assert!(tx
            .claim_event(&event_id, "invoice.paid", OffsetDateTime::now_utc())
            .await
            .unwrap());
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(!tx
            .claim_event(&event_id, "invoice.paid", OffsetDateTime::now_utc())
            .await
            .unwrap());
    }
}
