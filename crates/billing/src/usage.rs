//! Feature usage log
//!
//! Append-only. Every successful consumption writes exactly one row in the
//! same transaction as the balance change; rejected consumptions write none.

use std::collections::BTreeMap;
use std::sync::Arc;

use revisume_shared::{FeatureUsageLog, UserId};
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult, StoreResult};
use crate::store::{CreditStore, StoreTx};

/// Aggregated usage for one feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureUsageSummary {
    pub feature_name: String,
    pub invocations: u64,
    pub credits_used: i64,
}

#[derive(Clone)]
pub struct UsageLog {
    store: Arc<dyn CreditStore>,
}

impl UsageLog {
    pub fn new(store: Arc<dyn CreditStore>) -> Self {
        Self { store }
    }

    /// Append an entry inside an open transaction.
    pub async fn record_in(
        tx: &mut dyn StoreTx,
        user_id: UserId,
        feature_name: &str,
        credits_used: i32,
        at: OffsetDateTime,
    ) -> StoreResult<FeatureUsageLog> {
        let log = tx.append_usage(user_id, feature_name, credits_used, at).await?;
        tracing::debug!(
            user_id = %user_id,
            feature = %feature_name,
            credits_used = credits_used,
            "Feature usage recorded"
        );
        Ok(log)
    }

    /// Append an entry in its own transaction.
    pub async fn record(
        &self,
        user_id: UserId,
        feature_name: &str,
        credits_used: i32,
        at: OffsetDateTime,
    ) -> BillingResult<FeatureUsageLog> {
        if credits_used < 0 {
            return Err(BillingError::InvalidInput(format!(
                "credits_used must be non-negative, got {}",
                credits_used
            )));
        }
        let mut tx = self.store.begin().await?;
        let log = Self::record_in(&mut *tx, user_id, feature_name, credits_used, at).await?;
        tx.commit().await?;
        Ok(log)
    }

    /// Full usage history for a user, oldest first.
    pub async fn history(&self, user_id: UserId) -> BillingResult<Vec<FeatureUsageLog>> {
        Ok(self.store.list_usage(user_id).await?)
    }

    /// Per-feature totals for a user, optionally limited to entries at or after `since`.
    pub async fn summarize(
        &self,
        user_id: UserId,
        since: Option<OffsetDateTime>,
    ) -> BillingResult<Vec<FeatureUsageSummary>> {
        let history = self.history(user_id).await?;
        Ok(summarize_logs(&history, since))
    }
}

fn summarize_logs(
    logs: &[FeatureUsageLog],
    since: Option<OffsetDateTime>,
) -> Vec<FeatureUsageSummary> {
    let mut totals: BTreeMap<&str, (u64, i64)> = BTreeMap::new();
    for log in logs
        .iter()
        .filter(|log| since.map_or(true, |since| log.timestamp >= since))
    {
        let entry = totals.entry(log.feature_name.as_str()).or_default();
        entry.0 += 1;
        entry.1 += i64::from(log.credits_used);
    }
    totals
        .into_iter()
        .map(|(feature_name, (invocations, credits_used))| FeatureUsageSummary {
            feature_name: feature_name.to_string(),
            invocations,
            credits_used,
        })
        .collect()
}
