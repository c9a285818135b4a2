//! Credit and billing invariants
//!
//! Runnable consistency checks over users and credit balances. They only
//! read, so they can run after a webhook replay, from the worker, or
//! against a production snapshot.
//!
//! ## Checks
//!
//! 1. **non_negative_balance**: no credit row below zero
//! 2. **balance_within_ceiling**: no credit row above the unlimited sentinel
//! 3. **paid_tier_has_subscription**: starter/pro users carry a subscription id
//! 4. **subscription_has_customer**: a subscription id implies a customer id
//! 5. **starter_refill_current**: starter quota rows were refilled this month

use std::collections::HashMap;
use std::sync::Arc;

use revisume_shared::{Credit, SubscriptionTier, User, UserId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::clock::Clock;
use crate::error::BillingResult;
use crate::policy::TierPolicy;
use crate::quota::is_refill_due;
use crate::store::CreditStore;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Users affected
    pub user_ids: Vec<UserId>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Balances are wrong
    Critical,
    /// Billing linkage is inconsistent
    High,
    Medium,
    /// Expected transiently, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    /// No violation above [`ViolationSeverity::Low`]
    pub healthy: bool,
}

const CHECKS_RUN: usize = 5;

/// Service for running invariant checks
pub struct InvariantChecker {
    store: Arc<dyn CreditStore>,
    policy: Arc<TierPolicy>,
    clock: Arc<dyn Clock>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn CreditStore>, policy: Arc<TierPolicy>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy,
            clock,
        }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let users = self.store.list_users().await?;
        let credits = self.store.list_all_credits().await?;
        Ok(check_all(
            &users,
            &credits,
            &self.policy,
            self.clock.now_utc(),
        ))
    }
}

/// Evaluate every invariant over a snapshot.
pub fn check_all(
    users: &[User],
    credits: &[Credit],
    policy: &TierPolicy,
    now: OffsetDateTime,
) -> InvariantCheckSummary {
    let mut violations = Vec::new();
    violations.extend(check_non_negative_balance(credits));
    violations.extend(check_balance_within_ceiling(credits, policy));
    violations.extend(check_paid_tier_has_subscription(users));
    violations.extend(check_subscription_has_customer(users));
    violations.extend(check_starter_refill_current(users, credits, policy, now));

    let checks_failed = violations
        .iter()
        .map(|v| &v.invariant)
        .collect::<std::collections::HashSet<_>>()
        .len();

    InvariantCheckSummary {
        checked_at: now,
        checks_run: CHECKS_RUN,
        checks_passed: CHECKS_RUN - checks_failed,
        checks_failed,
        healthy: violations
            .iter()
            .all(|v| v.severity == ViolationSeverity::Low),
        violations,
    }
}

fn check_non_negative_balance(credits: &[Credit]) -> Vec<InvariantViolation> {
    credits
        .iter()
        .filter(|c| c.amount < 0)
        .map(|c| InvariantViolation {
            invariant: "non_negative_balance".to_string(),
            user_ids: vec![c.user_id],
            description: format!("Credit '{}' has negative balance {}", c.credit_type, c.amount),
            context: serde_json::json!({
                "credit_id": c.id,
                "credit_type": c.credit_type,
                "amount": c.amount,
            }),
            severity: ViolationSeverity::Critical,
        })
        .collect()
}

fn check_balance_within_ceiling(credits: &[Credit], policy: &TierPolicy) -> Vec<InvariantViolation> {
    credits
        .iter()
        .filter(|c| c.amount > policy.unlimited())
        .map(|c| InvariantViolation {
            invariant: "balance_within_ceiling".to_string(),
            user_ids: vec![c.user_id],
            description: format!(
                "Credit '{}' balance {} exceeds ceiling {}",
                c.credit_type,
                c.amount,
                policy.unlimited()
            ),
            context: serde_json::json!({
                "credit_id": c.id,
                "credit_type": c.credit_type,
                "amount": c.amount,
            }),
            severity: ViolationSeverity::Critical,
        })
        .collect()
}

fn check_paid_tier_has_subscription(users: &[User]) -> Vec<InvariantViolation> {
    users
        .iter()
        .filter(|u| u.tier.is_paid() && u.stripe_subscription_id.is_none())
        .map(|u| InvariantViolation {
            invariant: "paid_tier_has_subscription".to_string(),
            user_ids: vec![u.id],
            description: format!("User on tier '{}' has no subscription id", u.tier),
            context: serde_json::json!({
                "tier": u.tier,
                "stripe_customer_id": u.stripe_customer_id,
            }),
            severity: ViolationSeverity::High,
        })
        .collect()
}

fn check_subscription_has_customer(users: &[User]) -> Vec<InvariantViolation> {
    users
        .iter()
        .filter(|u| u.stripe_subscription_id.is_some() && u.stripe_customer_id.is_none())
        .map(|u| InvariantViolation {
            invariant: "subscription_has_customer".to_string(),
            user_ids: vec![u.id],
            description: "Subscription id bound without a customer id".to_string(),
            context: serde_json::json!({
                "stripe_subscription_id": u.stripe_subscription_id,
            }),
            severity: ViolationSeverity::Medium,
        })
        .collect()
}

/// Lazy refills make stale rows legitimate until the next read, so this is
/// informational unless the worker sweep has already run for the month.
fn check_starter_refill_current(
    users: &[User],
    credits: &[Credit],
    policy: &TierPolicy,
    now: OffsetDateTime,
) -> Vec<InvariantViolation> {
    let starters: HashMap<UserId, &User> = users
        .iter()
        .filter(|u| u.tier == SubscriptionTier::Starter)
        .map(|u| (u.id, u))
        .collect();

    let mut stale: HashMap<UserId, Vec<String>> = HashMap::new();
    for credit in credits.iter().filter(|c| {
        starters.contains_key(&c.user_id)
            && policy.is_refillable(&c.credit_type)
            && is_refill_due(c.last_reset, now)
    }) {
        stale
            .entry(credit.user_id)
            .or_default()
            .push(credit.credit_type.to_string());
    }

    let mut violations: Vec<InvariantViolation> = stale
        .into_iter()
        .map(|(user_id, credit_types)| InvariantViolation {
            invariant: "starter_refill_current".to_string(),
            user_ids: vec![user_id],
            description: format!(
                "{} quota row(s) not refilled this month",
                credit_types.len()
            ),
            context: serde_json::json!({ "credit_types": credit_types }),
            severity: ViolationSeverity::Low,
        })
        .collect();
    violations.sort_by_key(|v| v.user_ids.first().copied());
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use revisume_shared::{CreditType, PRO_UNLIMITED_CREDITS};
    use time::macros::datetime;

    fn user(id: i64, tier: SubscriptionTier, customer: Option<&str>, sub: Option<&str>) -> User {
        User {
            id: UserId(id),
            email: format!("u{}@example.com", id),
            username: format!("u{}", id),
            password_hash: String::new(),
            tier,
            stripe_customer_id: customer.map(str::to_string),
            stripe_subscription_id: sub.map(str::to_string),
            created_at: datetime!(2024-01-01 0:00 UTC),
        }
    }

    fn credit(id: i64, user_id: i64, credit_type: CreditType, amount: i32, last_reset: Option<OffsetDateTime>) -> Credit {
        Credit {
            id,
            user_id: UserId(user_id),
            credit_type,
            amount,
            last_reset,
        }
    }

    #[test]
    fn test_healthy_snapshot() {
        let now = datetime!(2024-03-10 0:00 UTC);
        let users = vec![
            user(1, SubscriptionTier::Free, None, None),
            user(2, SubscriptionTier::Starter, Some("cus_2"), Some("sub_2")),
        ];
        let credits = vec![
            credit(1, 1, CreditType::Legacy, 2, None),
            credit(2, 2, CreditType::ResumeAi, 10, Some(datetime!(2024-03-01 0:00 UTC))),
        ];
        let summary = check_all(&users, &credits, &TierPolicy::default(), now);
        assert!(summary.healthy);
        assert!(summary.violations.is_empty());
        assert_eq!(summary.checks_passed, 5);
    }

    #[test]
    fn test_balance_violations() {
        let credits = vec![
            credit(1, 1, CreditType::Legacy, -1, None),
            credit(2, 1, CreditType::Pack, PRO_UNLIMITED_CREDITS + 1, None),
        ];
        let summary = check_all(&[], &credits, &TierPolicy::default(), datetime!(2024-03-10 0:00 UTC));
        assert!(!summary.healthy);
        assert_eq!(summary.checks_failed, 2);
        assert!(summary
            .violations
            .iter()
            .all(|v| v.severity == ViolationSeverity::Critical));
    }

    #[test]
    fn test_linkage_violations() {
        let users = vec![
            user(1, SubscriptionTier::Pro, Some("cus_1"), None),
            user(2, SubscriptionTier::Free, None, Some("sub_2")),
        ];
        let summary = check_all(&users, &[], &TierPolicy::default(), datetime!(2024-03-10 0:00 UTC));
        let names: Vec<_> = summary.violations.iter().map(|v| v.invariant.as_str()).collect();
        assert!(names.contains(&"paid_tier_has_subscription"));
        assert!(names.contains(&"subscription_has_customer"));
    }

    #[test]
    fn test_stale_starter_rows_are_low_severity() {
        let users = vec![user(3, SubscriptionTier::Starter, Some("cus_3"), Some("sub_3"))];
        let credits = vec![
            credit(1, 3, CreditType::ResumeAi, 0, Some(datetime!(2024-02-10 0:00 UTC))),
            credit(2, 3, CreditType::Pack, 4, Some(datetime!(2023-01-01 0:00 UTC))),
        ];
        let summary = check_all(&users, &credits, &TierPolicy::default(), datetime!(2024-03-10 0:00 UTC));
        assert_eq!(summary.violations.len(), 1);
        assert_eq!(summary.violations[0].invariant, "starter_refill_current");
        assert_eq!(summary.violations[0].severity, ViolationSeverity::Low);
        assert!(summary.healthy);
    }

    #[test]
    fn test_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }
}
