//! Scheduled job bodies
//!
//! Kept apart from the scheduler wiring so they can be driven directly
//! against an in-memory store.

use revisume_billing::{CreditEngine, InvariantCheckSummary, ViolationSeverity};
use revisume_shared::SubscriptionTier;
use tracing::{error, info, warn};

/// Outcome of one starter refill sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefillSweep {
    pub starter_users: usize,
    pub refilled: usize,
}

/// Refill every starter user whose quota rows are due.
///
/// Consumption already refills lazily; the sweep makes balances read
/// correctly for users who have not touched a metered feature this month.
/// Per-user failures are logged by the credit service and roll back only
/// that user.
pub async fn refill_starter_credits(engine: &CreditEngine) -> anyhow::Result<RefillSweep> {
    let user_ids = engine
        .store()
        .list_user_ids_by_tier(SubscriptionTier::Starter)
        .await?;

    let mut sweep = RefillSweep {
        starter_users: user_ids.len(),
        refilled: 0,
    };
    for user_id in user_ids {
        if engine.credits.reset_monthly_credits_for_user(user_id).await {
            sweep.refilled += 1;
        }
    }

    info!(
        starter_users = sweep.starter_users,
        refilled = sweep.refilled,
        "Starter refill sweep complete"
    );
    Ok(sweep)
}

/// Run the credit invariant checks and log each violation at a level
/// matching its severity.
pub async fn check_invariants(engine: &CreditEngine) -> anyhow::Result<InvariantCheckSummary> {
    let summary = engine.invariants.run_all_checks().await?;

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                users = ?violation.user_ids,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                users = ?violation.user_ids,
                "{}",
                violation.description
            ),
        }
    }

    info!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        healthy = summary.healthy,
        "Invariant check complete"
    );
    Ok(summary)
}
