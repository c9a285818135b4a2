// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Revisume Background Worker
//!
//! Handles scheduled jobs including:
//! - Starter monthly credit refill sweep (daily at 00:05 UTC)
//! - Credit invariant checks (hourly)
//! - Heartbeat (every 5 minutes)

mod jobs;

use std::sync::Arc;
use std::time::Duration;

use revisume_billing::{CreditEngine, PgCreditStore, SystemClock, TierPolicy};
use revisume_shared::{create_pool, run_migrations};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Revisume Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    if std::env::var("RUN_MIGRATIONS").is_ok_and(|v| v == "true" || v == "1") {
        run_migrations(&pool).await?;
        info!("Database migrations applied");
    }

    let engine = CreditEngine::new(
        Arc::new(PgCreditStore::new(pool)),
        TierPolicy::from_env(),
        Arc::new(SystemClock),
    );

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Starter refill sweep
    // Cron: 00:05 UTC daily, shortly after the month boundary on the 1st
    let refill_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 5 0 * * *", move |_uuid, _l| {
            let engine = refill_engine.clone();
            Box::pin(async move {
                info!("Running starter refill sweep");
                if let Err(e) = jobs::refill_starter_credits(&engine).await {
                    error!(error = %e, "Starter refill sweep failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Starter refill sweep (daily at 00:05 UTC)");

    // Job 2: Invariant checks (hourly)
    let invariant_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let engine = invariant_engine.clone();
            Box::pin(async move {
                if let Err(e) = jobs::check_invariants(&engine).await {
                    error!(error = %e, "Invariant check failed to run");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Credit invariant checks (hourly)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Catch up immediately in case the worker was down over a month boundary
    if let Err(e) = jobs::refill_starter_credits(&engine).await {
        error!(error = %e, "Startup refill sweep failed");
    }

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Revisume Worker started successfully with {} scheduled jobs", 3);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
