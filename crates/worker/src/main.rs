//! BotForge Background Worker
//!
//! Handles scheduled jobs including:
//! - Subscription lifecycle sweep: grace entry and expiry (hourly)
//! - Expired entitlement cleanup (hourly at :30)
//! - Payment ledger reconciliation (daily at 3:15 UTC)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use botforge_billing::{Actor, BillingService, EntitlementSource, TransitionAction};
use botforge_shared::create_pool;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Reconciliation looks this many days back on each run
const RECONCILE_WINDOW_DAYS: i64 = 7;

/// Move lapsed subscriptions into grace and expire elapsed ones
///
/// Per-user failures are logged and counted; one bad row never stops the
/// sweep.
async fn run_lifecycle_sweep(billing: &BillingService) {
    let now = OffsetDateTime::now_utc();

    let mut entered_grace = 0;
    let mut expired = 0;
    let mut errors = 0;

    match billing.subscriptions.list_lapsed_active(now).await {
        Ok(lapsed) => {
            for sub in lapsed {
                match billing
                    .subscriptions
                    .transition(sub.user_id, TransitionAction::EnterGrace, Actor::System)
                    .await
                {
                    Ok(t) if t.changed => entered_grace += 1,
                    Ok(_) => {}
                    Err(e) => {
                        error!(user_id = %sub.user_id, error = %e, "Failed to enter grace");
                        errors += 1;
                    }
                }
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to list lapsed subscriptions");
            errors += 1;
        }
    }

    match billing.subscriptions.list_grace_elapsed(now).await {
        Ok(elapsed) => {
            for sub in elapsed {
                match billing
                    .subscriptions
                    .transition(sub.user_id, TransitionAction::Expire, Actor::System)
                    .await
                {
                    Ok(t) if t.changed => {
                        expired += 1;
                        // Expiry itself carries no entitlement effect; the
                        // sweep revokes the plan's grants here.
                        if let Err(e) = billing
                            .entitlements
                            .revoke_entitlements(sub.user_id, Some(EntitlementSource::PlanIncluded))
                            .await
                        {
                            error!(
                                user_id = %sub.user_id,
                                error = %e,
                                "Failed to revoke plan entitlements after expiry"
                            );
                            errors += 1;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(user_id = %sub.user_id, error = %e, "Failed to expire subscription");
                        errors += 1;
                    }
                }
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to list elapsed grace subscriptions");
            errors += 1;
        }
    }

    info!(
        entered_grace = entered_grace,
        expired = expired,
        errors = errors,
        "Subscription lifecycle sweep complete"
    );
}

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

    info!("Starting BotForge Worker");

    // Create database pool
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;

    botforge_billing::ensure_schema(&pool).await?;

    // A missing webhook secret is a startup failure, not something to limp
    // along without.
    let billing = Arc::new(BillingService::from_env(pool.clone())?);

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Subscription lifecycle sweep (hourly)
    // Cron: at minute 0 of every hour
    let lifecycle_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = lifecycle_billing.clone();
            Box::pin(async move {
                info!("Running subscription lifecycle sweep");
                run_lifecycle_sweep(&billing).await;
            })
        })?)
        .await?;
    info!("Scheduled: Subscription lifecycle sweep (hourly)");

    // Job 2: Expired entitlement cleanup (hourly at :30, offset from the
    // lifecycle sweep)
    let cleanup_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 30 * * * *", move |_uuid, _l| {
            let billing = cleanup_billing.clone();
            Box::pin(async move {
                info!("Running expired entitlement cleanup");
                match billing.entitlements.cleanup_expired_entitlements().await {
                    Ok(revoked) => {
                        info!(revoked = revoked, "Expired entitlement cleanup complete")
                    }
                    Err(e) => error!(error = %e, "Expired entitlement cleanup failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Expired entitlement cleanup (hourly at :30)");

    // Job 3: Payment ledger reconciliation (daily at 3:15 UTC)
    let reconcile_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 15 3 * * *", move |_uuid, _l| {
            let billing = reconcile_billing.clone();
            Box::pin(async move {
                info!("Running ledger reconciliation");
                match billing
                    .reconciliation
                    .detect_discrepancies(RECONCILE_WINDOW_DAYS)
                    .await
                {
                    Ok(report) if report.is_clean() => info!(
                        checked_events = report.checked_events,
                        checked_payments = report.checked_payments,
                        "Ledger reconciliation clean"
                    ),
                    Ok(report) => {
                        warn!(
                            total = report.total_discrepancies,
                            "Ledger reconciliation found discrepancies"
                        );
                        for finding in &report.discrepancies {
                            warn!(
                                kind = %finding.kind,
                                transaction_id = %finding.transaction_id,
                                detail = %finding.detail,
                                "Ledger discrepancy"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Ledger reconciliation failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Payment ledger reconciliation (daily at 3:15 UTC)");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("BotForge Worker started successfully with {} scheduled jobs", 4);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
