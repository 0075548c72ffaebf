//! PayVault Billing Worker
//!
//! Handles scheduled jobs including:
//! - Recurring subscription billing (daily at 02:10 UTC)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use payvault_billing::{RecurringBillingService, RunSummary};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Log the result of one billing run
fn log_run_summary(summary: &RunSummary) {
    info!(
        run_id = %summary.run_id,
        run_date = %summary.run_date,
        examined = summary.examined,
        charged = summary.charged,
        completed = summary.completed,
        retried = summary.retried,
        suspended = summary.suspended,
        skipped = summary.skipped,
        "Billing run complete"
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

    info!("Starting PayVault Billing Worker");

    // Create database pool
    let pool = create_db_pool().await?;

    // Create billing service
    let billing = match RecurringBillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // If PayPal isn't configured, run in minimal mode
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            info!("Worker running without PayPal integration");

            // Keep running with minimal functionality
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Recurring subscription billing (daily at 02:10 UTC)
    // Runs after the storefront's nightly order import settles
    let billing_service = billing.clone();
    scheduler
        .add(Job::new_async("0 10 2 * * *", move |_uuid, _l| {
            let service = billing_service.clone();
            Box::pin(async move {
                info!("Running scheduled recurring billing");
                match service.executor.run().await {
                    Ok(summary) => log_run_summary(&summary),
                    Err(e) => error!(error = %e, "Billing run failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Recurring subscription billing (daily at 02:10 UTC)");

    // Job 2: Health check heartbeat (every 5 minutes)
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

    info!("PayVault Billing Worker started successfully with 2 scheduled jobs");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
