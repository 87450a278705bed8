// Worker clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tally Background Worker
//!
//! Handles scheduled billing jobs:
//! - Apply paid pending changes that have come due (every 5 minutes)
//! - Reconcile every tenant's agreements with the provider (hourly)
//! - Retry provider cancellations left pending (every 10 minutes)
//! - Expire abandoned checkouts (hourly)
//! - Billing invariant checks (daily at 03:15 UTC)
//! - Heartbeat (every 5 minutes)
//!
//! Every schedule can be overridden through the environment, see `config.rs`.

mod config;
mod jobs;

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tally_billing::{BillingError, BillingService, InvariantChecker};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::{WorkerConfig, HEARTBEAT_CRON};
use crate::jobs::JobGuard;

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn log_job_error(job: &str, e: &BillingError) {
    error!(job = job, error = %e, transient = e.is_transient(), "Scheduled job failed");
}

/// Register a guarded job; `run` is called with the tick's wall-clock time
async fn schedule<F, Fut>(
    scheduler: &JobScheduler,
    name: &'static str,
    cron: &str,
    guard_timeout: std::time::Duration,
    run: F,
) -> anyhow::Result<()>
where
    F: Fn(OffsetDateTime) -> Fut + Send + Sync + Clone + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let guard = JobGuard::new(name, guard_timeout);
    let job = Job::new_async(cron, move |_uuid, _l| {
        let guard = guard.clone();
        let run = run.clone();
        Box::pin(async move {
            guard.run(run(OffsetDateTime::now_utc())).await;
        })
    })
    .with_context(|| format!("invalid cron expression for {}: '{}'", name, cron))?;

    scheduler.add(job).await?;
    info!(job = name, cron = cron, "Scheduled");
    Ok(())
}

async fn register_jobs(
    scheduler: &JobScheduler,
    config: &WorkerConfig,
    billing: Arc<BillingService>,
    pool: PgPool,
) -> anyhow::Result<()> {
    let timeout = config.job_timeout;

    let b = billing.clone();
    schedule(scheduler, "apply_pending_changes", &config.apply_cron, timeout, move |now| {
        let billing = b.clone();
        async move {
            if let Err(e) = billing.applier.apply_due(now).await {
                log_job_error("apply_pending_changes", &e);
            }
        }
    })
    .await?;

    let b = billing.clone();
    schedule(scheduler, "reconcile_agreements", &config.reconcile_cron, timeout, move |now| {
        let billing = b.clone();
        async move {
            if let Err(e) = billing.reconciliation.reconcile_all(now).await {
                log_job_error("reconcile_agreements", &e);
            }
        }
    })
    .await?;

    let b = billing.clone();
    schedule(scheduler, "retry_cancellations", &config.retry_cron, timeout, move |now| {
        let billing = b.clone();
        async move {
            let batch = billing.config.cancel_retry_batch_size;
            if let Err(e) = billing.retry.retry_pending_cancellations(batch, now).await {
                log_job_error("retry_cancellations", &e);
            }
        }
    })
    .await?;

    let b = billing.clone();
    schedule(scheduler, "expire_checkouts", &config.expire_cron, timeout, move |now| {
        let billing = b.clone();
        async move {
            let max_age = billing.config.checkout_expiry;
            if let Err(e) = billing.checkout.expire_abandoned_checkouts(max_age, now).await {
                log_job_error("expire_checkouts", &e);
            }
        }
    })
    .await?;

    let checker = Arc::new(InvariantChecker::new(pool));
    schedule(scheduler, "invariant_checks", &config.invariants_cron, timeout, move |now| {
        let checker = checker.clone();
        async move {
            match checker.run_all_checks(now).await {
                Ok(summary) => summary.log(),
                Err(e) => log_job_error("invariant_checks", &e),
            }
        }
    })
    .await?;

    schedule(scheduler, "heartbeat", HEARTBEAT_CRON, timeout, |_now| async {
        info!("Worker heartbeat - all systems operational");
    })
    .await?;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment before reading any settings
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env()?;
    init_tracing(config.json_logs);

    info!("Starting Tally Worker");

    let pool = tally_shared::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("failed to connect to Postgres")?;
    tally_shared::run_migrations(&pool)
        .await
        .context("failed to apply migrations")?;

    let billing = Arc::new(
        BillingService::from_env(pool.clone()).context("failed to configure billing service")?,
    );

    let mut scheduler = JobScheduler::new().await?;
    register_jobs(&scheduler, &config, billing, pool).await?;

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Tally Worker started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");
    scheduler.shutdown().await?;

    Ok(())
}
