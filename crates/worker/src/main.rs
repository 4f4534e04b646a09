//! Tenantry background worker
//!
//! Runs the scheduled sweeps against the shared database until interrupted.

mod sweeps;

use std::sync::Arc;

use anyhow::Context;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::EnvFilter;

use tenantry_api::{Config, InvitationService};
use tenantry_billing::{ResendNotifier, StalePayments, SubscriptionService};

use crate::sweeps::{Sweep, Sweeper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = Config::from_env().context("loading configuration")?;
    let pool = tenantry_shared::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("connecting to database")?;
    tenantry_shared::run_migrations(&pool)
        .await
        .context("running migrations")?;

    let notifier = Arc::new(ResendNotifier::from_env());
    let sweeper = Sweeper::new(
        SubscriptionService::new(pool.clone()),
        InvitationService::new(
            pool.clone(),
            notifier,
            config.invitation_hmac_secret.clone(),
            config.invitation_expiry_days,
        ),
        StalePayments::new(pool.clone(), &config.billing),
    );

    let mut scheduler = JobScheduler::new().await?;
    for sweep in Sweep::ALL {
        let sweeper = sweeper.clone();
        let job = Job::new_async(sweep.schedule(), move |_id, _scheduler| {
            let sweeper = sweeper.clone();
            Box::pin(async move { sweeper.run_logged(sweep).await })
        })?;
        scheduler.add(job).await?;
        tracing::info!(sweep = sweep.name(), schedule = sweep.schedule(), "Scheduled sweep");
    }

    // Catch up on anything that came due while the worker was down
    for sweep in Sweep::ALL {
        sweeper.run_logged(sweep).await;
    }

    scheduler.start().await?;
    tracing::info!("Worker started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl+C, shutting down");
    scheduler.shutdown().await?;
    Ok(())
}
