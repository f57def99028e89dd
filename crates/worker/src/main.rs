//! DojoGate background worker
//!
//! Expires or converts due feature trials on a fixed interval.

mod trial_sweeper;

use anyhow::{anyhow, Context};
use dojogate_api::{telemetry, Config};
use dojogate_entitlements::EntitlementEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;
    telemetry::init_tracing(config.log_format, "dojogate_worker=info,dojogate_entitlements=info");

    tracing::info!(
        interval_secs = config.sweep_interval_secs,
        batch_size = config.sweep_batch_size,
        "Starting DojoGate worker"
    );

    let pool = dojogate_shared::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;

    let engine = EntitlementEngine::postgres(pool.clone(), config.sweep_batch_size)
        .await
        .context("Failed to initialise entitlement engine")?;
    let sweeper = engine.sweeper.clone();

    // Catch up immediately instead of waiting a full interval after a deploy
    trial_sweeper::process_expired_trials(&sweeper).await;

    let mut scheduler = JobScheduler::new()
        .await
        .map_err(|e| anyhow!("Failed to create scheduler: {e:?}"))?;

    let job_sweeper = Arc::clone(&sweeper);
    let sweep_job = Job::new_repeated_async(
        Duration::from_secs(config.sweep_interval_secs),
        move |_job_id, _scheduler| {
            let sweeper = Arc::clone(&job_sweeper);
            Box::pin(async move {
                trial_sweeper::process_expired_trials(&sweeper).await;
            })
        },
    )
    .map_err(|e| anyhow!("Failed to create sweep job: {e:?}"))?;

    scheduler
        .add(sweep_job)
        .await
        .map_err(|e| anyhow!("Failed to schedule sweep job: {e:?}"))?;
    scheduler
        .start()
        .await
        .map_err(|e| anyhow!("Failed to start scheduler: {e:?}"))?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!(error = ?e, "Scheduler did not shut down cleanly");
    }
    engine.shutdown().await;
    pool.close().await;
    tracing::info!("Worker stopped");
    Ok(())
}
