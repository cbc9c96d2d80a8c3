//! Chatmeter background worker
//!
//! Runs the subscription expiry sweep on a cron schedule so lapsed paid
//! profiles are demoted even when their owners never send another request.

use anyhow::Context;
use chatmeter_api::{init_tracing, AppState, Config};
use chatmeter_billing::ExpirySweeper;
use tokio_cron_scheduler::{Job, JobScheduler};

async fn run_sweep(sweeper: &ExpirySweeper) {
    match sweeper.run_once().await {
        Ok(report) => tracing::info!(
            subscriptions_expired = report.subscriptions_expired,
            users_demoted = report.users_demoted,
            users_resynced = report.users_resynced,
            failures = report.failures,
            "expiry sweep finished"
        ),
        Err(e) => tracing::error!(error = %e, "expiry sweep failed"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("failed to load configuration")?;
    init_tracing(config.log_format);

    let schedule = config.expiry_sweep_schedule.clone();
    let state = AppState::from_config(config)
        .await
        .context("failed to initialize services")?;

    // Catch up on anything that lapsed while the worker was down
    run_sweep(&state.sweeper).await;

    let mut scheduler = JobScheduler::new().await?;
    let sweeper = state.sweeper.clone();
    let job = Job::new_async(schedule.as_str(), move |_uuid, _lock| {
        let sweeper = sweeper.clone();
        Box::pin(async move {
            run_sweep(&sweeper).await;
        })
    })
    .with_context(|| format!("invalid EXPIRY_SWEEP_SCHEDULE: {}", schedule))?;

    scheduler.add(job).await?;
    scheduler.start().await?;
    tracing::info!(schedule = %schedule, "worker started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down worker");

    scheduler.shutdown().await?;

    Ok(())
}
