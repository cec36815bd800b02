use adslot_engine::{app_state, config::AppConfig, db, services::processor::JobProcessor};
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting adslot worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    if config.dry_run {
        // a dry run never moves jobs out of pending
        tracing::warn!("DRY_RUN is set; dry runs go through the server API, worker exiting");
        return;
    }
    let poll_interval = Duration::from_millis(config.worker_poll_interval_ms.max(1));

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, config.max_concurrent_customers)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let processor = app_state::build_processor(&config, db_pool).expect("Failed to initialize engine");

    tracing::info!(poll_interval_ms = poll_interval.as_millis() as u64, "Worker ready, polling for jobs");

    loop {
        match process_next_job(&processor).await {
            Ok(true) => {
                tracing::debug!("Job run finished, checking for next job");
            }
            Ok(false) => {
                tracing::trace!("No jobs available, sleeping");
                sleep(poll_interval).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Error processing job, will retry");
                sleep(poll_interval).await;
            }
        }
    }
}

/// Run the oldest pending job.
/// Returns Ok(true) if a job was run, Ok(false) if none was waiting.
async fn process_next_job(processor: &JobProcessor) -> Result<bool, Box<dyn std::error::Error>> {
    let job = match processor.store().next_runnable_job().await? {
        Some(j) => j,
        None => return Ok(false),
    };

    tracing::info!(
        job_id = %job.id,
        total_items = job.total_items,
        is_repair = job.is_repair,
        "Picked up job"
    );

    let report = processor.process_job(job.id).await?;
    tracing::info!(
        job_id = %job.id,
        status = %report.status,
        succeeded = report.counts.succeeded,
        failed = report.counts.failed,
        skipped = report.counts.skipped,
        "Job run finished"
    );

    Ok(true)
}
