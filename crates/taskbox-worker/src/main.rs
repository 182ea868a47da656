//! # Taskbox Worker
//!
//! Standalone worker process. Loads configuration, connects to the job
//! store and works the queue named by the first argument (`default` if
//! omitted), logging every delivered payload until Ctrl+C or SIGTERM.

use taskbox_config::ConfigLoader;
use taskbox_core::{init_telemetry, shutdown_telemetry, TaskboxResult};
use taskbox_jobs::{register_metrics, DrainOutcome, RawJson, TaskScheduling};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let result = run().await;
    if let Err(e) = &result {
        error!("Application error: {}", e);
    }
    shutdown_telemetry();
    if result.is_err() {
        std::process::exit(1);
    }
}

async fn run() -> TaskboxResult<()> {
    let config = ConfigLoader::from_default_location()?.get().await;
    init_telemetry(&config.observability)?;
    register_metrics();

    info!("Starting Taskbox worker...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Environment: {}", config.app.environment);

    let queue = std::env::args().nth(1).unwrap_or_else(|| "default".to_string());
    let scheduling = TaskScheduling::connect(&queue, &config.database, config.scheduling).await?;

    scheduling
        .work(&queue, RawJson, |payload, ctx| async move {
            info!(job_id = %ctx.job_id, attempt = ctx.attempt, payload = %payload, "Job received");
            Ok(())
        })
        .await?;

    match scheduling.run_until_signal().await {
        DrainOutcome::Abandoned { remaining } => warn!(remaining, "Worker stopped with jobs still in flight"),
        _ => info!("Worker shutdown complete"),
    }
    Ok(())
}
