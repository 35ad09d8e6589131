use common::utils::config::get_config;
use graphrag::RagEngine;
use ingestion_pipeline::run_worker_loop;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;
    let engine = RagEngine::from_config(config).await?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested; finishing the current pass");
                shutdown.cancel();
            }
            Err(err) => error!(error = %err, "failed to listen for shutdown signal"),
        }
    });

    info!("Starting worker process");
    run_worker_loop(engine.ingestion(), cancel).await?;
    engine.finalize().await?;
    Ok(())
}
