#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod chunker;
pub mod deletion;
pub mod extraction;
pub mod merger;
pub mod pipeline;
pub mod utils;

pub use deletion::{DeletionCoordinator, DeletionResult, DeletionStatus};
pub use pipeline::{
    DocumentOutcome, EnqueueResult, IngestionConfig, IngestionPipeline, IngestionTuning,
    PipelineStatusSnapshot, ProcessingReport,
};

use std::sync::Arc;

use common::error::AppError;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Polls for pending documents until `cancel` fires. Passes in which every
/// document failed back off exponentially so a broken model endpoint is not
/// hammered.
pub async fn run_worker_loop(
    ingestion_pipeline: Arc<IngestionPipeline>,
    cancel: CancellationToken,
) -> Result<(), AppError> {
    let worker_id = format!("ingestion-worker-{}", Uuid::new_v4());
    let idle_backoff = Duration::from_millis(500);
    let max_backoff = Duration::from_secs(30);
    let mut failure_backoff = Duration::from_secs(1);

    info!(%worker_id, "ingestion worker started");
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let delay = match ingestion_pipeline.process_pending(None, &cancel).await {
            Ok(report) if report.outcomes.is_empty() => idle_backoff,
            Ok(report) if report.processed() == 0 && report.failed() > 0 => {
                warn!(
                    %worker_id,
                    failed = report.failed(),
                    backoff_ms = u64::try_from(failure_backoff.as_millis()).unwrap_or(u64::MAX),
                    "every document in the pass failed; backing off"
                );
                let delay = failure_backoff;
                failure_backoff = (failure_backoff * 2).min(max_backoff);
                delay
            }
            Ok(report) => {
                info!(
                    %worker_id,
                    processed = report.processed(),
                    failed = report.failed(),
                    "processing pass finished"
                );
                failure_backoff = Duration::from_secs(1);
                Duration::ZERO
            }
            Err(err) => {
                error!(%worker_id, error = %err, "processing pass failed");
                let delay = failure_backoff;
                failure_backoff = (failure_backoff * 2).min(max_backoff);
                delay
            }
        };

        tokio::select! {
            () = cancel.cancelled() => break,
            () = sleep(delay) => {}
        }
    }
    info!(%worker_id, "ingestion worker stopped");
    Ok(())
}
