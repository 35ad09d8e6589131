use common::{
    error::AppError,
    storage::{
        types::{document::DocumentRecord, text_chunk::TextChunk},
        Storages,
    },
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{config::IngestionConfig, services::PipelineServices};
use crate::{chunker::TokenChunker, extraction::ChunkExtraction, merger::MergeOutcome};

pub struct PipelineContext<'a> {
    pub doc_id: String,
    pub record: DocumentRecord,
    /// Chunks and extractions are already stored from an earlier run.
    pub resumed: bool,
    pub storages: &'a Storages,
    pub pipeline_config: &'a IngestionConfig,
    pub services: &'a dyn PipelineServices,
    pub chunker: &'a TokenChunker,
    pub chunk_gate: &'a Semaphore,
    pub cancel: &'a CancellationToken,
    pub chunks: Vec<TextChunk>,
    pub extractions: Vec<ChunkExtraction>,
    pub failed_chunks: usize,
    pub merge: MergeOutcome,
}

impl<'a> PipelineContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        record: DocumentRecord,
        resumed: bool,
        storages: &'a Storages,
        pipeline_config: &'a IngestionConfig,
        services: &'a dyn PipelineServices,
        chunker: &'a TokenChunker,
        chunk_gate: &'a Semaphore,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            doc_id: record.id.clone(),
            record,
            resumed,
            storages,
            pipeline_config,
            services,
            chunker,
            chunk_gate,
            cancel,
            chunks: Vec::new(),
            extractions: Vec::new(),
            failed_chunks: 0,
            merge: MergeOutcome::default(),
        }
    }

    pub fn ensure_active(&self) -> Result<(), AppError> {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        Ok(())
    }

    pub async fn save_record(&self) -> Result<(), AppError> {
        self.storages
            .doc_status
            .upsert(vec![self.record.clone()])
            .await
    }

    pub fn abort(&mut self, err: AppError) -> AppError {
        if matches!(err, AppError::Cancelled) {
            info!(doc_id = %self.doc_id, status = %self.record.status, "document pipeline cancelled");
        } else {
            error!(
                doc_id = %self.doc_id,
                status = %self.record.status,
                error = %err,
                "document pipeline aborted"
            );
        }
        err
    }
}
