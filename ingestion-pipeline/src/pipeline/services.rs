use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::types::text_chunk::TextChunk,
    utils::{embedding::EmbeddingProvider, limiter::Priority},
};
use tokio_util::sync::CancellationToken;

use crate::{
    extraction::{ChunkExtraction, Extractor},
    merger::{MergeOutcome, Merger},
};

/// Model-backed work the document pipeline delegates.
#[async_trait]
pub trait PipelineServices: Send + Sync {
    async fn embed_chunks(&self, chunks: &[TextChunk]) -> Result<Vec<Vec<f32>>, AppError>;

    async fn extract_chunk(&self, chunk: &TextChunk) -> Result<ChunkExtraction, AppError>;

    async fn merge_extractions(
        &self,
        extractions: &[ChunkExtraction],
        cancel: &CancellationToken,
    ) -> MergeOutcome;
}

pub struct DefaultPipelineServices {
    extractor: Extractor,
    merger: Arc<Merger>,
    embedder: Arc<EmbeddingProvider>,
}

impl DefaultPipelineServices {
    pub fn new(extractor: Extractor, merger: Arc<Merger>, embedder: Arc<EmbeddingProvider>) -> Self {
        Self {
            extractor,
            merger,
            embedder,
        }
    }
}

#[async_trait]
impl PipelineServices for DefaultPipelineServices {
    async fn embed_chunks(&self, chunks: &[TextChunk]) -> Result<Vec<Vec<f32>>, AppError> {
        let texts = chunks.iter().map(|chunk| chunk.content.clone()).collect();
        self.embedder.embed_batch(texts, Priority::Low).await
    }

    async fn extract_chunk(&self, chunk: &TextChunk) -> Result<ChunkExtraction, AppError> {
        self.extractor.extract(chunk).await
    }

    async fn merge_extractions(
        &self,
        extractions: &[ChunkExtraction],
        cancel: &CancellationToken,
    ) -> MergeOutcome {
        self.merger.merge(extractions, cancel).await
    }
}
