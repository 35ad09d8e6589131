use std::collections::HashMap;

use common::{
    error::AppError,
    storage::{
        traits::{KeyValueStoreExt, VectorRecord},
        types::{document::DocTransition, text_chunk::TextChunk},
    },
};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use state_machines::core::GuardError;
use tracing::{debug, instrument, warn};

use super::{
    context::PipelineContext,
    state::{Chunked, DocumentMachine, Extracted, Finalized, Merged, Ready},
};
use crate::extraction::ChunkExtraction;

/// Stored form of an enqueued document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullDocument {
    pub content: String,
    pub file_path: String,
}

#[instrument(level = "trace", skip_all, fields(doc_id = %ctx.doc_id))]
pub async fn chunk(
    machine: DocumentMachine<(), Ready>,
    ctx: &mut PipelineContext<'_>,
) -> Result<DocumentMachine<(), Chunked>, AppError> {
    ctx.ensure_active()?;
    ctx.record.apply(DocTransition::Start)?;
    ctx.save_record().await?;

    if ctx.resumed && !ctx.record.chunk_ids.is_empty() {
        let stored = ctx
            .storages
            .text_chunks
            .get_many_typed::<TextChunk>(&ctx.record.chunk_ids)
            .await?;
        if stored.iter().all(Option::is_some) {
            ctx.chunks = stored.into_iter().flatten().collect();
            debug!(doc_id = %ctx.doc_id, chunks = ctx.chunks.len(), "resuming from stored chunks");
            return machine
                .chunk()
                .map_err(|(_, guard)| map_guard_error("chunk", &guard));
        }
        warn!(doc_id = %ctx.doc_id, "stored chunks incomplete; chunking again");
        ctx.resumed = false;
    }

    let document: FullDocument = ctx
        .storages
        .full_docs
        .get_typed(&ctx.doc_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("document content {}", ctx.doc_id)))?;

    let file_path = document.file_path;
    let chunks: Vec<TextChunk> = ctx
        .chunker
        .chunks(&document.content)?
        .map(|span| {
            TextChunk::new(
                ctx.doc_id.clone(),
                span.content,
                span.tokens,
                span.index,
                file_path.clone(),
            )
        })
        .collect();
    if chunks.is_empty() {
        return Err(AppError::Validation(format!(
            "document {} produced no chunks",
            ctx.doc_id
        )));
    }

    let embeddings = ctx.services.embed_chunks(&chunks).await?;
    let records: Vec<VectorRecord> = chunks
        .iter()
        .zip(embeddings)
        .map(|(chunk, embedding)| VectorRecord {
            id: chunk.id.clone(),
            embedding,
            content: chunk.content.clone(),
            metadata: json!({
                "full_doc_id": chunk.full_doc_id,
                "chunk_order_index": chunk.chunk_order_index,
                "tokens": chunk.tokens,
                "file_path": chunk.file_path,
            }),
        })
        .collect();

    ctx.storages
        .text_chunks
        .upsert_typed(chunks.iter().map(|chunk| (chunk.id.clone(), chunk)).collect())
        .await?;
    ctx.storages.chunks_vdb.upsert(records).await?;

    ctx.record.chunk_ids = chunks.iter().map(|chunk| chunk.id.clone()).collect();
    ctx.record.chunks_count = chunks.len();
    ctx.save_record().await?;
    debug!(doc_id = %ctx.doc_id, chunks = chunks.len(), "document chunked");
    ctx.chunks = chunks;

    machine
        .chunk()
        .map_err(|(_, guard)| map_guard_error("chunk", &guard))
}

#[instrument(level = "trace", skip_all, fields(doc_id = %ctx.doc_id))]
pub async fn extract(
    machine: DocumentMachine<(), Chunked>,
    ctx: &mut PipelineContext<'_>,
) -> Result<DocumentMachine<(), Extracted>, AppError> {
    ctx.ensure_active()?;

    if ctx.pipeline_config.chunk_only {
        ctx.record.apply(DocTransition::Preprocess)?;
        ctx.save_record().await?;
        return machine
            .extract()
            .map_err(|(_, guard)| map_guard_error("extract", &guard));
    }

    let chunk_ids: Vec<String> = ctx.chunks.iter().map(|chunk| chunk.id.clone()).collect();
    let mut extracted: HashMap<String, ChunkExtraction> = ctx
        .storages
        .chunk_extractions
        .get_many_typed::<ChunkExtraction>(&chunk_ids)
        .await?
        .into_iter()
        .flatten()
        .map(|extraction| (extraction.chunk_id.clone(), extraction))
        .collect();

    let pending: Vec<&TextChunk> = ctx
        .chunks
        .iter()
        .filter(|chunk| !extracted.contains_key(&chunk.id))
        .collect();
    debug!(
        doc_id = %ctx.doc_id,
        cached = extracted.len(),
        pending = pending.len(),
        "extracting chunks"
    );

    let services = ctx.services;
    let gate = ctx.chunk_gate;
    let cancel = ctx.cancel;
    let results: Vec<Result<ChunkExtraction, AppError>> = stream::iter(pending)
        .map(|chunk| async move {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            let _permit = gate
                .acquire()
                .await
                .map_err(|err| AppError::InternalError(format!("chunk gate closed: {err}")))?;
            services.extract_chunk(chunk).await
        })
        .buffer_unordered(ctx.pipeline_config.tuning.chunk_concurrency)
        .collect()
        .await;

    let mut fresh = Vec::new();
    let mut first_error: Option<AppError> = None;
    let mut cancelled = false;
    for result in results {
        match result {
            Ok(extraction) => fresh.push(extraction),
            Err(AppError::Cancelled) => cancelled = true,
            Err(err) => {
                ctx.failed_chunks += 1;
                warn!(doc_id = %ctx.doc_id, error = %err, "chunk extraction failed");
                first_error.get_or_insert(err);
            }
        }
    }

    if !fresh.is_empty() {
        ctx.storages
            .chunk_extractions
            .upsert_typed(
                fresh
                    .iter()
                    .map(|extraction| (extraction.chunk_id.clone(), extraction))
                    .collect(),
            )
            .await?;
    }
    for extraction in fresh {
        extracted.insert(extraction.chunk_id.clone(), extraction);
    }

    if let Some(err) = first_error {
        return Err(AppError::Processing(format!(
            "{} of {} chunks failed extraction: {err}",
            ctx.failed_chunks,
            ctx.chunks.len()
        )));
    }
    if cancelled {
        return Err(AppError::Cancelled);
    }

    ctx.extractions = ctx
        .chunks
        .iter()
        .filter_map(|chunk| extracted.remove(&chunk.id))
        .collect();
    ctx.record.apply(DocTransition::Preprocess)?;
    ctx.save_record().await?;

    machine
        .extract()
        .map_err(|(_, guard)| map_guard_error("extract", &guard))
}

#[instrument(level = "trace", skip_all, fields(doc_id = %ctx.doc_id))]
pub async fn merge(
    machine: DocumentMachine<(), Extracted>,
    ctx: &mut PipelineContext<'_>,
) -> Result<DocumentMachine<(), Merged>, AppError> {
    ctx.ensure_active()?;

    if !ctx.extractions.is_empty() {
        ctx.merge = ctx
            .services
            .merge_extractions(&ctx.extractions, ctx.cancel)
            .await;
        if ctx.merge.cancelled > 0 {
            return Err(AppError::Cancelled);
        }
        for failure in &ctx.merge.failed {
            warn!(doc_id = %ctx.doc_id, target = %failure.target, error = %failure.error, "merge item failed");
        }
    }

    machine
        .merge()
        .map_err(|(_, guard)| map_guard_error("merge", &guard))
}

#[instrument(level = "trace", skip_all, fields(doc_id = %ctx.doc_id))]
pub async fn finalize(
    machine: DocumentMachine<(), Merged>,
    ctx: &mut PipelineContext<'_>,
) -> Result<DocumentMachine<(), Finalized>, AppError> {
    ctx.record.apply(DocTransition::Complete)?;
    ctx.save_record().await?;

    machine
        .finalize()
        .map_err(|(_, guard)| map_guard_error("finalize", &guard))
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid document pipeline transition during {event}: {guard:?}"
    ))
}
