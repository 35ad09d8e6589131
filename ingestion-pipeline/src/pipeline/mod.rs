mod config;
mod context;
mod services;
mod stages;
mod state;
mod status;

pub use config::{IngestionConfig, IngestionTuning};
#[allow(clippy::module_name_repetitions)]
pub use services::{DefaultPipelineServices, PipelineServices};
pub use stages::FullDocument;
pub use status::{PipelineStatus, PipelineStatusSnapshot};

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use common::{
    error::AppError,
    storage::{
        traits::KeyValueStoreExt,
        types::document::{DocStatus, DocumentRecord},
        Storages,
    },
    utils::{
        embedding::EmbeddingProvider,
        hashing::{document_id, generate_track_id},
        locks::KeyedLocks,
    },
};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use self::{
    context::PipelineContext,
    stages::{chunk, extract, finalize, merge},
    state::ready,
};
use crate::{
    chunker::TokenChunker,
    extraction::Extractor,
    merger::{MergeOutcome, Merger},
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnqueueResult {
    pub doc_id: String,
    pub track_id: String,
    pub duplicate: bool,
}

/// Result of one document in a processing run.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentOutcome {
    pub doc_id: String,
    pub status: DocStatus,
    pub chunks: usize,
    pub failed_chunks: usize,
    pub merge: MergeOutcome,
    pub error: Option<String>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingReport {
    pub outcomes: Vec<DocumentOutcome>,
    pub cancelled: bool,
}

impl ProcessingReport {
    pub fn processed(&self) -> usize {
        self.count(DocStatus::Processed)
    }

    pub fn failed(&self) -> usize {
        self.count(DocStatus::Failed)
    }

    fn count(&self, status: DocStatus) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.status == status)
            .count()
    }
}

#[allow(clippy::module_name_repetitions)]
pub struct IngestionPipeline {
    storages: Storages,
    pipeline_config: IngestionConfig,
    services: Arc<dyn PipelineServices>,
    chunker: TokenChunker,
    doc_locks: Arc<KeyedLocks>,
    chunk_gate: Arc<Semaphore>,
    process_gate: Mutex<()>,
    status: Arc<PipelineStatus>,
}

impl IngestionPipeline {
    pub fn new(
        storages: Storages,
        extractor: Extractor,
        merger: Arc<Merger>,
        embedder: Arc<EmbeddingProvider>,
        pipeline_config: IngestionConfig,
    ) -> Result<Self, AppError> {
        let services = DefaultPipelineServices::new(extractor, merger, embedder);
        Self::with_services(storages, pipeline_config, Arc::new(services))
    }

    pub fn with_services(
        storages: Storages,
        pipeline_config: IngestionConfig,
        services: Arc<dyn PipelineServices>,
    ) -> Result<Self, AppError> {
        let tuning = &pipeline_config.tuning;
        let chunker = TokenChunker::new(tuning.chunk_token_size, tuning.chunk_overlap_token_size)?
            .with_split_character(
                tuning.split_by_character.clone(),
                tuning.split_by_character_only,
            );
        Ok(Self {
            chunk_gate: Arc::new(Semaphore::new(tuning.chunk_concurrency.max(1))),
            status: Arc::new(PipelineStatus::new(tuning.status_history_len)),
            storages,
            pipeline_config,
            services,
            chunker,
            doc_locks: Arc::new(KeyedLocks::new()),
            process_gate: Mutex::new(()),
        })
    }

    /// Per-document locks shared with deletion.
    pub fn doc_locks(&self) -> Arc<KeyedLocks> {
        Arc::clone(&self.doc_locks)
    }

    pub fn status(&self) -> PipelineStatusSnapshot {
        self.status.snapshot()
    }

    pub fn storages(&self) -> &Storages {
        &self.storages
    }

    /// Stores `text` as a pending document unless identical content is already known.
    #[instrument(skip_all, fields(file_path = file_path.unwrap_or_default()))]
    pub async fn enqueue(
        &self,
        text: &str,
        file_path: Option<&str>,
        track_id: Option<&str>,
    ) -> Result<EnqueueResult, AppError> {
        let track_id = track_id.map_or_else(|| generate_track_id("insert"), str::to_string);
        self.enqueue_with_track(text, file_path, track_id).await
    }

    /// Enqueues several documents under one track id.
    pub async fn enqueue_many(
        &self,
        documents: &[(String, Option<String>)],
        track_id: Option<&str>,
    ) -> Result<Vec<EnqueueResult>, AppError> {
        let track_id = track_id.map_or_else(|| generate_track_id("insert"), str::to_string);
        let mut results = Vec::with_capacity(documents.len());
        for (text, file_path) in documents {
            results.push(
                self.enqueue_with_track(text, file_path.as_deref(), track_id.clone())
                    .await?,
            );
        }
        Ok(results)
    }

    async fn enqueue_with_track(
        &self,
        text: &str,
        file_path: Option<&str>,
        track_id: String,
    ) -> Result<EnqueueResult, AppError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::Validation("document text is empty".into()));
        }

        let doc_id = document_id(text);
        let _guard = self.doc_locks.lock(&doc_id).await;
        if let Some(existing) = self.storages.doc_status.get(&doc_id).await? {
            debug!(%doc_id, status = %existing.status, "duplicate document skipped");
            return Ok(EnqueueResult {
                doc_id,
                track_id: existing.track_id,
                duplicate: true,
            });
        }

        let record = DocumentRecord::new(
            doc_id.clone(),
            text,
            file_path.map(str::to_string),
            track_id.clone(),
        );
        let document = FullDocument {
            content: text.to_string(),
            file_path: record.file_path.clone(),
        };
        self.storages
            .full_docs
            .upsert_typed(vec![(doc_id.clone(), &document)])
            .await?;
        self.storages.doc_status.upsert(vec![record]).await?;
        info!(%doc_id, %track_id, "document enqueued");

        Ok(EnqueueResult {
            doc_id,
            track_id,
            duplicate: false,
        })
    }

    /// Processes every document that is not yet `processed`, optionally
    /// restricted to one track id. Only one run is active at a time.
    #[instrument(skip_all, fields(track_id = track_id.unwrap_or("*")))]
    pub async fn process_pending(
        &self,
        track_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ProcessingReport, AppError> {
        let _run = self.process_gate.lock().await;

        let mut queue: Vec<DocumentRecord> = Vec::new();
        for status in [
            DocStatus::Pending,
            DocStatus::Failed,
            DocStatus::Processing,
            DocStatus::Preprocessed,
        ] {
            queue.extend(self.storages.doc_status.by_status(status).await?);
        }
        if let Some(track_id) = track_id {
            queue.retain(|record| record.track_id == track_id);
        }
        queue.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        if queue.is_empty() {
            debug!("no documents to process");
            return Ok(ProcessingReport::default());
        }

        let started = Instant::now();
        let total = queue.len();
        self.status.begin("process_pending", total);
        info!(documents = total, "document processing started");

        let outcomes: Vec<DocumentOutcome> = stream::iter(queue)
            .map(|record| self.process_document(record, cancel))
            .buffer_unordered(self.pipeline_config.tuning.max_parallel_insert.max(1))
            .inspect(|outcome| {
                self.status.message(match &outcome.error {
                    Some(error) => format!("{}: {} ({error})", outcome.doc_id, outcome.status),
                    None => format!("{}: {}", outcome.doc_id, outcome.status),
                });
            })
            .collect()
            .await;

        let report = ProcessingReport {
            cancelled: cancel.is_cancelled(),
            outcomes,
        };
        let summary = format!(
            "processed {} of {total} document(s), {} failed{}",
            report.processed(),
            report.failed(),
            if report.cancelled { ", cancelled" } else { "" }
        );
        self.status.end(summary.clone());
        info!(
            total_ms = duration_millis(started.elapsed()),
            processed = report.processed(),
            failed = report.failed(),
            cancelled = report.cancelled,
            "{summary}"
        );
        Ok(report)
    }

    #[instrument(skip_all, fields(doc_id = %record.id))]
    async fn process_document(
        &self,
        record: DocumentRecord,
        cancel: &CancellationToken,
    ) -> DocumentOutcome {
        let doc_id = record.id.clone();
        let _guard = self.doc_locks.lock(&doc_id).await;

        // The record may have been deleted or finished while queued.
        let record = match self.storages.doc_status.get(&doc_id).await {
            Ok(Some(record)) if record.status.needs_processing() => record,
            Ok(Some(record)) => return DocumentOutcome::untouched(record, None),
            Ok(None) => {
                return DocumentOutcome::untouched(
                    record,
                    Some("document was deleted before processing".into()),
                )
            }
            Err(err) => return DocumentOutcome::untouched(record, Some(err.to_string())),
        };

        if cancel.is_cancelled() {
            let mut outcome = DocumentOutcome::untouched(record, None);
            outcome.cancelled = true;
            return outcome;
        }

        let resumed = record.status != DocStatus::Pending;
        let mut ctx = PipelineContext::new(
            record,
            resumed,
            &self.storages,
            &self.pipeline_config,
            self.services.as_ref(),
            &self.chunker,
            &self.chunk_gate,
            cancel,
        );

        let result = Self::drive_pipeline(&mut ctx).await;
        let mut outcome = DocumentOutcome {
            doc_id,
            status: ctx.record.status,
            chunks: ctx.chunks.len(),
            failed_chunks: ctx.failed_chunks,
            merge: ctx.merge.clone(),
            error: None,
            cancelled: false,
        };

        match result {
            Ok(()) => {}
            Err(AppError::Cancelled) => outcome.cancelled = true,
            Err(err) => {
                let message = err.to_string();
                if let Err(transition) = ctx.record.fail(message.clone()) {
                    warn!(error = %transition, "could not mark document failed");
                } else if let Err(save) = ctx.save_record().await {
                    warn!(error = %save, "could not persist failed status");
                }
                outcome.status = ctx.record.status;
                outcome.error = Some(message);
            }
        }
        outcome
    }

    async fn drive_pipeline(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        let machine = ready();
        let pipeline_started = Instant::now();

        let stage_start = Instant::now();
        let machine = chunk(machine, ctx).await.map_err(|err| ctx.abort(err))?;
        let chunk_ms = duration_millis(stage_start.elapsed());

        let stage_start = Instant::now();
        let machine = extract(machine, ctx).await.map_err(|err| ctx.abort(err))?;
        let extract_ms = duration_millis(stage_start.elapsed());

        let stage_start = Instant::now();
        let machine = merge(machine, ctx).await.map_err(|err| ctx.abort(err))?;
        let merge_ms = duration_millis(stage_start.elapsed());

        let stage_start = Instant::now();
        let _machine = finalize(machine, ctx).await.map_err(|err| ctx.abort(err))?;
        let finalize_ms = duration_millis(stage_start.elapsed());

        info!(
            doc_id = %ctx.doc_id,
            chunks = ctx.chunks.len(),
            entities = ctx.merge.entities_merged,
            relations = ctx.merge.relations_merged,
            total_ms = duration_millis(pipeline_started.elapsed()),
            chunk_ms,
            extract_ms,
            merge_ms,
            finalize_ms,
            "document pipeline finished"
        );
        Ok(())
    }
}

impl DocumentOutcome {
    fn untouched(record: DocumentRecord, error: Option<String>) -> Self {
        Self {
            doc_id: record.id,
            status: record.status,
            chunks: record.chunks_count,
            failed_chunks: 0,
            merge: MergeOutcome::default(),
            error,
            cancelled: false,
        }
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests;
