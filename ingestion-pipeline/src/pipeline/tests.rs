use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        traits::KeyValueStoreExt,
        types::{document::DocStatus, text_chunk::TextChunk},
        Storages,
    },
    utils::config::AppConfig,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{
    config::{IngestionConfig, IngestionTuning},
    services::PipelineServices,
    IngestionPipeline,
};
use crate::{
    extraction::{ChunkExtraction, ExtractedEntity, ParsedRecords},
    merger::MergeOutcome,
};

#[derive(Default)]
struct MockServices {
    calls: Mutex<Vec<&'static str>>,
    /// Cancelled after the first extraction, to interrupt a run between stages.
    cancel_after_extract: Option<CancellationToken>,
}

impl MockServices {
    async fn record(&self, stage: &'static str) {
        self.calls.lock().await.push(stage);
    }

    async fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().await.clone()
    }

    async fn count(&self, stage: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| **call == stage)
            .count()
    }
}

#[async_trait]
impl PipelineServices for MockServices {
    async fn embed_chunks(&self, chunks: &[TextChunk]) -> Result<Vec<Vec<f32>>, AppError> {
        self.record("embed").await;
        Ok(chunks.iter().map(|_| vec![0.1; 8]).collect())
    }

    async fn extract_chunk(&self, chunk: &TextChunk) -> Result<ChunkExtraction, AppError> {
        self.record("extract").await;
        if chunk.content.contains("BROKEN") {
            return Err(AppError::Processing("model unavailable".into()));
        }
        if let Some(token) = &self.cancel_after_extract {
            token.cancel();
        }
        let name = chunk
            .content
            .split_whitespace()
            .next()
            .unwrap_or("Unnamed")
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_string();
        let records = ParsedRecords {
            entities: vec![ExtractedEntity {
                name,
                entity_type: "ORGANIZATION".into(),
                description: chunk.content.clone(),
            }],
            relations: Vec::new(),
        };
        Ok(ChunkExtraction::new(chunk, records))
    }

    async fn merge_extractions(
        &self,
        extractions: &[ChunkExtraction],
        cancel: &CancellationToken,
    ) -> MergeOutcome {
        self.record("merge").await;
        let entities: usize = extractions.iter().map(|e| e.entities.len()).sum();
        if cancel.is_cancelled() {
            return MergeOutcome {
                cancelled: entities,
                ..MergeOutcome::default()
            };
        }
        MergeOutcome {
            entities_merged: entities,
            ..MergeOutcome::default()
        }
    }
}

fn line_chunks_config() -> IngestionConfig {
    IngestionConfig {
        tuning: IngestionTuning {
            split_by_character: Some("\n".into()),
            ..IngestionTuning::default()
        },
        chunk_only: false,
    }
}

fn pipeline_with(
    services: Arc<MockServices>,
    config: IngestionConfig,
) -> (IngestionPipeline, Storages) {
    let storages = Storages::in_memory(&AppConfig::default());
    let pipeline = IngestionPipeline::with_services(storages.clone(), config, services)
        .expect("pipeline");
    (pipeline, storages)
}

#[tokio::test]
async fn enqueue_deduplicates_by_content() {
    let services = Arc::new(MockServices::default());
    let (pipeline, storages) = pipeline_with(services, IngestionConfig::default());

    let first = pipeline
        .enqueue("Acme builds Widget.", Some("acme.md"), None)
        .await
        .expect("enqueue");
    let second = pipeline
        .enqueue("  Acme builds Widget.\n", None, Some("other-track"))
        .await
        .expect("enqueue again");

    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(first.doc_id, second.doc_id);
    assert_eq!(second.track_id, first.track_id);
    assert!(first.track_id.starts_with("insert_"));

    let record = storages
        .doc_status
        .get(&first.doc_id)
        .await
        .expect("get")
        .expect("record");
    assert_eq!(record.status, DocStatus::Pending);
    assert_eq!(record.file_path, "acme.md");

    let empty = pipeline.enqueue("   ", None, None).await;
    assert!(matches!(empty, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn processes_pending_documents_through_every_stage() {
    let services = Arc::new(MockServices::default());
    let (pipeline, storages) = pipeline_with(Arc::clone(&services), IngestionConfig::default());
    let enqueued = pipeline
        .enqueue("Acme builds Widget in Berlin.", None, None)
        .await
        .expect("enqueue");

    let report = pipeline
        .process_pending(None, &CancellationToken::new())
        .await
        .expect("process");

    assert_eq!(report.outcomes.len(), 1);
    let outcome = &report.outcomes[0];
    assert_eq!(outcome.status, DocStatus::Processed);
    assert_eq!(outcome.chunks, 1);
    assert_eq!(outcome.merge.entities_merged, 1);
    assert!(outcome.error.is_none());
    assert_eq!(services.calls().await, vec!["embed", "extract", "merge"]);

    let record = storages
        .doc_status
        .get(&enqueued.doc_id)
        .await
        .expect("get")
        .expect("record");
    assert_eq!(record.status, DocStatus::Processed);
    assert_eq!(record.chunks_count, 1);
    let stored: Option<ChunkExtraction> = storages
        .chunk_extractions
        .get_typed(&record.chunk_ids[0])
        .await
        .expect("extraction");
    assert!(stored.is_some());
    assert_eq!(storages.chunks_vdb.count().await.expect("count"), 1);
}

#[tokio::test]
async fn reprocessing_a_processed_document_is_a_no_op() {
    let services = Arc::new(MockServices::default());
    let (pipeline, _storages) = pipeline_with(Arc::clone(&services), IngestionConfig::default());
    pipeline
        .enqueue("Acme builds Widget.", None, None)
        .await
        .expect("enqueue");
    let cancel = CancellationToken::new();
    pipeline.process_pending(None, &cancel).await.expect("first");
    let calls_after_first = services.calls().await.len();

    let report = pipeline.process_pending(None, &cancel).await.expect("second");

    assert!(report.outcomes.is_empty());
    assert_eq!(services.calls().await.len(), calls_after_first);
}

#[tokio::test]
async fn failing_chunk_fails_the_document_without_merging() {
    let services = Arc::new(MockServices::default());
    let (pipeline, storages) = pipeline_with(Arc::clone(&services), line_chunks_config());
    let text = "Acme builds Widget in Berlin.\nThe BROKEN part cannot be read.\nWidget is sold by Acme.";
    let enqueued = pipeline.enqueue(text, None, None).await.expect("enqueue");

    let report = pipeline
        .process_pending(None, &CancellationToken::new())
        .await
        .expect("process");

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.status, DocStatus::Failed);
    assert_eq!(outcome.chunks, 3);
    assert_eq!(outcome.failed_chunks, 1);
    assert!(outcome.error.is_some());
    assert_eq!(services.count("merge").await, 0);

    let record = storages
        .doc_status
        .get(&enqueued.doc_id)
        .await
        .expect("get")
        .expect("record");
    assert_eq!(record.status, DocStatus::Failed);
    assert!(record.error_msg.is_some());
    assert_eq!(report.failed(), 1);
    assert_eq!(services.count("extract").await, 3);
}

#[tokio::test]
async fn cancelled_run_resumes_from_stored_extractions() {
    let cancel = CancellationToken::new();
    let services = Arc::new(MockServices {
        cancel_after_extract: Some(cancel.clone()),
        ..MockServices::default()
    });
    let (pipeline, storages) = pipeline_with(Arc::clone(&services), IngestionConfig::default());
    let enqueued = pipeline
        .enqueue("Acme builds Widget.", None, None)
        .await
        .expect("enqueue");

    let report = pipeline.process_pending(None, &cancel).await.expect("process");
    assert!(report.cancelled);
    assert!(report.outcomes[0].cancelled);
    let record = storages
        .doc_status
        .get(&enqueued.doc_id)
        .await
        .expect("get")
        .expect("record");
    assert_eq!(record.status, DocStatus::Preprocessed);
    assert_eq!(services.count("merge").await, 0);

    let report = pipeline
        .process_pending(None, &CancellationToken::new())
        .await
        .expect("resume");

    assert_eq!(report.outcomes[0].status, DocStatus::Processed);
    assert_eq!(services.count("extract").await, 1);
    assert_eq!(services.count("embed").await, 1);
    assert_eq!(services.count("merge").await, 1);
}

#[tokio::test]
async fn cancelled_token_leaves_documents_pending() {
    let services = Arc::new(MockServices::default());
    let (pipeline, storages) = pipeline_with(Arc::clone(&services), IngestionConfig::default());
    let enqueued = pipeline
        .enqueue("Acme builds Widget.", None, None)
        .await
        .expect("enqueue");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = pipeline.process_pending(None, &cancel).await.expect("process");

    assert!(report.cancelled);
    assert!(services.calls().await.is_empty());
    let record = storages
        .doc_status
        .get(&enqueued.doc_id)
        .await
        .expect("get")
        .expect("record");
    assert_eq!(record.status, DocStatus::Pending);
}

#[tokio::test]
async fn chunk_only_mode_skips_extraction() {
    let services = Arc::new(MockServices::default());
    let config = IngestionConfig {
        chunk_only: true,
        ..IngestionConfig::default()
    };
    let (pipeline, storages) = pipeline_with(Arc::clone(&services), config);
    pipeline
        .enqueue("Acme builds Widget.", None, None)
        .await
        .expect("enqueue");

    let report = pipeline
        .process_pending(None, &CancellationToken::new())
        .await
        .expect("process");

    assert_eq!(report.outcomes[0].status, DocStatus::Processed);
    assert_eq!(services.calls().await, vec!["embed"]);
    assert!(storages.graph.all_nodes().await.expect("nodes").is_empty());
}

#[tokio::test]
async fn track_filter_limits_the_run() {
    let services = Arc::new(MockServices::default());
    let (pipeline, storages) = pipeline_with(Arc::clone(&services), IngestionConfig::default());
    let first = pipeline
        .enqueue("Acme builds Widget.", None, Some("batch-a"))
        .await
        .expect("enqueue a");
    let second = pipeline
        .enqueue("Globex sells Gadget.", None, Some("batch-b"))
        .await
        .expect("enqueue b");

    let report = pipeline
        .process_pending(Some("batch-b"), &CancellationToken::new())
        .await
        .expect("process");

    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].doc_id, second.doc_id);
    let untouched = storages
        .doc_status
        .get(&first.doc_id)
        .await
        .expect("get")
        .expect("record");
    assert_eq!(untouched.status, DocStatus::Pending);

    let status = pipeline.status();
    assert!(!status.busy);
    assert_eq!(status.docs, 1);
    assert!(status.latest_message.starts_with("processed 1 of 1"));
    assert!(status
        .history_messages
        .iter()
        .any(|message| message.contains(&second.doc_id)));
}
