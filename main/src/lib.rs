#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

use std::{collections::BTreeMap, path::Path, sync::Arc};

use async_openai::{config::OpenAIConfig, Client};
use common::{
    error::AppError,
    storage::{
        types::{
            document::{DocStatus, DocumentRecord},
            knowledge_entity::KnowledgeEntity,
            knowledge_relationship::KnowledgeRelationship,
        },
        Storages,
    },
    utils::{
        config::AppConfig,
        embedding::EmbeddingProvider,
        limiter::PriorityLimiter,
        llm::{LanguageModel, LlmService, OpenAiLanguageModel},
        retry::RetryPolicy,
    },
};
use ingestion_pipeline::{
    extraction::{ExtractionConfig, Extractor},
    merger::{EntityUpdate, MergeConfig, Merger, RelationUpdate},
    DeletionCoordinator, DeletionResult, DeletionStatus, EnqueueResult, IngestionConfig,
    IngestionPipeline, PipelineStatusSnapshot, ProcessingReport,
};
use retrieval_pipeline::{
    reranking::RerankerPool, GraphExplorer, KnowledgeGraph, QueryData, QueryEngine, QueryParam,
    QueryResponse, RetrievalTuning,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// File extensions `insert_file` reads as plain UTF-8 text.
pub const TEXT_FILE_EXTENSIONS: [&str; 3] = ["txt", "md", "csv"];

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub workspace: String,
    pub storage: String,
    pub llm_model: String,
    pub embedding_backend: String,
    pub embedding_model: Option<String>,
    pub embedding_dimension: usize,
    pub nodes: usize,
    pub edges: usize,
    pub documents: BTreeMap<String, usize>,
    pub pipeline_busy: bool,
}

/// One engine instance bound to a workspace: ingestion, deletion, querying
/// and the admin views share the same stores and model services.
pub struct RagEngine {
    config: AppConfig,
    storages: Storages,
    llm: Arc<LlmService>,
    embedder: Arc<EmbeddingProvider>,
    merger: Arc<Merger>,
    ingestion: Arc<IngestionPipeline>,
    deletion: DeletionCoordinator,
    query_engine: QueryEngine,
    explorer: GraphExplorer,
}

impl RagEngine {
    /// Opens the configured stores and model backends.
    pub async fn from_config(config: AppConfig) -> Result<Self, AppError> {
        let storages = Storages::from_config(&config)
            .await?
            .with_retry(RetryPolicy::from_app_config(&config));
        storages.initialize().await?;

        let openai_client = Arc::new(Client::with_config(
            OpenAIConfig::new()
                .with_api_key(&config.openai_api_key)
                .with_api_base(&config.openai_base_url),
        ));
        let model: Arc<dyn LanguageModel> = Arc::new(OpenAiLanguageModel::from_config(
            Arc::clone(&openai_client),
            &config,
        ));
        let embedder =
            Arc::new(EmbeddingProvider::from_config(&config, Some(openai_client)).await?);
        info!(
            embedding_backend = embedder.backend_label(),
            embedding_dimension = embedder.dimension(),
            "Embedding provider initialized"
        );
        let reranker = RerankerPool::maybe_from_config(&config)?;

        Self::assemble(config, storages, model, embedder, reranker)
    }

    /// Builds an engine over caller-supplied stores and models. Store calls
    /// are retried on transient failure like those of [`Self::from_config`].
    pub fn with_components(
        config: AppConfig,
        storages: Storages,
        model: Arc<dyn LanguageModel>,
        embedder: Arc<EmbeddingProvider>,
    ) -> Result<Self, AppError> {
        let storages = storages.with_retry(RetryPolicy::from_app_config(&config));
        Self::assemble(config, storages, model, embedder, None)
    }

    fn assemble(
        config: AppConfig,
        storages: Storages,
        model: Arc<dyn LanguageModel>,
        embedder: Arc<EmbeddingProvider>,
        reranker: Option<Arc<RerankerPool>>,
    ) -> Result<Self, AppError> {
        let mut llm = LlmService::new(
            model,
            PriorityLimiter::new(config.llm_max_async),
            RetryPolicy::from_app_config(&config),
        );
        if config.enable_llm_cache {
            llm = llm.with_cache(Arc::clone(&storages.llm_cache));
        }
        let llm = Arc::new(llm);

        let merger = Arc::new(Merger::new(
            storages.clone(),
            Arc::clone(&llm),
            Arc::clone(&embedder),
            MergeConfig::from_app_config(&config),
        ));
        let ingestion = Arc::new(IngestionPipeline::new(
            storages.clone(),
            Extractor::new(Arc::clone(&llm), ExtractionConfig::from_app_config(&config)),
            Arc::clone(&merger),
            Arc::clone(&embedder),
            IngestionConfig::from_app_config(&config),
        )?);
        let deletion =
            DeletionCoordinator::new(storages.clone(), Arc::clone(&merger), ingestion.doc_locks());

        let mut query_engine = QueryEngine::new(
            storages.clone(),
            Arc::clone(&llm),
            Arc::clone(&embedder),
            RetrievalTuning::from_app_config(&config),
        );
        if let Some(pool) = reranker {
            query_engine = query_engine.with_scorer(pool);
        }
        let explorer = GraphExplorer::new(storages.clone());

        info!(
            workspace = %config.workspace,
            llm_model = llm.model_name(),
            "engine assembled"
        );
        Ok(Self {
            config,
            storages,
            llm,
            embedder,
            merger,
            ingestion,
            deletion,
            query_engine,
            explorer,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn storages(&self) -> &Storages {
        &self.storages
    }

    /// Shared handle for a background worker loop.
    pub fn ingestion(&self) -> Arc<IngestionPipeline> {
        Arc::clone(&self.ingestion)
    }

    /// Query options seeded from the engine configuration.
    pub fn default_query_param(&self) -> QueryParam {
        QueryParam::from_app_config(&self.config)
    }

    pub async fn enqueue(
        &self,
        text: &str,
        file_path: Option<&str>,
        track_id: Option<&str>,
    ) -> Result<EnqueueResult, AppError> {
        self.ingestion.enqueue(text, file_path, track_id).await
    }

    pub async fn enqueue_many(
        &self,
        documents: &[(String, Option<String>)],
        track_id: Option<&str>,
    ) -> Result<Vec<EnqueueResult>, AppError> {
        self.ingestion.enqueue_many(documents, track_id).await
    }

    /// Reads a text file and enqueues it under its path.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn insert_file(
        &self,
        path: &Path,
        track_id: Option<&str>,
    ) -> Result<EnqueueResult, AppError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !TEXT_FILE_EXTENSIONS.contains(&extension.as_str()) {
            return Err(AppError::Validation(format!(
                "unsupported file type '{extension}', expected one of {}",
                TEXT_FILE_EXTENSIONS.join(", ")
            )));
        }

        let bytes = tokio::fs::read(path).await?;
        let text = String::from_utf8(bytes).map_err(|err| {
            AppError::Validation(format!("{} is not valid UTF-8: {err}", path.display()))
        })?;
        let file_path = path.to_string_lossy();
        self.ingestion
            .enqueue(&text, Some(file_path.as_ref()), track_id)
            .await
    }

    pub async fn process_pending(
        &self,
        track_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ProcessingReport, AppError> {
        self.ingestion.process_pending(track_id, cancel).await
    }

    pub async fn query(&self, query: &str, param: &QueryParam) -> Result<QueryResponse, AppError> {
        self.query_engine.query(query, param).await
    }

    pub async fn query_data(&self, query: &str, param: &QueryParam) -> Result<QueryData, AppError> {
        self.query_engine.query_data(query, param).await
    }

    pub async fn delete_document(&self, doc_id: &str) -> DeletionResult {
        self.deletion.delete_document(doc_id).await
    }

    pub async fn edit_entity(
        &self,
        name: &str,
        update: EntityUpdate,
    ) -> Result<KnowledgeEntity, AppError> {
        self.merger.edit_entity(name, update).await
    }

    pub async fn edit_relation(
        &self,
        src: &str,
        tgt: &str,
        update: RelationUpdate,
    ) -> Result<KnowledgeRelationship, AppError> {
        self.merger.edit_relation(src, tgt, update).await
    }

    pub async fn knowledge_graph(
        &self,
        label: &str,
        max_depth: usize,
        max_nodes: usize,
    ) -> Result<KnowledgeGraph, AppError> {
        self.explorer.knowledge_graph(label, max_depth, max_nodes).await
    }

    pub async fn graph_labels(&self) -> Result<Vec<String>, AppError> {
        self.explorer.graph_labels().await
    }

    pub async fn search_entities(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeEntity>, AppError> {
        self.explorer.search_entities(query, limit).await
    }

    /// Document records, most recently updated first.
    pub async fn list_documents(
        &self,
        status: Option<DocStatus>,
    ) -> Result<Vec<DocumentRecord>, AppError> {
        let mut records = match status {
            Some(status) => self.storages.doc_status.by_status(status).await?,
            None => self.storages.doc_status.all().await?,
        };
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    pub async fn status_counts(&self) -> Result<BTreeMap<String, usize>, AppError> {
        Ok(self
            .storages
            .doc_status
            .status_counts()
            .await?
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), count))
            .collect())
    }

    pub fn pipeline_status(&self) -> PipelineStatusSnapshot {
        self.ingestion.status()
    }

    pub async fn health(&self) -> Result<HealthReport, AppError> {
        let nodes = self.storages.graph.all_nodes().await?.len();
        let edges = self.storages.graph.all_edges().await?.len();
        Ok(HealthReport {
            status: "healthy".to_string(),
            workspace: self.config.workspace.clone(),
            storage: format!("{:?}", self.config.storage).to_lowercase(),
            llm_model: self.llm.model_name().to_string(),
            embedding_backend: self.embedder.backend_label().to_string(),
            embedding_model: self.embedder.model_code(),
            embedding_dimension: self.embedder.dimension(),
            nodes,
            edges,
            documents: self.status_counts().await?,
            pipeline_busy: self.pipeline_status().busy,
        })
    }

    /// Deletes every known document through the regular deletion path.
    #[instrument(skip(self))]
    pub async fn clear_all(&self) -> Result<Vec<DeletionResult>, AppError> {
        let records = self.storages.doc_status.all().await?;
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let result = self.deletion.delete_document(&record.id).await;
            if result.status != DeletionStatus::Success {
                warn!(doc_id = %result.doc_id, message = %result.message, "document not cleared");
            }
            results.push(result);
        }
        info!(documents = results.len(), "workspace cleared");
        Ok(results)
    }

    pub async fn finalize(&self) -> Result<(), AppError> {
        self.storages.finalize().await
    }
}
