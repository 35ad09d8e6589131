pub mod answer_retrieval;
pub mod context;
pub mod graph;
pub mod keywords;
pub mod pipeline;
pub mod reranking;

use std::sync::Arc;

use common::{
    error::AppError,
    storage::{
        types::{
            knowledge_entity::KnowledgeEntity, knowledge_relationship::KnowledgeRelationship,
            text_chunk::TextChunk,
        },
        Storages,
    },
    utils::{
        embedding::EmbeddingProvider,
        llm::{CompletionStream, LlmService},
    },
};
use serde::Serialize;
use tracing::{info, instrument};

use answer_retrieval::{
    create_answer_request, create_bypass_request, render_full_prompt, QUERY_CACHE_MODE,
};
use context::{BuiltContext, ChunkContext, EntityContext, Reference, RelationContext};
use reranking::RelevanceScorer;

pub use graph::{GraphExplorer, KnowledgeGraph};
pub use pipeline::{
    ChunkSource, PipelineStageTimings, QueryContext, QueryMode, QueryParam, RetrievalTuning,
};

/// Returned without a model call when retrieval found nothing to ground on.
pub const NO_CONTEXT_RESPONSE: &str =
    "Sorry, I'm not able to provide an answer to that question. [no-context]";

#[derive(Debug, Clone, Serialize)]
pub struct RetrievedEntity {
    pub entity: KnowledgeEntity,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievedRelation {
    pub relation: KnowledgeRelationship,
    pub score: f32,
}

// A context chunk plus the source that surfaced it first.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub chunk: TextChunk,
    pub score: f32,
    pub source: ChunkSource,
}

pub enum QueryResponse {
    Answer(String),
    Stream(CompletionStream),
    Context(String),
    Prompt(String),
}

impl std::fmt::Debug for QueryResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryResponse::Answer(text) => f.debug_tuple("Answer").field(text).finish(),
            QueryResponse::Stream(_) => f.write_str("Stream(..)"),
            QueryResponse::Context(text) => f.debug_tuple("Context").field(text).finish(),
            QueryResponse::Prompt(text) => f.debug_tuple("Prompt").field(text).finish(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryMetadata {
    pub mode: QueryMode,
    pub high_level_keywords: Vec<String>,
    pub low_level_keywords: Vec<String>,
    /// A failing source was skipped.
    pub partial: bool,
    pub entity_tokens: usize,
    pub relation_tokens: usize,
    pub chunk_tokens: usize,
    pub total_tokens: usize,
    pub stage_timings: PipelineStageTimings,
}

/// Retrieval output without generation.
#[derive(Debug, Clone, Serialize)]
pub struct QueryData {
    pub entities: Vec<EntityContext>,
    pub relations: Vec<RelationContext>,
    pub chunks: Vec<ChunkContext>,
    pub references: Vec<Reference>,
    pub metadata: QueryMetadata,
}

/// Answers questions over the stored knowledge graph and chunks.
pub struct QueryEngine {
    storages: Storages,
    llm: Arc<LlmService>,
    embedder: Arc<EmbeddingProvider>,
    tuning: RetrievalTuning,
    scorer: Option<Arc<dyn RelevanceScorer>>,
}

impl QueryEngine {
    pub fn new(
        storages: Storages,
        llm: Arc<LlmService>,
        embedder: Arc<EmbeddingProvider>,
        tuning: RetrievalTuning,
    ) -> Self {
        Self {
            storages,
            llm,
            embedder,
            tuning,
            scorer: None,
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn RelevanceScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    #[instrument(skip_all, fields(mode = %param.mode))]
    pub async fn query(&self, query: &str, param: &QueryParam) -> Result<QueryResponse, AppError> {
        validate_query(query)?;

        if param.mode == QueryMode::Bypass {
            let _bypassed = pipeline::bypass()?;
            let request = create_bypass_request(query, param);
            info!("bypassing retrieval");
            return if param.stream {
                Ok(QueryResponse::Stream(self.llm.complete_stream(&request).await?))
            } else {
                Ok(QueryResponse::Answer(self.llm.complete(&request).await?))
            };
        }

        let (machine, built, _) = self.retrieve(query, param).await?;

        if param.only_need_context {
            return Ok(QueryResponse::Context(built.context_text));
        }
        if param.only_need_prompt {
            return Ok(QueryResponse::Prompt(render_full_prompt(
                &built.system_prompt,
                query,
            )));
        }
        if built.entities.is_empty() && built.relations.is_empty() && built.chunks.is_empty() {
            info!("no context retrieved; answering without the model");
            return Ok(QueryResponse::Answer(NO_CONTEXT_RESPONSE.to_string()));
        }

        let request = create_answer_request(built.system_prompt, query, param);
        let response = if param.stream {
            QueryResponse::Stream(self.llm.complete_stream(&request).await?)
        } else {
            QueryResponse::Answer(self.llm.complete_cached(QUERY_CACHE_MODE, &request).await?)
        };
        let _answered = pipeline::mark_answered(machine)?;
        Ok(response)
    }

    /// Retrieval only; never calls the model for generation.
    #[instrument(skip_all, fields(mode = %param.mode))]
    pub async fn query_data(&self, query: &str, param: &QueryParam) -> Result<QueryData, AppError> {
        validate_query(query)?;
        if param.mode == QueryMode::Bypass {
            return Err(AppError::Validation(
                "bypass mode performs no retrieval".to_string(),
            ));
        }

        let (_, built, metadata) = self.retrieve(query, param).await?;
        Ok(QueryData {
            entities: built.entities,
            relations: built.relations,
            chunks: built.chunks,
            references: built.references,
            metadata,
        })
    }

    async fn retrieve(
        &self,
        query: &str,
        param: &QueryParam,
    ) -> Result<
        (
            pipeline::QueryMachine<(), pipeline::ContextBuilt>,
            BuiltContext,
            QueryMetadata,
        ),
        AppError,
    > {
        let mut ctx = QueryContext::new(
            &self.storages,
            &self.llm,
            &self.embedder,
            self.scorer.as_deref(),
            &self.tuning,
            param,
            query,
        );
        let machine = pipeline::run_pipeline(&mut ctx).await?;
        let built = ctx.context.take().ok_or_else(|| {
            AppError::InternalError("query pipeline finished without a context".to_string())
        })?;
        let metadata = QueryMetadata {
            mode: param.mode,
            high_level_keywords: ctx.keywords.high_level.clone(),
            low_level_keywords: ctx.keywords.low_level.clone(),
            partial: ctx.partial,
            entity_tokens: built.entity_tokens,
            relation_tokens: built.relation_tokens,
            chunk_tokens: built.chunk_tokens,
            total_tokens: built.total_tokens,
            stage_timings: ctx.stage_timings.clone(),
        };
        Ok((machine, built, metadata))
    }
}

fn validate_query(query: &str) -> Result<(), AppError> {
    if query.trim().is_empty() {
        return Err(AppError::Validation("query text is empty".to_string()));
    }
    Ok(())
}
