use std::collections::{HashMap, HashSet};

use common::{
    error::AppError,
    storage::{
        traits::{KeyValueStoreExt, VectorMatch},
        types::{knowledge_relationship::KnowledgeRelationship, text_chunk::TextChunk},
        Storages,
    },
    utils::{
        embedding::EmbeddingProvider, hashing::relation_pair, limiter::Priority, llm::LlmService,
    },
};
use serde_json::Value;
use state_machines::core::GuardError;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    context::{row_tokens, BuiltContext, ContextBuilder, EntityContext, RelationContext},
    keywords::{extract_keywords, QueryKeywords},
    reranking::RelevanceScorer,
    RetrievedChunk, RetrievedEntity, RetrievedRelation,
};

use super::{
    config::{ChunkSource, QueryParam, RetrievalTuning},
    fusion::{round_robin, truncate_by_tokens},
    state::{ContextBuilt, KeywordsExtracted, Merged, QueryMachine, Received, Retrieved, Truncated},
    PipelineStageTimings,
};

pub struct QueryContext<'a> {
    pub storages: &'a Storages,
    pub llm: &'a LlmService,
    pub embedder: &'a EmbeddingProvider,
    pub scorer: Option<&'a dyn RelevanceScorer>,
    pub tuning: &'a RetrievalTuning,
    pub param: &'a QueryParam,
    pub query: String,
    pub keywords: QueryKeywords,
    pub entities: Vec<RetrievedEntity>,
    pub relations: Vec<RetrievedRelation>,
    pub vector_chunks: Vec<RetrievedChunk>,
    pub chunks: Vec<RetrievedChunk>,
    pub context: Option<BuiltContext>,
    /// Set when a failing source was skipped under `allow_partial`.
    pub partial: bool,
    pub stage_timings: PipelineStageTimings,
}

impl<'a> QueryContext<'a> {
    pub fn new(
        storages: &'a Storages,
        llm: &'a LlmService,
        embedder: &'a EmbeddingProvider,
        scorer: Option<&'a dyn RelevanceScorer>,
        tuning: &'a RetrievalTuning,
        param: &'a QueryParam,
        query: &str,
    ) -> Self {
        Self {
            storages,
            llm,
            embedder,
            scorer,
            tuning,
            param,
            query: query.trim().to_string(),
            keywords: QueryKeywords::default(),
            entities: Vec::new(),
            relations: Vec::new(),
            vector_chunks: Vec::new(),
            chunks: Vec::new(),
            context: None,
            partial: false,
            stage_timings: PipelineStageTimings::default(),
        }
    }

    /// Turns a failed source into an empty one when the caller accepts
    /// partial results and the failure was transient.
    fn tolerate<T: Default>(&mut self, source: &str, result: Result<T, AppError>) -> Result<T, AppError> {
        match result {
            Ok(value) => Ok(value),
            Err(err) if self.param.allow_partial && err.is_transient() => {
                warn!(source, error = %err, "retrieval source failed; continuing with partial results");
                self.partial = true;
                Ok(T::default())
            }
            Err(err) => Err(err),
        }
    }

    pub fn abort(&self, err: AppError) -> AppError {
        error!(mode = %self.param.mode, error = %err, "query pipeline failed");
        err
    }
}

#[instrument(level = "trace", skip_all)]
pub async fn extract_query_keywords(
    machine: QueryMachine<(), Received>,
    ctx: &mut QueryContext<'_>,
) -> Result<QueryMachine<(), KeywordsExtracted>, AppError> {
    if ctx.param.mode.needs_keywords() {
        let keywords = if ctx.param.hl_keywords.is_empty() && ctx.param.ll_keywords.is_empty() {
            let extracted =
                extract_keywords(ctx.llm, &ctx.query, &ctx.param.conversation_history).await;
            ctx.tolerate("keywords", extracted)?
        } else {
            debug!("using caller-supplied keywords");
            QueryKeywords {
                high_level: ctx.param.hl_keywords.clone(),
                low_level: ctx.param.ll_keywords.clone(),
            }
        };
        ctx.keywords = keywords.or_query(&ctx.query);
        debug!(
            high_level = ?ctx.keywords.high_level,
            low_level = ?ctx.keywords.low_level,
            "query keywords ready"
        );
    }

    machine
        .extract_keywords()
        .map_err(|(_, guard)| map_guard_error("extract_keywords", &guard))
}

#[instrument(level = "trace", skip_all, fields(mode = %ctx.param.mode))]
pub async fn retrieve(
    machine: QueryMachine<(), KeywordsExtracted>,
    ctx: &mut QueryContext<'_>,
) -> Result<QueryMachine<(), Retrieved>, AppError> {
    let mode = ctx.param.mode;
    let (local, global, vector) = {
        let view: &QueryContext<'_> = ctx;
        tokio::join!(
            async {
                if mode.uses_entities() {
                    local_search(view).await
                } else {
                    Ok(GraphHits::default())
                }
            },
            async {
                if mode.uses_relations() {
                    global_search(view).await
                } else {
                    Ok(GraphHits::default())
                }
            },
            async {
                if mode.uses_vector_chunks() {
                    vector_chunk_search(view).await
                } else {
                    Ok(Vec::new())
                }
            },
        )
    };
    let local = ctx.tolerate("local", local)?;
    let global = ctx.tolerate("global", global)?;
    ctx.vector_chunks = ctx.tolerate("vector", vector)?;

    ctx.entities = round_robin(vec![local.entities, global.entities], |item| {
        item.entity.key.clone()
    });
    ctx.relations = round_robin(vec![local.relations, global.relations], |item| {
        item.relation.pair()
    });
    debug!(
        entities = ctx.entities.len(),
        relations = ctx.relations.len(),
        vector_chunks = ctx.vector_chunks.len(),
        "retrieval sources searched"
    );

    machine
        .retrieve()
        .map_err(|(_, guard)| map_guard_error("retrieve", &guard))
}

#[instrument(level = "trace", skip_all)]
pub fn truncate(
    machine: QueryMachine<(), Retrieved>,
    ctx: &mut QueryContext<'_>,
) -> Result<QueryMachine<(), Truncated>, AppError> {
    let entities_before = ctx.entities.len();
    let relations_before = ctx.relations.len();

    ctx.entities = truncate_by_tokens(
        std::mem::take(&mut ctx.entities),
        ctx.param.max_entity_tokens,
        |item| row_tokens(&EntityContext::from(&item.entity)),
    )?;
    ctx.relations = truncate_by_tokens(
        std::mem::take(&mut ctx.relations),
        ctx.param.max_relation_tokens,
        |item| row_tokens(&RelationContext::from(&item.relation)),
    )?;
    debug!(
        entities_before,
        entities = ctx.entities.len(),
        relations_before,
        relations = ctx.relations.len(),
        "graph rows truncated to token budgets"
    );

    machine
        .truncate()
        .map_err(|(_, guard)| map_guard_error("truncate", &guard))
}

#[instrument(level = "trace", skip_all)]
pub async fn merge_chunks(
    machine: QueryMachine<(), Truncated>,
    ctx: &mut QueryContext<'_>,
) -> Result<QueryMachine<(), Merged>, AppError> {
    let per_item = ctx.tuning.related_chunk_number;
    let entity_refs: Vec<(Vec<String>, f32)> = ctx
        .entities
        .iter()
        .map(|item| (leading_sources(&item.entity.source_ids, per_item), item.score))
        .collect();
    let relation_refs: Vec<(Vec<String>, f32)> = ctx
        .relations
        .iter()
        .map(|item| (leading_sources(&item.relation.source_ids, per_item), item.score))
        .collect();

    let mut wanted: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    for id in entity_refs.iter().chain(&relation_refs).flat_map(|(ids, _)| ids) {
        if seen.insert(id.as_str()) {
            wanted.push(id.clone());
        }
    }
    let loaded = ctx.storages.text_chunks.get_many_typed::<TextChunk>(&wanted).await;
    let loaded = ctx.tolerate("text_chunks", loaded)?;
    let by_id: HashMap<String, TextChunk> = loaded
        .into_iter()
        .flatten()
        .map(|chunk| (chunk.id.clone(), chunk))
        .collect();

    let resolve = |refs: &[(Vec<String>, f32)], source: ChunkSource| -> Vec<RetrievedChunk> {
        refs.iter()
            .flat_map(|(ids, score)| {
                ids.iter().filter_map(|id| {
                    by_id.get(id).map(|chunk| RetrievedChunk {
                        chunk: chunk.clone(),
                        score: *score,
                        source,
                    })
                })
            })
            .collect()
    };
    let mut by_source: HashMap<ChunkSource, Vec<RetrievedChunk>> = HashMap::from([
        (ChunkSource::Entity, resolve(&entity_refs, ChunkSource::Entity)),
        (ChunkSource::Relation, resolve(&relation_refs, ChunkSource::Relation)),
        (ChunkSource::Vector, std::mem::take(&mut ctx.vector_chunks)),
    ]);
    let ordered: Vec<Vec<RetrievedChunk>> = ctx
        .tuning
        .chunk_source_order
        .iter()
        .filter_map(|source| by_source.remove(source))
        .collect();

    ctx.chunks = round_robin(ordered, |item| item.chunk.id.clone());
    debug!(chunks = ctx.chunks.len(), "chunk sources merged");

    machine
        .merge_chunks()
        .map_err(|(_, guard)| map_guard_error("merge_chunks", &guard))
}

#[instrument(level = "trace", skip_all)]
pub async fn build_context(
    machine: QueryMachine<(), Merged>,
    ctx: &mut QueryContext<'_>,
) -> Result<QueryMachine<(), ContextBuilt>, AppError> {
    let chunks = std::mem::take(&mut ctx.chunks);
    let built = ContextBuilder::new(ctx.param, ctx.tuning, ctx.scorer)
        .build(&ctx.query, &ctx.entities, &ctx.relations, chunks)
        .await?;
    info!(
        mode = %ctx.param.mode,
        entities = built.entities.len(),
        relations = built.relations.len(),
        chunks = built.chunks.len(),
        total_tokens = built.total_tokens,
        partial = ctx.partial,
        "query context built"
    );
    ctx.context = Some(built);

    machine
        .build_context()
        .map_err(|(_, guard)| map_guard_error("build_context", &guard))
}

#[derive(Default)]
struct GraphHits {
    entities: Vec<RetrievedEntity>,
    relations: Vec<RetrievedRelation>,
}

/// Entities by low-level keywords, then the edges around them ranked by weight.
async fn local_search(ctx: &QueryContext<'_>) -> Result<GraphHits, AppError> {
    let text = ctx.keywords.low_level.join(", ");
    let embedding = ctx.embedder.embed(&text, Priority::High).await?;
    let matches = ctx
        .storages
        .entities_vdb
        .query(&embedding, ctx.param.top_k_entities, ctx.tuning.cosine_threshold)
        .await?;

    let scored: Vec<(String, f32)> = matches
        .iter()
        .filter_map(|hit| metadata_str(hit, "entity_key").map(|key| (key, hit.score)))
        .collect();
    let keys: Vec<String> = scored.iter().map(|(key, _)| key.clone()).collect();
    let mut nodes = ctx.storages.graph.get_nodes(&keys).await?;
    let entities: Vec<RetrievedEntity> = scored
        .into_iter()
        .filter_map(|(key, score)| {
            nodes
                .remove(&key)
                .map(|entity| RetrievedEntity { entity, score })
        })
        .collect();

    let mut pairs = Vec::new();
    let mut seen = HashSet::new();
    for item in &entities {
        for (a, b) in ctx.storages.graph.node_edges(&item.entity.key).await? {
            let pair = relation_pair(&a, &b);
            if seen.insert(pair.clone()) {
                pairs.push(pair);
            }
        }
    }
    let mut relations: Vec<RetrievedRelation> = ctx
        .storages
        .graph
        .get_edges(&pairs)
        .await?
        .into_iter()
        .map(|relation| RetrievedRelation {
            score: relation.weight,
            relation,
        })
        .collect();
    relations.sort_by(|a, b| b.relation.weight.total_cmp(&a.relation.weight));
    relations.truncate(ctx.param.top_k_relations);

    debug!(
        entities = entities.len(),
        relations = relations.len(),
        "local search finished"
    );
    Ok(GraphHits {
        entities,
        relations,
    })
}

/// Relations by high-level keywords, then their endpoints in relation order.
async fn global_search(ctx: &QueryContext<'_>) -> Result<GraphHits, AppError> {
    let text = ctx.keywords.high_level.join(", ");
    let embedding = ctx.embedder.embed(&text, Priority::High).await?;
    let matches = ctx
        .storages
        .relationships_vdb
        .query(&embedding, ctx.param.top_k_relations, ctx.tuning.cosine_threshold)
        .await?;

    let scored: Vec<((String, String), f32)> = matches
        .iter()
        .filter_map(|hit| {
            let src = metadata_str(hit, "src_id")?;
            let tgt = metadata_str(hit, "tgt_id")?;
            Some((relation_pair(&src, &tgt), hit.score))
        })
        .collect();
    let pairs: Vec<(String, String)> = scored.iter().map(|(pair, _)| pair.clone()).collect();
    let mut edges: HashMap<(String, String), KnowledgeRelationship> = ctx
        .storages
        .graph
        .get_edges(&pairs)
        .await?
        .into_iter()
        .map(|relation| (relation_pair(&relation.src_id, &relation.tgt_id), relation))
        .collect();
    let relations: Vec<RetrievedRelation> = scored
        .into_iter()
        .filter_map(|(pair, score)| {
            edges
                .remove(&pair)
                .map(|relation| RetrievedRelation { relation, score })
        })
        .collect();

    let mut endpoint_keys = Vec::new();
    let mut endpoint_scores = HashMap::new();
    for item in &relations {
        for key in [&item.relation.src_id, &item.relation.tgt_id] {
            if !endpoint_scores.contains_key(key) {
                endpoint_scores.insert(key.clone(), item.score);
                endpoint_keys.push(key.clone());
            }
        }
    }
    endpoint_keys.truncate(ctx.param.top_k_entities);
    let mut nodes = ctx.storages.graph.get_nodes(&endpoint_keys).await?;
    let entities: Vec<RetrievedEntity> = endpoint_keys
        .into_iter()
        .filter_map(|key| {
            let score = endpoint_scores.get(&key).copied().unwrap_or_default();
            nodes
                .remove(&key)
                .map(|entity| RetrievedEntity { entity, score })
        })
        .collect();

    debug!(
        entities = entities.len(),
        relations = relations.len(),
        "global search finished"
    );
    Ok(GraphHits {
        entities,
        relations,
    })
}

/// Chunks nearest to the raw query.
async fn vector_chunk_search(ctx: &QueryContext<'_>) -> Result<Vec<RetrievedChunk>, AppError> {
    let embedding = ctx.embedder.embed(&ctx.query, Priority::High).await?;
    let matches = ctx
        .storages
        .chunks_vdb
        .query(&embedding, ctx.param.chunk_top_k, ctx.tuning.cosine_threshold)
        .await?;
    let ids: Vec<String> = matches.iter().map(|hit| hit.id.clone()).collect();
    let chunks = ctx.storages.text_chunks.get_many_typed::<TextChunk>(&ids).await?;

    let found: Vec<RetrievedChunk> = matches
        .into_iter()
        .zip(chunks)
        .filter_map(|(hit, chunk)| {
            chunk.map(|chunk| RetrievedChunk {
                chunk,
                score: hit.score,
                source: ChunkSource::Vector,
            })
        })
        .collect();
    debug!(chunks = found.len(), "vector chunk search finished");
    Ok(found)
}

fn metadata_str(hit: &VectorMatch, field: &str) -> Option<String> {
    hit.metadata
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn leading_sources(source_ids: &[String], limit: usize) -> Vec<String> {
    source_ids.iter().take(limit).cloned().collect()
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid query pipeline transition during {event}: {guard:?}"
    ))
}
