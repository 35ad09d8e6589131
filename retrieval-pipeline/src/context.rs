use std::collections::HashMap;

use common::{
    error::AppError,
    storage::types::{
        knowledge_entity::KnowledgeEntity, knowledge_relationship::KnowledgeRelationship,
    },
    utils::tokenizer::count_tokens,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    answer_retrieval::render_system_prompt,
    pipeline::{ChunkSource, QueryParam, RetrievalTuning},
    reranking::RelevanceScorer,
    RetrievedChunk, RetrievedEntity, RetrievedRelation,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityContext {
    pub entity: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub description: String,
    pub file_path: String,
}

impl From<&KnowledgeEntity> for EntityContext {
    fn from(entity: &KnowledgeEntity) -> Self {
        Self {
            entity: entity.name.clone(),
            entity_type: entity.entity_type.clone(),
            description: entity.descriptions.join("\n"),
            file_path: entity.file_path.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationContext {
    pub entity1: String,
    pub entity2: String,
    pub keywords: String,
    pub description: String,
    pub weight: f32,
    pub file_path: String,
}

impl From<&KnowledgeRelationship> for RelationContext {
    fn from(relation: &KnowledgeRelationship) -> Self {
        Self {
            entity1: relation.src_id.clone(),
            entity2: relation.tgt_id.clone(),
            keywords: relation.keywords.join(", "),
            description: relation.descriptions.join("\n"),
            weight: relation.weight,
            file_path: relation.file_path.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkContext {
    pub reference_id: String,
    pub chunk_id: String,
    pub content: String,
    pub file_path: String,
    pub source: ChunkSource,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub reference_id: String,
    pub file_path: String,
}

/// What the model sees in the context document for a chunk.
#[derive(Serialize)]
struct ChunkRow<'a> {
    reference_id: &'a str,
    content: &'a str,
}

/// The serialized context plus the rows that made it in.
#[derive(Debug, Clone, Serialize)]
pub struct BuiltContext {
    pub entities: Vec<EntityContext>,
    pub relations: Vec<RelationContext>,
    pub chunks: Vec<ChunkContext>,
    pub references: Vec<Reference>,
    pub context_text: String,
    pub system_prompt: String,
    pub entity_tokens: usize,
    pub relation_tokens: usize,
    pub chunk_tokens: usize,
    /// System prompt plus query.
    pub total_tokens: usize,
}

/// Tokens of one serialized row as it appears in a section.
pub fn row_tokens<T: Serialize>(row: &T) -> Result<usize, AppError> {
    Ok(count_tokens(&serde_json::to_string(row)?)? + 1)
}

fn render_rows<T: Serialize>(rows: &[T]) -> Result<String, AppError> {
    Ok(rows
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()?
        .join("\n"))
}

fn section_tokens<T: Serialize>(rows: &[T]) -> Result<usize, AppError> {
    if rows.is_empty() {
        return Ok(0);
    }
    count_tokens(&render_rows(rows)?)
}

/// Pops rows from the tail until the rendered section fits `budget`.
fn fit_rows<T: Serialize>(rows: &mut Vec<T>, budget: usize) -> Result<usize, AppError> {
    loop {
        let tokens = section_tokens(rows)?;
        if tokens <= budget || rows.is_empty() {
            return Ok(tokens);
        }
        rows.pop();
    }
}

fn render_context(
    include_graph: bool,
    entities: &[EntityContext],
    relations: &[RelationContext],
    chunks: &[ChunkContext],
    references: &[Reference],
) -> Result<String, AppError> {
    let mut out = String::new();
    if include_graph {
        out.push_str("-----Entities(KG)-----\n\n```json\n");
        out.push_str(&render_rows(entities)?);
        out.push_str("\n```\n\n-----Relationships(KG)-----\n\n```json\n");
        out.push_str(&render_rows(relations)?);
        out.push_str("\n```\n\n");
    }
    let chunk_rows: Vec<ChunkRow<'_>> = chunks
        .iter()
        .map(|chunk| ChunkRow {
            reference_id: &chunk.reference_id,
            content: &chunk.content,
        })
        .collect();
    out.push_str("-----Document Chunks(DC)-----\n\n```json\n");
    out.push_str(&render_rows(&chunk_rows)?);
    out.push_str("\n```\n\n-----Reference Document List-----\n\n");
    let listed = references
        .iter()
        .map(|reference| format!("[{}] {}", reference.reference_id, reference.file_path))
        .collect::<Vec<_>>()
        .join("\n");
    out.push_str(&listed);
    Ok(out)
}

/// Numbers file paths by first appearance and stamps each chunk with its id.
fn assign_references(chunks: &mut [ChunkContext]) -> Vec<Reference> {
    let mut ids: HashMap<String, String> = HashMap::new();
    let mut references = Vec::new();
    for chunk in chunks.iter_mut() {
        let id = ids
            .entry(chunk.file_path.clone())
            .or_insert_with(|| {
                let id = (references.len() + 1).to_string();
                references.push(Reference {
                    reference_id: id.clone(),
                    file_path: chunk.file_path.clone(),
                });
                id
            })
            .clone();
        chunk.reference_id = id;
    }
    references
}

/// Assembles the context document under the request's token budgets.
pub struct ContextBuilder<'a> {
    param: &'a QueryParam,
    tuning: &'a RetrievalTuning,
    scorer: Option<&'a dyn RelevanceScorer>,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(
        param: &'a QueryParam,
        tuning: &'a RetrievalTuning,
        scorer: Option<&'a dyn RelevanceScorer>,
    ) -> Self {
        Self {
            param,
            tuning,
            scorer,
        }
    }

    fn prompt_tokens(&self, context: &str, query_tokens: usize) -> Result<(String, usize), AppError> {
        let system_prompt = render_system_prompt(context, self.param);
        let tokens = count_tokens(&system_prompt)? + query_tokens;
        Ok((system_prompt, tokens))
    }

    pub async fn build(
        &self,
        query: &str,
        entities: &[RetrievedEntity],
        relations: &[RetrievedRelation],
        chunks: Vec<RetrievedChunk>,
    ) -> Result<BuiltContext, AppError> {
        let include_graph = self.param.mode.needs_keywords();
        let max_total = self.param.max_total_tokens;
        let query_tokens = count_tokens(query)?;

        let (_, frame_tokens) = self.prompt_tokens(
            &render_context(include_graph, &[], &[], &[], &[])?,
            query_tokens,
        )?;
        let base = frame_tokens + self.tuning.safety_margin_tokens;
        if base > max_total {
            return Err(AppError::ResourceExhausted(format!(
                "token budget of {max_total} cannot fit the system prompt and query ({base} tokens)"
            )));
        }

        let mut entity_rows: Vec<EntityContext> = entities
            .iter()
            .map(|retrieved| EntityContext::from(&retrieved.entity))
            .collect();
        let mut relation_rows: Vec<RelationContext> = relations
            .iter()
            .map(|retrieved| RelationContext::from(&retrieved.relation))
            .collect();
        fit_rows(&mut entity_rows, self.param.max_entity_tokens)?;
        fit_rows(&mut relation_rows, self.param.max_relation_tokens)?;

        // Graph rows that leave no room under the total budget give way,
        // relations first.
        let graph_tokens = loop {
            let context = render_context(include_graph, &entity_rows, &relation_rows, &[], &[])?;
            let (_, tokens) = self.prompt_tokens(&context, query_tokens)?;
            if tokens + self.tuning.safety_margin_tokens <= max_total {
                break tokens;
            }
            if relation_rows.pop().is_none() && entity_rows.pop().is_none() {
                break tokens;
            }
        };

        let available = max_total.saturating_sub(graph_tokens + self.tuning.safety_margin_tokens);
        let ranked = self.rerank(query, chunks).await;
        let mut selected = Vec::new();
        let mut used = 0usize;
        // Only the token budget ends the selection; top-k already bounded each source.
        for retrieved in ranked {
            let cost = row_tokens(&ChunkRow {
                reference_id: "",
                content: &retrieved.chunk.content,
            })?;
            if used + cost > available {
                break;
            }
            used += cost;
            selected.push(ChunkContext {
                reference_id: String::new(),
                chunk_id: retrieved.chunk.id,
                content: retrieved.chunk.content,
                file_path: retrieved.chunk.file_path,
                source: retrieved.source,
                score: retrieved.score,
            });
        }

        let (references, context_text, system_prompt, total_tokens) = loop {
            let references = assign_references(&mut selected);
            let context_text =
                render_context(include_graph, &entity_rows, &relation_rows, &selected, &references)?;
            let (system_prompt, total) = self.prompt_tokens(&context_text, query_tokens)?;
            if total <= max_total || selected.is_empty() {
                break (references, context_text, system_prompt, total);
            }
            selected.pop();
        };
        if total_tokens > max_total {
            return Err(AppError::ResourceExhausted(format!(
                "context of {total_tokens} tokens exceeds the budget of {max_total}"
            )));
        }

        let chunk_rows: Vec<ChunkRow<'_>> = selected
            .iter()
            .map(|chunk| ChunkRow {
                reference_id: &chunk.reference_id,
                content: &chunk.content,
            })
            .collect();
        let built = BuiltContext {
            entity_tokens: section_tokens(&entity_rows)?,
            relation_tokens: section_tokens(&relation_rows)?,
            chunk_tokens: section_tokens(&chunk_rows)?,
            entities: entity_rows,
            relations: relation_rows,
            chunks: selected,
            references,
            context_text,
            system_prompt,
            total_tokens,
        };
        debug!(
            entities = built.entities.len(),
            relations = built.relations.len(),
            chunks = built.chunks.len(),
            references = built.references.len(),
            total_tokens = built.total_tokens,
            "context built"
        );
        Ok(built)
    }

    /// Reorders chunks by relevance when a scorer is configured. Scorer
    /// failures keep the merge order.
    async fn rerank(&self, query: &str, chunks: Vec<RetrievedChunk>) -> Vec<RetrievedChunk> {
        let Some(scorer) = self.scorer.filter(|_| self.param.enable_rerank) else {
            return chunks;
        };
        if chunks.len() < 2 {
            return chunks;
        }
        let documents = chunks.iter().map(|chunk| chunk.chunk.content.clone()).collect();
        match scorer.score(query, documents).await {
            Ok(scores) if scores.len() == chunks.len() => {
                let mut scored: Vec<(f32, RetrievedChunk)> = scores.into_iter().zip(chunks).collect();
                scored.sort_by(|a, b| b.0.total_cmp(&a.0));
                scored
                    .into_iter()
                    .map(|(score, mut chunk)| {
                        chunk.score = score;
                        chunk
                    })
                    .collect()
            }
            Ok(scores) => {
                warn!(
                    expected = chunks.len(),
                    received = scores.len(),
                    "reranker returned a mismatched score count; keeping merge order"
                );
                chunks
            }
            Err(err) => {
                warn!(error = %err, "reranking failed; keeping merge order");
                chunks
            }
        }
    }
}
