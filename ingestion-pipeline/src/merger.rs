use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use chrono::Utc;
use common::{
    error::AppError,
    storage::{
        traits::{KeyValueStoreExt, VectorRecord},
        types::{
            knowledge_entity::KnowledgeEntity, knowledge_relationship::KnowledgeRelationship,
        },
        Storages,
    },
    utils::{
        config::{AppConfig, SourceIdsLimitMethod},
        embedding::EmbeddingProvider,
        hashing::{entity_key, entity_vector_id, relation_pair, relation_vector_id},
        limiter::Priority,
        llm::{CompletionRequest, LlmService},
        locks::KeyedLocks,
        tokenizer::count_tokens,
    },
};
use futures::{future::BoxFuture, stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    extraction::{ChunkExtraction, UNKNOWN_ENTITY_TYPE},
    utils::llm_instructions::{summary_prompt, SUMMARY_SYSTEM_MESSAGE},
};

pub const SUMMARY_CACHE_MODE: &str = "summary";

#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Fragment count that forces a summary.
    pub force_llm_summary_on_merge: usize,
    /// Token total above which descriptions are summarized.
    pub summary_max_tokens: usize,
    /// Token budget of one summarization call.
    pub summary_context_size: usize,
    pub summary_language: String,
    pub max_source_ids_per_entity: usize,
    pub max_source_ids_per_relation: usize,
    pub source_ids_limit_method: SourceIdsLimitMethod,
    pub concurrency: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

impl MergeConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            force_llm_summary_on_merge: config.force_llm_summary_on_merge,
            summary_max_tokens: config.summary_max_tokens,
            summary_context_size: config.summary_context_size,
            summary_language: config.summary_language.clone(),
            max_source_ids_per_entity: config.max_source_ids_per_entity,
            max_source_ids_per_relation: config.max_source_ids_per_relation,
            source_ids_limit_method: config.source_ids_limit_method,
            concurrency: config.chunk_concurrency.max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeFailure {
    pub target: String,
    pub error: String,
}

/// Aggregate result of one merge batch. Failures are per entity or relation
/// and never abort the rest of the batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeOutcome {
    pub entities_merged: usize,
    pub relations_merged: usize,
    pub unchanged: usize,
    /// Relations skipped because an endpoint no longer exists.
    pub skipped_relations: usize,
    pub cancelled: usize,
    pub failed: Vec<MergeFailure>,
}

impl MergeOutcome {
    pub fn applied(&self) -> usize {
        self.entities_merged + self.relations_merged
    }

    fn record(&mut self, result: ItemResult, is_entity: bool) {
        match result {
            ItemResult::Merged if is_entity => self.entities_merged += 1,
            ItemResult::Merged => self.relations_merged += 1,
            ItemResult::Unchanged => self.unchanged += 1,
            ItemResult::Skipped => self.skipped_relations += 1,
            ItemResult::Cancelled => self.cancelled += 1,
            ItemResult::Failed(failure) => self.failed.push(failure),
        }
    }
}

enum ItemResult {
    Merged,
    Unchanged,
    Skipped,
    Cancelled,
    Failed(MergeFailure),
}

#[derive(Debug, Clone)]
struct EntityEvidence {
    chunk_id: String,
    doc_id: String,
    file_path: String,
    name: String,
    entity_type: String,
    description: String,
}

#[derive(Debug, Clone)]
struct RelationEvidence {
    chunk_id: String,
    doc_id: String,
    file_path: String,
    source: String,
    target: String,
    description: String,
    keywords: Vec<String>,
    strength: f32,
}

/// Groups entity evidence by key. Relation endpoints a chunk never named as
/// entities become implicit `UNKNOWN` entities carrying the relation text.
fn entity_evidence(extractions: &[ChunkExtraction]) -> BTreeMap<String, Vec<EntityEvidence>> {
    let mut groups: BTreeMap<String, Vec<EntityEvidence>> = BTreeMap::new();
    for extraction in extractions {
        let mut named: HashSet<String> = HashSet::new();
        for entity in &extraction.entities {
            let key = entity.key();
            named.insert(key.clone());
            groups.entry(key).or_default().push(EntityEvidence {
                chunk_id: extraction.chunk_id.clone(),
                doc_id: extraction.full_doc_id.clone(),
                file_path: extraction.file_path.clone(),
                name: entity.name.clone(),
                entity_type: entity.entity_type.clone(),
                description: entity.description.clone(),
            });
        }
        for relation in &extraction.relations {
            for endpoint in [&relation.source, &relation.target] {
                let key = entity_key(endpoint);
                if !named.insert(key.clone()) {
                    continue;
                }
                groups.entry(key).or_default().push(EntityEvidence {
                    chunk_id: extraction.chunk_id.clone(),
                    doc_id: extraction.full_doc_id.clone(),
                    file_path: extraction.file_path.clone(),
                    name: endpoint.trim().to_string(),
                    entity_type: UNKNOWN_ENTITY_TYPE.to_string(),
                    description: relation.description.clone(),
                });
            }
        }
    }
    groups
}

fn relation_evidence(
    extractions: &[ChunkExtraction],
) -> BTreeMap<(String, String), Vec<RelationEvidence>> {
    let mut groups: BTreeMap<(String, String), Vec<RelationEvidence>> = BTreeMap::new();
    for extraction in extractions {
        for relation in &extraction.relations {
            groups.entry(relation.pair()).or_default().push(RelationEvidence {
                chunk_id: extraction.chunk_id.clone(),
                doc_id: extraction.full_doc_id.clone(),
                file_path: extraction.file_path.clone(),
                source: relation.source.trim().to_string(),
                target: relation.target.trim().to_string(),
                description: relation.description.clone(),
                keywords: relation.keywords.clone(),
                strength: relation.strength,
            });
        }
    }
    groups
}

/// Unions `incoming` into `existing` and applies the retention cap.
pub fn limit_source_ids(
    existing: &[String],
    incoming: &[String],
    cap: usize,
    method: SourceIdsLimitMethod,
) -> Vec<String> {
    let mut merged: Vec<String> = existing.to_vec();
    let mut seen: HashSet<String> = merged.iter().cloned().collect();
    for id in incoming {
        if seen.insert(id.clone()) {
            merged.push(id.clone());
        }
    }
    let cap = cap.max(1);
    if merged.len() > cap {
        match method {
            SourceIdsLimitMethod::Keep => merged.truncate(cap),
            SourceIdsLimitMethod::Fifo => {
                merged.drain(..merged.len() - cap);
            }
        }
    }
    merged
}

fn union_strings<'a>(base: &'a [String], extra: impl IntoIterator<Item = &'a String>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    base.iter()
        .chain(extra)
        .map(|item| item.trim())
        .filter(|item| !item.is_empty() && seen.insert(item.to_string()))
        .map(str::to_string)
        .collect()
}

/// Most frequent concrete type; ties go to the first seen.
fn majority_type<'a>(votes: impl IntoIterator<Item = &'a str>) -> String {
    let mut tally: Vec<(&str, usize)> = Vec::new();
    for vote in votes {
        if vote == UNKNOWN_ENTITY_TYPE {
            continue;
        }
        match tally.iter_mut().find(|(ty, _)| *ty == vote) {
            Some((_, count)) => *count += 1,
            None => tally.push((vote, 1)),
        }
    }
    let mut best: Option<(&str, usize)> = None;
    for (ty, count) in tally {
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((ty, count));
        }
    }
    best.map_or_else(|| UNKNOWN_ENTITY_TYPE.to_string(), |(ty, _)| ty.to_string())
}

/// Lowest document id wins, so provenance does not depend on merge order.
fn pick_provenance<'a>(
    current: (&'a str, &'a str),
    candidates: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> (String, String) {
    let mut best = current;
    for candidate in candidates {
        if best.0.is_empty() || candidate.0 < best.0 {
            best = candidate;
        }
    }
    (best.0.to_string(), best.1.to_string())
}

fn token_total(items: &[String]) -> Result<usize, AppError> {
    let mut total = 0;
    for item in items {
        total += count_tokens(item)?;
    }
    Ok(total)
}

/// Groups items under `budget` tokens. Every group but the last holds at
/// least two items so each reduction round shrinks the input.
fn batch_by_tokens(items: Vec<String>, budget: usize) -> Result<Vec<Vec<String>>, AppError> {
    let mut groups = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_tokens = 0;
    for item in items {
        let tokens = count_tokens(&item)?;
        if current.len() >= 2 && current_tokens + tokens > budget {
            groups.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += tokens;
        current.push(item);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    Ok(groups)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub description: Option<String>,
    pub entity_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationUpdate {
    pub description: Option<String>,
    pub keywords: Option<Vec<String>>,
    pub weight: Option<f32>,
}

fn entity_lock_key(key: &str) -> String {
    format!("entity:{key}")
}

fn relation_lock_key(src: &str, tgt: &str) -> String {
    format!("relation:{src}\u{1f}{tgt}")
}

/// Folds extractions into the shared graph and vector indexes. Every write
/// to one entity or relation happens under that identity's lock.
pub struct Merger {
    storages: Storages,
    llm: Arc<LlmService>,
    embedder: Arc<EmbeddingProvider>,
    locks: KeyedLocks,
    config: MergeConfig,
}

impl Merger {
    pub fn new(
        storages: Storages,
        llm: Arc<LlmService>,
        embedder: Arc<EmbeddingProvider>,
        config: MergeConfig,
    ) -> Self {
        Self {
            storages,
            llm,
            embedder,
            locks: KeyedLocks::new(),
            config,
        }
    }

    /// Merges a batch: every entity first, then every relation.
    #[instrument(level = "debug", skip_all, fields(chunks = extractions.len()))]
    pub async fn merge(
        &self,
        extractions: &[ChunkExtraction],
        cancel: &CancellationToken,
    ) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        let entity_results: Vec<ItemResult> = stream::iter(entity_evidence(extractions))
            .map(|(key, evidence)| self.merge_entity(key, evidence, cancel))
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;
        for result in entity_results {
            outcome.record(result, true);
        }

        let relation_results: Vec<ItemResult> = stream::iter(relation_evidence(extractions))
            .map(|(pair, evidence)| self.merge_relation(pair, evidence, cancel))
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;
        for result in relation_results {
            outcome.record(result, false);
        }

        info!(
            entities = outcome.entities_merged,
            relations = outcome.relations_merged,
            unchanged = outcome.unchanged,
            skipped = outcome.skipped_relations,
            failed = outcome.failed.len(),
            "merge batch applied"
        );
        outcome
    }

    async fn merge_entity(
        &self,
        key: String,
        evidence: Vec<EntityEvidence>,
        cancel: &CancellationToken,
    ) -> ItemResult {
        if cancel.is_cancelled() {
            return ItemResult::Cancelled;
        }
        let _guard = self.locks.lock(&entity_lock_key(&key)).await;
        match self.apply_entity_evidence(&key, evidence).await {
            Ok(true) => ItemResult::Merged,
            Ok(false) => ItemResult::Unchanged,
            Err(err) => {
                warn!(entity = %key, error = %err, "entity merge failed; prior state kept");
                ItemResult::Failed(MergeFailure {
                    target: key,
                    error: err.to_string(),
                })
            }
        }
    }

    async fn apply_entity_evidence(
        &self,
        key: &str,
        evidence: Vec<EntityEvidence>,
    ) -> Result<bool, AppError> {
        let existing = self.storages.graph.get_node(key).await?;
        let existing_sources = existing
            .as_ref()
            .map(|entity| entity.source_ids.clone())
            .unwrap_or_default();
        let known: HashSet<&str> = existing_sources.iter().map(String::as_str).collect();

        let incoming: Vec<String> = evidence
            .iter()
            .filter(|item| !known.contains(item.chunk_id.as_str()))
            .map(|item| item.chunk_id.clone())
            .collect();
        if incoming.is_empty() {
            return Ok(false);
        }
        let retained = limit_source_ids(
            &existing_sources,
            &incoming,
            self.config.max_source_ids_per_entity,
            self.config.source_ids_limit_method,
        );
        let retained_set: HashSet<&str> = retained.iter().map(String::as_str).collect();
        let fresh: Vec<&EntityEvidence> = evidence
            .iter()
            .filter(|item| {
                !known.contains(item.chunk_id.as_str())
                    && retained_set.contains(item.chunk_id.as_str())
            })
            .collect();
        let Some(first) = fresh.first() else {
            return Ok(false);
        };

        let is_new = existing.is_none();
        let mut entity = existing
            .unwrap_or_else(|| KnowledgeEntity::new(&first.name, UNKNOWN_ENTITY_TYPE.into()));

        let prior_type = (!is_new).then_some(entity.entity_type.as_str());
        entity.entity_type = majority_type(
            prior_type
                .into_iter()
                .chain(fresh.iter().map(|item| item.entity_type.as_str())),
        );
        let descriptions =
            union_strings(&entity.descriptions, fresh.iter().map(|item| &item.description));
        entity.descriptions = self.condense("entity", &entity.name, descriptions).await?;
        entity.source_ids = retained.clone();
        let (doc_id, file_path) = pick_provenance(
            (entity.provenance_doc_id.as_str(), entity.file_path.as_str()),
            fresh
                .iter()
                .map(|item| (item.doc_id.as_str(), item.file_path.as_str())),
        );
        entity.provenance_doc_id = doc_id;
        entity.file_path = file_path;
        entity.updated_at = Utc::now();

        debug!(entity = %key, is_new, sources = entity.source_ids.len(), "merging entity");
        self.persist_entity(entity).await?;
        Ok(true)
    }

    async fn merge_relation(
        &self,
        pair: (String, String),
        evidence: Vec<RelationEvidence>,
        cancel: &CancellationToken,
    ) -> ItemResult {
        if cancel.is_cancelled() {
            return ItemResult::Cancelled;
        }
        let (src, tgt) = pair;
        let _guard = self.locks.lock(&relation_lock_key(&src, &tgt)).await;
        match self.apply_relation_evidence(&src, &tgt, evidence).await {
            Ok(Some(true)) => ItemResult::Merged,
            Ok(Some(false)) => ItemResult::Unchanged,
            Ok(None) => ItemResult::Skipped,
            Err(err) => {
                warn!(source = %src, target = %tgt, error = %err, "relation merge failed; prior state kept");
                ItemResult::Failed(MergeFailure {
                    target: format!("{src} -> {tgt}"),
                    error: err.to_string(),
                })
            }
        }
    }

    /// `None` when an endpoint is gone and the merge is a no-op.
    async fn apply_relation_evidence(
        &self,
        src: &str,
        tgt: &str,
        evidence: Vec<RelationEvidence>,
    ) -> Result<Option<bool>, AppError> {
        if !self.storages.graph.has_node(src).await? || !self.storages.graph.has_node(tgt).await? {
            let err = AppError::Consistency(format!("relation {src} -> {tgt} lost an endpoint"));
            warn!(error = %err, "skipping relation merge");
            return Ok(None);
        }

        let existing = self.storages.graph.get_edge(src, tgt).await?;
        let existing_sources = existing
            .as_ref()
            .map(|relation| relation.source_ids.clone())
            .unwrap_or_default();
        let known: HashSet<&str> = existing_sources.iter().map(String::as_str).collect();

        let incoming: Vec<String> = evidence
            .iter()
            .filter(|item| !known.contains(item.chunk_id.as_str()))
            .map(|item| item.chunk_id.clone())
            .collect();
        if incoming.is_empty() {
            return Ok(Some(false));
        }
        let retained = limit_source_ids(
            &existing_sources,
            &incoming,
            self.config.max_source_ids_per_relation,
            self.config.source_ids_limit_method,
        );
        let retained_set: HashSet<&str> = retained.iter().map(String::as_str).collect();
        let fresh: Vec<&RelationEvidence> = evidence
            .iter()
            .filter(|item| {
                !known.contains(item.chunk_id.as_str())
                    && retained_set.contains(item.chunk_id.as_str())
            })
            .collect();
        let Some(first) = fresh.first() else {
            return Ok(Some(false));
        };

        let label = format!("{} and {}", first.source, first.target);
        let mut relation = existing.unwrap_or_else(|| KnowledgeRelationship::new(src, tgt));
        relation.weight += fresh.iter().map(|item| item.strength).sum::<f32>();
        relation.keywords = union_strings(
            &relation.keywords,
            fresh.iter().flat_map(|item| item.keywords.iter()),
        );
        let descriptions =
            union_strings(&relation.descriptions, fresh.iter().map(|item| &item.description));
        relation.descriptions = self.condense("relationship", &label, descriptions).await?;
        relation.source_ids = retained.clone();
        let (doc_id, file_path) = pick_provenance(
            (relation.provenance_doc_id.as_str(), relation.file_path.as_str()),
            fresh
                .iter()
                .map(|item| (item.doc_id.as_str(), item.file_path.as_str())),
        );
        relation.provenance_doc_id = doc_id;
        relation.file_path = file_path;
        relation.updated_at = Utc::now();

        self.persist_relation(relation).await?;
        Ok(Some(true))
    }

    /// Summarizes once the evidence passes the fragment or token threshold.
    async fn condense(
        &self,
        kind: &str,
        name: &str,
        descriptions: Vec<String>,
    ) -> Result<Vec<String>, AppError> {
        if descriptions.is_empty() {
            return Ok(descriptions);
        }
        let tokens = token_total(&descriptions)?;
        if descriptions.len() < self.config.force_llm_summary_on_merge
            && tokens <= self.config.summary_max_tokens
        {
            return Ok(descriptions);
        }
        debug!(kind, name, fragments = descriptions.len(), tokens, "summarizing descriptions");
        let summary = self.reduce(kind, name, descriptions).await?;
        Ok(vec![summary])
    }

    /// Map-reduce summary: items that fit one call are summarized directly;
    /// otherwise each token-bounded batch is summarized and the partial
    /// summaries are reduced again.
    fn reduce<'a>(
        &'a self,
        kind: &'a str,
        name: &'a str,
        items: Vec<String>,
    ) -> BoxFuture<'a, Result<String, AppError>> {
        Box::pin(async move {
            if items.len() <= 2 || token_total(&items)? <= self.config.summary_context_size {
                return self.summarize_once(kind, name, &items).await;
            }
            let groups = batch_by_tokens(items, self.config.summary_context_size)?;
            let mut partials = Vec::with_capacity(groups.len());
            for group in groups {
                if group.len() == 1 {
                    partials.extend(group);
                } else {
                    partials.push(self.summarize_once(kind, name, &group).await?);
                }
            }
            self.reduce(kind, name, partials).await
        })
    }

    async fn summarize_once(
        &self,
        kind: &str,
        name: &str,
        items: &[String],
    ) -> Result<String, AppError> {
        let request = CompletionRequest::new(summary_prompt(
            kind,
            name,
            &self.config.summary_language,
            items,
        ))
        .with_system(SUMMARY_SYSTEM_MESSAGE)
        .with_priority(Priority::Normal);
        let summary = self.llm.complete_cached(SUMMARY_CACHE_MODE, &request).await?;
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(AppError::LLMParsing(format!(
                "empty summary returned for {kind} {name}"
            )));
        }
        Ok(summary.to_string())
    }

    /// Embeds before writing so a failed embedding leaves the node untouched.
    async fn persist_entity(&self, entity: KnowledgeEntity) -> Result<(), AppError> {
        let content = entity.embedding_content();
        let embedding = self.embedder.embed(&content, Priority::Low).await?;
        let record = VectorRecord {
            id: entity_vector_id(&entity.key),
            embedding,
            content,
            metadata: json!({
                "entity_key": entity.key,
                "entity_name": entity.name,
                "entity_type": entity.entity_type,
                "source_ids": entity.source_ids,
                "file_path": entity.file_path,
            }),
        };
        self.storages.graph.upsert_node(entity).await?;
        self.storages.entities_vdb.upsert(vec![record]).await
    }

    async fn persist_relation(&self, relation: KnowledgeRelationship) -> Result<(), AppError> {
        let content = relation.embedding_content();
        let embedding = self.embedder.embed(&content, Priority::Low).await?;
        let record = VectorRecord {
            id: relation_vector_id(&relation.src_id, &relation.tgt_id),
            embedding,
            content,
            metadata: json!({
                "src_id": relation.src_id,
                "tgt_id": relation.tgt_id,
                "keywords": relation.keywords,
                "weight": relation.weight,
                "source_ids": relation.source_ids,
                "file_path": relation.file_path,
            }),
        };
        self.storages.graph.upsert_edge(relation).await?;
        self.storages.relationships_vdb.upsert(vec![record]).await
    }

    async fn load_extractions(&self, chunk_ids: &[String]) -> Result<Vec<ChunkExtraction>, AppError> {
        Ok(self
            .storages
            .chunk_extractions
            .get_many_typed::<ChunkExtraction>(chunk_ids)
            .await?
            .into_iter()
            .flatten()
            .collect())
    }

    /// Recomputes an entity from the stored extractions of `remaining`
    /// chunks. Without stored extractions the descriptions are kept and only
    /// the source set shrinks.
    #[instrument(level = "debug", skip(self, remaining), fields(remaining = remaining.len()))]
    pub async fn rebuild_entity(&self, key: &str, remaining: Vec<String>) -> Result<(), AppError> {
        let _guard = self.locks.lock(&entity_lock_key(key)).await;
        let Some(mut entity) = self.storages.graph.get_node(key).await? else {
            return Ok(());
        };
        let extractions = self.load_extractions(&remaining).await?;
        let evidence = entity_evidence(&extractions).remove(key).unwrap_or_default();

        if evidence.is_empty() {
            debug!(
                entity = %key,
                descriptions = entity.descriptions.len(),
                "no stored extraction covers the remaining sources; descriptions kept"
            );
        } else {
            entity.entity_type =
                majority_type(evidence.iter().map(|item| item.entity_type.as_str()));
            let descriptions = union_strings(&[], evidence.iter().map(|item| &item.description));
            entity.descriptions = self.condense("entity", &entity.name, descriptions).await?;
            let (doc_id, file_path) = pick_provenance(
                ("", ""),
                evidence
                    .iter()
                    .map(|item| (item.doc_id.as_str(), item.file_path.as_str())),
            );
            entity.provenance_doc_id = doc_id;
            entity.file_path = file_path;
        }
        entity.source_ids = remaining;
        entity.updated_at = Utc::now();
        self.persist_entity(entity).await
    }

    #[instrument(level = "debug", skip(self, remaining), fields(remaining = remaining.len()))]
    pub async fn rebuild_relation(
        &self,
        src: &str,
        tgt: &str,
        remaining: Vec<String>,
    ) -> Result<(), AppError> {
        let (src, tgt) = relation_pair(src, tgt);
        let _guard = self.locks.lock(&relation_lock_key(&src, &tgt)).await;
        let Some(mut relation) = self.storages.graph.get_edge(&src, &tgt).await? else {
            return Ok(());
        };
        let extractions = self.load_extractions(&remaining).await?;
        let evidence = relation_evidence(&extractions)
            .remove(&(src.clone(), tgt.clone()))
            .unwrap_or_default();

        if evidence.is_empty() {
            debug!(
                %src,
                %tgt,
                "no stored extraction covers the remaining sources; descriptions kept"
            );
        }
        if let Some(first) = evidence.first() {
            let label = format!("{} and {}", first.source, first.target);
            relation.weight = evidence.iter().map(|item| item.strength).sum();
            relation.keywords =
                union_strings(&[], evidence.iter().flat_map(|item| item.keywords.iter()));
            let descriptions = union_strings(&[], evidence.iter().map(|item| &item.description));
            relation.descriptions = self.condense("relationship", &label, descriptions).await?;
            let (doc_id, file_path) = pick_provenance(
                ("", ""),
                evidence
                    .iter()
                    .map(|item| (item.doc_id.as_str(), item.file_path.as_str())),
            );
            relation.provenance_doc_id = doc_id;
            relation.file_path = file_path;
        }
        relation.source_ids = remaining;
        relation.updated_at = Utc::now();
        self.persist_relation(relation).await
    }

    /// Drops an entity, its incident relations, and their vectors.
    pub async fn remove_entity(&self, key: &str) -> Result<(), AppError> {
        let _guard = self.locks.lock(&entity_lock_key(key)).await;
        let incident = self.storages.graph.node_edges(key).await?;
        let vector_ids: Vec<String> = incident
            .iter()
            .map(|(src, tgt)| relation_vector_id(src, tgt))
            .collect();
        self.storages.graph.delete_node(key).await?;
        self.storages
            .entities_vdb
            .delete(&[entity_vector_id(key)])
            .await?;
        if !vector_ids.is_empty() {
            self.storages.relationships_vdb.delete(&vector_ids).await?;
        }
        Ok(())
    }

    pub async fn remove_relation(&self, src: &str, tgt: &str) -> Result<(), AppError> {
        let (src, tgt) = relation_pair(src, tgt);
        let _guard = self.locks.lock(&relation_lock_key(&src, &tgt)).await;
        self.storages.graph.delete_edge(&src, &tgt).await?;
        self.storages
            .relationships_vdb
            .delete(&[relation_vector_id(&src, &tgt)])
            .await
    }

    pub async fn edit_entity(
        &self,
        name: &str,
        update: EntityUpdate,
    ) -> Result<KnowledgeEntity, AppError> {
        let key = entity_key(name);
        let _guard = self.locks.lock(&entity_lock_key(&key)).await;
        let mut entity = self
            .storages
            .graph
            .get_node(&key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("entity {name}")))?;
        if let Some(description) = update.description {
            entity.descriptions = vec![description];
        }
        if let Some(entity_type) = update.entity_type {
            entity.entity_type = entity_type.trim().to_uppercase();
        }
        entity.updated_at = Utc::now();
        self.persist_entity(entity.clone()).await?;
        info!(entity = %key, "entity edited");
        Ok(entity)
    }

    pub async fn edit_relation(
        &self,
        src: &str,
        tgt: &str,
        update: RelationUpdate,
    ) -> Result<KnowledgeRelationship, AppError> {
        let (src, tgt) = relation_pair(src, tgt);
        let _guard = self.locks.lock(&relation_lock_key(&src, &tgt)).await;
        let mut relation = self
            .storages
            .graph
            .get_edge(&src, &tgt)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("relation {src} -> {tgt}")))?;
        if let Some(description) = update.description {
            relation.descriptions = vec![description];
        }
        if let Some(keywords) = update.keywords {
            relation.keywords = union_strings(&[], keywords.iter());
        }
        if let Some(weight) = update.weight {
            relation.weight = weight;
        }
        relation.updated_at = Utc::now();
        self.persist_relation(relation.clone()).await?;
        info!(source = %src, target = %tgt, "relation edited");
        Ok(relation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{ExtractedEntity, ExtractedRelation};
    use common::utils::{
        limiter::PriorityLimiter, llm::ScriptedLanguageModel, retry::RetryPolicy,
    };

    struct Harness {
        storages: Storages,
        model: Arc<ScriptedLanguageModel>,
        merger: Merger,
    }

    fn harness(config: MergeConfig) -> Harness {
        let storages = Storages::in_memory(&AppConfig::default());
        let model = Arc::new(ScriptedLanguageModel::new(|request| {
            Ok(format!("SUMMARY of {} chars", request.prompt.len()))
        }));
        let llm = LlmService::new(model.clone(), PriorityLimiter::new(4), RetryPolicy::none());
        let merger = Merger::new(
            storages.clone(),
            Arc::new(llm),
            Arc::new(EmbeddingProvider::new_hashed(32)),
            config,
        );
        Harness {
            storages,
            model,
            merger,
        }
    }

    fn entity(name: &str, ty: &str, description: &str) -> ExtractedEntity {
        ExtractedEntity {
            name: name.into(),
            entity_type: ty.into(),
            description: description.into(),
        }
    }

    fn relation(source: &str, target: &str, description: &str, strength: f32) -> ExtractedRelation {
        ExtractedRelation {
            source: source.into(),
            target: target.into(),
            description: description.into(),
            keywords: vec!["link".into()],
            strength,
        }
    }

    fn extraction(
        chunk_id: &str,
        doc_id: &str,
        entities: Vec<ExtractedEntity>,
        relations: Vec<ExtractedRelation>,
    ) -> ChunkExtraction {
        ChunkExtraction {
            chunk_id: chunk_id.into(),
            full_doc_id: doc_id.into(),
            file_path: format!("{doc_id}.txt"),
            entities,
            relations,
        }
    }

    fn alice_batch() -> Vec<ChunkExtraction> {
        vec![
            extraction(
                "chunk-1",
                "doc-b",
                vec![
                    entity("Alice", "PERSON", "Alice is CEO of Acme."),
                    entity("Acme", "ORGANIZATION", "Acme is a company."),
                ],
                vec![relation("Alice", "Acme", "Alice leads Acme.", 2.0)],
            ),
            extraction(
                "chunk-2",
                "doc-a",
                vec![entity("acme", "ORGANIZATION", "Acme uses Widget.")],
                vec![relation("Acme", "Alice", "Acme is run by Alice.", 3.0)],
            ),
        ]
    }

    #[tokio::test]
    async fn reversed_pairs_collapse_into_one_relation() {
        let h = harness(MergeConfig::default());
        let outcome = h.merger.merge(&alice_batch(), &CancellationToken::new()).await;

        assert_eq!(outcome.entities_merged, 2);
        assert_eq!(outcome.relations_merged, 1);
        let edges = h.storages.graph.all_edges().await.expect("edges");
        assert_eq!(edges.len(), 1);
        let edge = &edges[0];
        assert_eq!(edge.pair(), ("acme".to_string(), "alice".to_string()));
        assert!((edge.weight - 5.0).abs() < f32::EPSILON);
        assert_eq!(edge.source_ids, vec!["chunk-1", "chunk-2"]);
        assert_eq!(edge.provenance_doc_id, "doc-a");
        assert_eq!(edge.file_path, "doc-a.txt");
        assert_eq!(h.storages.relationships_vdb.count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn merging_the_same_batch_twice_is_idempotent() {
        let h = harness(MergeConfig::default());
        let cancel = CancellationToken::new();
        h.merger.merge(&alice_batch(), &cancel).await;
        let nodes = h.storages.graph.all_nodes().await.expect("nodes");
        let edges = h.storages.graph.all_edges().await.expect("edges");

        let second = h.merger.merge(&alice_batch(), &cancel).await;

        assert_eq!(second.applied(), 0);
        assert_eq!(second.unchanged, 3);
        assert_eq!(h.storages.graph.all_nodes().await.expect("nodes"), nodes);
        assert_eq!(h.storages.graph.all_edges().await.expect("edges"), edges);
    }

    #[tokio::test]
    async fn unnamed_endpoints_become_unknown_entities() {
        let h = harness(MergeConfig::default());
        let batch = vec![extraction(
            "chunk-1",
            "doc-1",
            vec![entity("Acme", "ORGANIZATION", "Acme is a company.")],
            vec![relation("Acme", "Widget", "Acme uses Widget.", 1.0)],
        )];
        h.merger.merge(&batch, &CancellationToken::new()).await;

        let widget = h
            .storages
            .graph
            .get_node("widget")
            .await
            .expect("get")
            .expect("implicit entity");
        assert_eq!(widget.entity_type, UNKNOWN_ENTITY_TYPE);
        assert_eq!(widget.descriptions, vec!["Acme uses Widget."]);
        assert_eq!(widget.source_ids, vec!["chunk-1"]);
    }

    #[tokio::test]
    async fn type_follows_the_majority() {
        let h = harness(MergeConfig::default());
        let batch: Vec<ChunkExtraction> = ["PRODUCT", "TECHNOLOGY", "PRODUCT"]
            .iter()
            .enumerate()
            .map(|(i, ty)| {
                extraction(
                    &format!("chunk-{i}"),
                    "doc-1",
                    vec![entity("Widget", ty, &format!("fact {i}"))],
                    Vec::new(),
                )
            })
            .collect();
        h.merger.merge(&batch, &CancellationToken::new()).await;
        let widget = h.storages.graph.get_node("widget").await.expect("get").expect("node");
        assert_eq!(widget.entity_type, "PRODUCT");
    }

    #[tokio::test]
    async fn many_fragments_are_summarized() {
        let h = harness(MergeConfig {
            force_llm_summary_on_merge: 3,
            ..MergeConfig::default()
        });
        let batch: Vec<ChunkExtraction> = (0..3)
            .map(|i| {
                extraction(
                    &format!("chunk-{i}"),
                    "doc-1",
                    vec![entity("Acme", "ORGANIZATION", &format!("Acme fact number {i}."))],
                    Vec::new(),
                )
            })
            .collect();
        h.merger.merge(&batch, &CancellationToken::new()).await;

        let acme = h.storages.graph.get_node("acme").await.expect("get").expect("node");
        assert_eq!(acme.descriptions.len(), 1);
        assert!(acme.descriptions[0].starts_with("SUMMARY"));
        assert_eq!(h.model.calls(), 1);
        assert_eq!(h.model.requests()[0].priority, Priority::Normal);
    }

    #[tokio::test]
    async fn oversized_evidence_is_reduced_in_rounds() {
        let h = harness(MergeConfig {
            force_llm_summary_on_merge: 2,
            summary_context_size: 12,
            ..MergeConfig::default()
        });
        let descriptions: Vec<String> = (0..6)
            .map(|i| format!("Evidence sentence {i} describing Acme in some detail."))
            .collect();

        let summary = h
            .merger
            .reduce("entity", "Acme", descriptions)
            .await
            .expect("reduce");

        assert!(summary.starts_with("SUMMARY"));
        assert!(h.model.calls() > 1);
    }

    #[tokio::test]
    async fn fifo_retention_keeps_the_newest_sources() {
        let h = harness(MergeConfig {
            max_source_ids_per_entity: 2,
            source_ids_limit_method: SourceIdsLimitMethod::Fifo,
            ..MergeConfig::default()
        });
        let cancel = CancellationToken::new();
        for i in 0..3 {
            let batch = vec![extraction(
                &format!("chunk-{i}"),
                "doc-1",
                vec![entity("Acme", "ORGANIZATION", &format!("fact {i}"))],
                Vec::new(),
            )];
            h.merger.merge(&batch, &cancel).await;
        }
        let acme = h.storages.graph.get_node("acme").await.expect("get").expect("node");
        assert_eq!(acme.source_ids, vec!["chunk-1", "chunk-2"]);
    }

    #[test]
    fn keep_retention_ignores_new_ids_at_the_cap() {
        let existing = vec!["a".to_string(), "b".to_string()];
        let merged = limit_source_ids(&existing, &["c".into()], 2, SourceIdsLimitMethod::Keep);
        assert_eq!(merged, existing);
    }

    #[tokio::test]
    async fn relation_without_endpoint_is_a_no_op() {
        let h = harness(MergeConfig::default());
        let evidence = relation_evidence(&[extraction(
            "chunk-1",
            "doc-1",
            Vec::new(),
            vec![relation("Ghost", "Acme", "never merged", 1.0)],
        )]);
        let (pair, items) = evidence.into_iter().next().expect("evidence");

        let result = h
            .merger
            .merge_relation(pair, items, &CancellationToken::new())
            .await;

        assert!(matches!(result, ItemResult::Skipped));
        assert!(h.storages.graph.all_edges().await.expect("edges").is_empty());
    }

    #[tokio::test]
    async fn cancelled_batches_write_nothing() {
        let h = harness(MergeConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = h.merger.merge(&alice_batch(), &cancel).await;

        assert_eq!(outcome.applied(), 0);
        assert_eq!(outcome.cancelled, 3);
        assert!(h.storages.graph.all_nodes().await.expect("nodes").is_empty());
    }

    #[tokio::test]
    async fn rebuild_uses_only_remaining_evidence() {
        let h = harness(MergeConfig::default());
        let batch = alice_batch();
        let upserts: Vec<(String, &ChunkExtraction)> =
            batch.iter().map(|e| (e.chunk_id.clone(), e)).collect();
        h.storages
            .chunk_extractions
            .upsert_typed(upserts)
            .await
            .expect("store extractions");
        h.merger.merge(&batch, &CancellationToken::new()).await;

        h.merger
            .rebuild_relation("alice", "acme", vec!["chunk-1".into()])
            .await
            .expect("rebuild relation");
        h.merger
            .rebuild_entity("acme", vec!["chunk-1".into()])
            .await
            .expect("rebuild entity");

        let edge = h
            .storages
            .graph
            .get_edge("alice", "acme")
            .await
            .expect("get")
            .expect("edge");
        assert!((edge.weight - 2.0).abs() < f32::EPSILON);
        assert_eq!(edge.descriptions, vec!["Alice leads Acme."]);
        let acme = h.storages.graph.get_node("acme").await.expect("get").expect("node");
        assert_eq!(acme.descriptions, vec!["Acme is a company."]);
        assert_eq!(acme.provenance_doc_id, "doc-b");
    }

    #[tokio::test]
    async fn rebuild_without_stored_extractions_only_shrinks_sources() {
        let h = harness(MergeConfig::default());
        h.merger.merge(&alice_batch(), &CancellationToken::new()).await;
        let before = h.storages.graph.get_node("acme").await.expect("get").expect("node");

        h.merger
            .rebuild_entity("acme", vec!["chunk-1".into()])
            .await
            .expect("rebuild entity");

        let acme = h.storages.graph.get_node("acme").await.expect("get").expect("node");
        assert_eq!(acme.source_ids, vec!["chunk-1"]);
        assert_eq!(acme.descriptions, before.descriptions);
        assert_eq!(acme.entity_type, before.entity_type);
    }

    #[tokio::test]
    async fn edits_replace_description_and_reembed() {
        let h = harness(MergeConfig::default());
        h.merger.merge(&alice_batch(), &CancellationToken::new()).await;
        let before = h
            .storages
            .entities_vdb
            .get_by_id(&entity_vector_id("Alice"))
            .await
            .expect("get")
            .expect("vector");

        let edited = h
            .merger
            .edit_entity(
                "ALICE",
                EntityUpdate {
                    description: Some("Alice founded Acme in 2001.".into()),
                    entity_type: None,
                },
            )
            .await
            .expect("edit");

        assert_eq!(edited.descriptions, vec!["Alice founded Acme in 2001."]);
        let after = h
            .storages
            .entities_vdb
            .get_by_id(&entity_vector_id("Alice"))
            .await
            .expect("get")
            .expect("vector");
        assert_ne!(before.content, after.content);
        assert!(matches!(
            h.merger.edit_entity("Nobody", EntityUpdate::default()).await,
            Err(AppError::NotFound(_))
        ));
    }
}
