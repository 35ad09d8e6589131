use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        traits::{KeyValueStoreExt, VectorMatch, VectorRecord, VectorStore},
        types::{
            knowledge_entity::KnowledgeEntity, knowledge_relationship::KnowledgeRelationship,
            text_chunk::TextChunk,
        },
        Storages,
    },
    utils::{
        config::AppConfig,
        embedding::EmbeddingProvider,
        hashing::{entity_vector_id, relation_vector_id},
        limiter::{Priority, PriorityLimiter},
        llm::{LlmService, ScriptedLanguageModel},
        retry::RetryPolicy,
    },
};
use serde_json::json;

use super::*;

const ALICE_CHUNK: &str = "Alice is CEO of Acme.";
const WIDGET_CHUNK: &str = "Acme uses Widget.";
const BANANA_CHUNK: &str = "Bananas are yellow fruit.";

struct Fixture {
    storages: Storages,
    llm: LlmService,
    model: Arc<ScriptedLanguageModel>,
    embedder: EmbeddingProvider,
    tuning: RetrievalTuning,
    chunk_ids: Vec<String>,
}

async fn add_chunk(
    storages: &Storages,
    embedder: &EmbeddingProvider,
    doc: &str,
    content: &str,
    path: &str,
) -> String {
    let chunk = TextChunk::new(doc.to_string(), content.to_string(), 6, 0, path.to_string());
    storages
        .text_chunks
        .upsert_typed(vec![(chunk.id.clone(), &chunk)])
        .await
        .expect("store chunk");
    let embedding = embedder.embed(content, Priority::Low).await.expect("embed");
    storages
        .chunks_vdb
        .upsert(vec![VectorRecord {
            id: chunk.id.clone(),
            embedding,
            content: content.to_string(),
            metadata: json!({ "full_doc_id": doc }),
        }])
        .await
        .expect("index chunk");
    chunk.id
}

async fn add_entity(
    storages: &Storages,
    embedder: &EmbeddingProvider,
    name: &str,
    description: &str,
    sources: &[&String],
    path: &str,
) {
    let mut entity = KnowledgeEntity::new(name, "ORGANIZATION".into());
    entity.descriptions = vec![description.to_string()];
    entity.source_ids = sources.iter().map(|id| (*id).clone()).collect();
    entity.file_path = path.to_string();
    let content = entity.embedding_content();
    let embedding = embedder.embed(&content, Priority::Low).await.expect("embed");
    storages
        .entities_vdb
        .upsert(vec![VectorRecord {
            id: entity_vector_id(&entity.key),
            embedding,
            content,
            metadata: json!({ "entity_key": entity.key }),
        }])
        .await
        .expect("index entity");
    storages.graph.upsert_node(entity).await.expect("store entity");
}

async fn add_relation(
    storages: &Storages,
    embedder: &EmbeddingProvider,
    (a, b): (&str, &str),
    description: &str,
    keyword: &str,
    weight: f32,
    source: &str,
) {
    let mut relation = KnowledgeRelationship::new(a, b);
    relation.descriptions = vec![description.to_string()];
    relation.keywords = vec![keyword.to_string()];
    relation.weight = weight;
    relation.source_ids = vec![source.to_string()];
    let content = relation.embedding_content();
    let embedding = embedder.embed(&content, Priority::Low).await.expect("embed");
    storages
        .relationships_vdb
        .upsert(vec![VectorRecord {
            id: relation_vector_id(&relation.src_id, &relation.tgt_id),
            embedding,
            content,
            metadata: json!({ "src_id": relation.src_id, "tgt_id": relation.tgt_id }),
        }])
        .await
        .expect("index relation");
    storages.graph.upsert_edge(relation).await.expect("store relation");
}

async fn fixture(reply: &'static str) -> Fixture {
    let storages = Storages::in_memory(&AppConfig::default());
    let embedder = EmbeddingProvider::new_hashed(512);

    let alice_chunk = add_chunk(&storages, &embedder, "doc-a", ALICE_CHUNK, "a.md").await;
    let widget_chunk = add_chunk(&storages, &embedder, "doc-b", WIDGET_CHUNK, "b.md").await;
    let banana_chunk = add_chunk(&storages, &embedder, "doc-c", BANANA_CHUNK, "c.md").await;

    add_entity(&storages, &embedder, "Alice", "Alice is chief executive", &[&alice_chunk], "a.md").await;
    add_entity(
        &storages,
        &embedder,
        "Acme",
        "Acme is a company",
        &[&alice_chunk, &widget_chunk],
        "a.md",
    )
    .await;
    add_entity(&storages, &embedder, "Widget", "Widget is a tool", &[&widget_chunk], "b.md").await;
    add_relation(
        &storages,
        &embedder,
        ("Alice", "Acme"),
        "Alice is the CEO of Acme",
        "leadership",
        2.0,
        &alice_chunk,
    )
    .await;
    add_relation(
        &storages,
        &embedder,
        ("Acme", "Widget"),
        "Acme uses Widget",
        "usage",
        1.0,
        &widget_chunk,
    )
    .await;

    let model = Arc::new(ScriptedLanguageModel::new(move |_| Ok(reply.to_string())));
    let llm = LlmService::new(model.clone(), PriorityLimiter::new(2), RetryPolicy::none());
    let tuning = RetrievalTuning {
        cosine_threshold: 0.1,
        ..RetrievalTuning::default()
    };

    Fixture {
        storages,
        llm,
        model,
        embedder,
        tuning,
        chunk_ids: vec![alice_chunk, widget_chunk, banana_chunk],
    }
}

fn param(mode: QueryMode, ll: &[&str], hl: &[&str]) -> QueryParam {
    QueryParam {
        mode,
        ll_keywords: ll.iter().map(|k| (*k).to_string()).collect(),
        hl_keywords: hl.iter().map(|k| (*k).to_string()).collect(),
        ..QueryParam::default()
    }
}

struct Run {
    entities: Vec<String>,
    relations: Vec<(String, String)>,
    chunks: Vec<String>,
    partial: bool,
    keywords: crate::keywords::QueryKeywords,
}

async fn run(f: &Fixture, param: &QueryParam, query: &str) -> Result<Run, AppError> {
    let mut ctx = QueryContext::new(&f.storages, &f.llm, &f.embedder, None, &f.tuning, param, query);
    run_pipeline(&mut ctx).await?;
    let built = ctx.context.take().expect("context built");
    Ok(Run {
        entities: built.entities.iter().map(|e| e.entity.clone()).collect(),
        relations: built
            .relations
            .iter()
            .map(|r| (r.entity1.clone(), r.entity2.clone()))
            .collect(),
        chunks: built.chunks.iter().map(|c| c.chunk_id.clone()).collect(),
        partial: ctx.partial,
        keywords: ctx.keywords.clone(),
    })
}

#[tokio::test]
async fn local_mode_expands_entities_to_incident_relations_and_chunks() {
    let f = fixture("{}").await;
    let run = run(&f, &param(QueryMode::Local, &["Alice"], &[]), "Who leads Acme?")
        .await
        .expect("query");

    assert_eq!(run.entities, vec!["Alice".to_string()]);
    assert_eq!(run.relations, vec![("acme".to_string(), "alice".to_string())]);
    assert_eq!(run.chunks, vec![f.chunk_ids[0].clone()]);
    assert_eq!(f.model.calls(), 0);
}

#[tokio::test]
async fn global_mode_reaches_entities_through_relations() {
    let f = fixture("{}").await;
    let run = run(&f, &param(QueryMode::Global, &[], &["leadership"]), "Who leads Acme?")
        .await
        .expect("query");

    assert_eq!(run.relations, vec![("acme".to_string(), "alice".to_string())]);
    assert_eq!(run.entities, vec!["Acme".to_string(), "Alice".to_string()]);
    assert_eq!(run.chunks, vec![f.chunk_ids[0].clone(), f.chunk_ids[1].clone()]);
}

#[tokio::test]
async fn naive_mode_skips_keywords_and_the_graph() {
    let f = fixture("{}").await;
    let run = run(&f, &param(QueryMode::Naive, &[], &[]), "yellow bananas")
        .await
        .expect("query");

    assert!(run.entities.is_empty());
    assert!(run.relations.is_empty());
    assert_eq!(run.chunks, vec![f.chunk_ids[2].clone()]);
    assert_eq!(f.model.calls(), 0);
}

#[tokio::test]
async fn mix_mode_covers_local_and_naive_chunks() {
    let f = fixture("{}").await;
    let query = "yellow bananas and Alice";
    let local = run(&f, &param(QueryMode::Local, &["Alice"], &["leadership"]), query)
        .await
        .expect("local");
    let naive = run(&f, &param(QueryMode::Naive, &["Alice"], &["leadership"]), query)
        .await
        .expect("naive");
    let mix = run(&f, &param(QueryMode::Mix, &["Alice"], &["leadership"]), query)
        .await
        .expect("mix");

    let mix_chunks: HashSet<&String> = mix.chunks.iter().collect();
    for chunk in local.chunks.iter().chain(&naive.chunks) {
        assert!(mix_chunks.contains(chunk), "mix is missing {chunk}");
    }
    assert!(mix_chunks.contains(&f.chunk_ids[2]));
}

#[tokio::test]
async fn unusable_keyword_reply_falls_back_to_the_query() {
    let f = fixture("I cannot answer that").await;
    let run = run(&f, &param(QueryMode::Local, &[], &[]), "Alice")
        .await
        .expect("query");

    assert_eq!(f.model.calls(), 1);
    assert_eq!(run.keywords.low_level, vec!["Alice".to_string()]);
    assert_eq!(run.entities, vec!["Alice".to_string()]);
}

struct FailingVectorStore;

#[async_trait]
impl VectorStore for FailingVectorStore {
    fn namespace(&self) -> &str {
        "failing"
    }
    async fn upsert(&self, _records: Vec<VectorRecord>) -> Result<(), AppError> {
        Ok(())
    }
    async fn query(
        &self,
        _embedding: &[f32],
        _top_k: usize,
        _threshold: f32,
    ) -> Result<Vec<VectorMatch>, AppError> {
        Err(AppError::InternalError("vector backend timed out".into()))
    }
    async fn get_by_id(&self, _id: &str) -> Result<Option<VectorRecord>, AppError> {
        Ok(None)
    }
    async fn delete(&self, _ids: &[String]) -> Result<(), AppError> {
        Ok(())
    }
    async fn count(&self) -> Result<usize, AppError> {
        Ok(0)
    }
    async fn drop_all(&self) -> Result<(), AppError> {
        Ok(())
    }
}

#[tokio::test]
async fn failing_source_is_tolerated_only_when_partial_results_are_allowed() {
    let mut f = fixture("{}").await;
    f.storages.relationships_vdb = Arc::new(FailingVectorStore);

    let strict = param(QueryMode::Hybrid, &["Alice"], &["leadership"]);
    let err = run(&f, &strict, "Who leads Acme?").await.err();
    assert!(matches!(err, Some(AppError::InternalError(_))));

    let lenient = QueryParam {
        allow_partial: true,
        ..strict
    };
    let run = run(&f, &lenient, "Who leads Acme?").await.expect("partial query");
    assert!(run.partial);
    assert_eq!(run.entities, vec!["Alice".to_string()]);
}

#[tokio::test]
async fn stage_timings_cover_every_stage() {
    let f = fixture("{}").await;
    let param = param(QueryMode::Hybrid, &["Alice"], &["leadership"]);
    let mut ctx = QueryContext::new(&f.storages, &f.llm, &f.embedder, None, &f.tuning, &param, "q");
    let machine = run_pipeline(&mut ctx).await.expect("pipeline");
    assert!(mark_answered(machine).is_ok());
    assert!(bypass().is_ok());
    assert!(ctx.stage_timings.total_ms() < 60_000);
}
