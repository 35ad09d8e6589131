use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use serde::{
    de::{self, Visitor},
    Deserialize, Deserializer, Serialize,
};
use serde_json::Value;
use surrealdb::sql::Thing;

use crate::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        traits::{
            DocStatusStore, GraphStore, KeyValueStore, VectorMatch, VectorRecord, VectorStore,
        },
        types::{
            document::{DocStatus, DocumentRecord},
            knowledge_entity::KnowledgeEntity,
            knowledge_relationship::KnowledgeRelationship,
        },
    },
    utils::hashing::{relation_pair, relation_vector_id},
};

struct FlexibleIdVisitor;

impl<'de> Visitor<'de> for FlexibleIdVisitor {
    type Value = String;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a string or a Thing")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(value.to_string())
    }

    fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(value)
    }

    fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
    where
        A: de::MapAccess<'de>,
    {
        let thing = Thing::deserialize(de::value::MapAccessDeserializer::new(map))?;
        Ok(thing.id.to_raw())
    }
}

/// Accepts either a bare string id or a SurrealDB record id.
pub fn deserialize_flexible_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(FlexibleIdVisitor)
}

#[derive(Serialize)]
struct PayloadContent {
    payload: String,
}

#[derive(Deserialize)]
struct PayloadRow {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    id: String,
    payload: String,
}

#[derive(Deserialize)]
struct PayloadOnly {
    payload: String,
}

fn decode<T: serde::de::DeserializeOwned>(payload: &str) -> Result<T, AppError> {
    Ok(serde_json::from_str(payload)?)
}

pub struct SurrealKvStore {
    db: Arc<SurrealDbClient>,
    table: String,
}

impl SurrealKvStore {
    pub fn new(db: Arc<SurrealDbClient>, namespace: &str) -> Self {
        Self {
            db,
            table: format!("kv_{namespace}"),
        }
    }
}

#[async_trait]
impl KeyValueStore for SurrealKvStore {
    fn namespace(&self) -> &str {
        &self.table
    }

    async fn initialize(&self) -> Result<(), AppError> {
        Ok(self.db.ensure_table(&self.table, &[]).await?)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Value>, AppError> {
        let row: Option<PayloadRow> = self.db.get_record(&self.table, id).await?;
        row.map(|row| decode(&row.payload)).transpose()
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Option<Value>>, AppError> {
        let rows: Vec<PayloadRow> = self.db.get_records(&self.table, ids).await?;
        let mut by_id: HashMap<String, Value> = HashMap::with_capacity(rows.len());
        for row in rows {
            by_id.insert(row.id, decode(&row.payload)?);
        }
        Ok(ids.iter().map(|id| by_id.remove(id)).collect())
    }

    async fn filter_keys(&self, ids: &[String]) -> Result<HashSet<String>, AppError> {
        let rows: Vec<PayloadRow> = self.db.get_records(&self.table, ids).await?;
        let present: HashSet<String> = rows.into_iter().map(|row| row.id).collect();
        Ok(ids
            .iter()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect())
    }

    async fn upsert(&self, entries: Vec<(String, Value)>) -> Result<(), AppError> {
        for (id, value) in entries {
            let content = PayloadContent {
                payload: serde_json::to_string(&value)?,
            };
            self.db.upsert_record(&self.table, &id, content).await?;
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), AppError> {
        Ok(self.db.delete_records(&self.table, ids).await?)
    }

    async fn all_keys(&self) -> Result<Vec<String>, AppError> {
        let rows: Vec<PayloadRow> = self.db.all_records(&self.table).await?;
        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    async fn drop_all(&self) -> Result<(), AppError> {
        Ok(self.db.drop_records(&self.table).await?)
    }
}

#[derive(Serialize)]
struct VectorContent {
    embedding: Vec<f32>,
    content: String,
    metadata: String,
}

#[derive(Deserialize)]
struct VectorRow {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    id: String,
    embedding: Vec<f32>,
    content: String,
    metadata: String,
}

#[derive(Deserialize)]
struct ScoredRow {
    rid: String,
    content: String,
    metadata: String,
    score: f32,
}

/// Brute-force cosine search over a SurrealDB table.
pub struct SurrealVectorStore {
    db: Arc<SurrealDbClient>,
    table: String,
}

impl SurrealVectorStore {
    pub fn new(db: Arc<SurrealDbClient>, namespace: &str) -> Self {
        Self {
            db,
            table: format!("vdb_{namespace}"),
        }
    }
}

#[async_trait]
impl VectorStore for SurrealVectorStore {
    fn namespace(&self) -> &str {
        &self.table
    }

    async fn initialize(&self) -> Result<(), AppError> {
        Ok(self.db.ensure_table(&self.table, &[]).await?)
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), AppError> {
        for record in records {
            let content = VectorContent {
                embedding: record.embedding,
                content: record.content,
                metadata: serde_json::to_string(&record.metadata)?,
            };
            self.db.upsert_record(&self.table, &record.id, content).await?;
        }
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<VectorMatch>, AppError> {
        let sql = format!(
            "SELECT record::id(id) AS rid, content, metadata, \
             vector::similarity::cosine(embedding, $embedding) AS score \
             FROM type::table($table) ORDER BY score DESC LIMIT {top_k}"
        );
        let rows: Vec<ScoredRow> = self
            .db
            .query(sql)
            .bind(("table", self.table.clone()))
            .bind(("embedding", embedding.to_vec()))
            .await?
            .take(0)?;

        rows.into_iter()
            .filter(|row| row.score >= threshold)
            .map(|row| {
                Ok(VectorMatch {
                    id: row.rid,
                    score: row.score,
                    content: row.content,
                    metadata: decode(&row.metadata)?,
                })
            })
            .collect()
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<VectorRecord>, AppError> {
        let row: Option<VectorRow> = self.db.get_record(&self.table, id).await?;
        row.map(|row| {
            Ok(VectorRecord {
                id: row.id,
                embedding: row.embedding,
                content: row.content,
                metadata: decode(&row.metadata)?,
            })
        })
        .transpose()
    }

    async fn delete(&self, ids: &[String]) -> Result<(), AppError> {
        Ok(self.db.delete_records(&self.table, ids).await?)
    }

    async fn count(&self) -> Result<usize, AppError> {
        let ids: Vec<String> = self
            .db
            .query("SELECT VALUE record::id(id) FROM type::table($table)")
            .bind(("table", self.table.clone()))
            .await?
            .take(0)?;
        Ok(ids.len())
    }

    async fn drop_all(&self) -> Result<(), AppError> {
        Ok(self.db.drop_records(&self.table).await?)
    }
}

#[derive(Serialize)]
struct NodeContent {
    source_ids: Vec<String>,
    payload: String,
}

#[derive(Serialize)]
struct EdgeContent {
    src_id: String,
    tgt_id: String,
    source_ids: Vec<String>,
    payload: String,
}

#[derive(Deserialize)]
struct PairRow {
    src_id: String,
    tgt_id: String,
}

#[derive(Deserialize)]
struct CounterRow {
    counter: u64,
}

/// Graph over two tables: nodes keyed by entity key, edges keyed by the
/// relation id of their canonical pair.
pub struct SurrealGraphStore {
    db: Arc<SurrealDbClient>,
    nodes: String,
    edges: String,
    meta: String,
}

impl SurrealGraphStore {
    pub fn new(db: Arc<SurrealDbClient>, namespace: &str) -> Self {
        Self {
            db,
            nodes: format!("{namespace}_node"),
            edges: format!("{namespace}_edge"),
            meta: format!("{namespace}_graph_meta"),
        }
    }

    async fn bump(&self) -> Result<(), AppError> {
        self.db
            .query("UPSERT type::thing($table, 'version') SET counter += 1")
            .bind(("table", self.meta.clone()))
            .await?
            .check()?;
        Ok(())
    }

    async fn payloads(&self, sql: &str, key: &str, values: Vec<String>) -> Result<Vec<String>, AppError> {
        let rows: Vec<PayloadOnly> = self
            .db
            .query(sql)
            .bind(("table", key.to_owned()))
            .bind(("values", values))
            .await?
            .take(0)?;
        Ok(rows.into_iter().map(|row| row.payload).collect())
    }
}

#[async_trait]
impl GraphStore for SurrealGraphStore {
    async fn initialize(&self) -> Result<(), AppError> {
        self.db.ensure_table(&self.nodes, &[]).await?;
        self.db.ensure_table(&self.edges, &["src_id", "tgt_id"]).await?;
        self.db.ensure_table(&self.meta, &[]).await?;
        Ok(())
    }

    async fn get_node(&self, key: &str) -> Result<Option<KnowledgeEntity>, AppError> {
        let row: Option<PayloadRow> = self.db.get_record(&self.nodes, key).await?;
        row.map(|row| decode(&row.payload)).transpose()
    }

    async fn get_nodes(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, KnowledgeEntity>, AppError> {
        let rows: Vec<PayloadRow> = self.db.get_records(&self.nodes, keys).await?;
        rows.into_iter()
            .map(|row| Ok((row.id, decode(&row.payload)?)))
            .collect()
    }

    async fn upsert_node(&self, node: KnowledgeEntity) -> Result<(), AppError> {
        let content = NodeContent {
            source_ids: node.source_ids.clone(),
            payload: serde_json::to_string(&node)?,
        };
        self.db.upsert_record(&self.nodes, &node.key, content).await?;
        self.bump().await
    }

    async fn delete_node(&self, key: &str) -> Result<(), AppError> {
        self.db.delete_records(&self.nodes, &[key.to_owned()]).await?;
        self.db
            .query("DELETE type::table($table) WHERE src_id = $key OR tgt_id = $key")
            .bind(("table", self.edges.clone()))
            .bind(("key", key.to_owned()))
            .await?
            .check()?;
        self.bump().await
    }

    async fn get_edge(
        &self,
        a: &str,
        b: &str,
    ) -> Result<Option<KnowledgeRelationship>, AppError> {
        let row: Option<PayloadRow> = self
            .db
            .get_record(&self.edges, &relation_vector_id(a, b))
            .await?;
        row.map(|row| decode(&row.payload)).transpose()
    }

    async fn get_edges(
        &self,
        pairs: &[(String, String)],
    ) -> Result<Vec<KnowledgeRelationship>, AppError> {
        let ids: Vec<String> = pairs
            .iter()
            .map(|(a, b)| relation_vector_id(a, b))
            .collect();
        let rows: Vec<PayloadRow> = self.db.get_records(&self.edges, &ids).await?;
        let mut by_id: HashMap<String, KnowledgeRelationship> = HashMap::new();
        for row in rows {
            by_id.insert(row.id, decode(&row.payload)?);
        }
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn upsert_edge(&self, edge: KnowledgeRelationship) -> Result<(), AppError> {
        let (src_id, tgt_id) = relation_pair(&edge.src_id, &edge.tgt_id);
        let id = relation_vector_id(&src_id, &tgt_id);
        let content = EdgeContent {
            src_id,
            tgt_id,
            source_ids: edge.source_ids.clone(),
            payload: serde_json::to_string(&edge)?,
        };
        self.db.upsert_record(&self.edges, &id, content).await?;
        self.bump().await
    }

    async fn delete_edge(&self, a: &str, b: &str) -> Result<(), AppError> {
        self.db
            .delete_records(&self.edges, &[relation_vector_id(a, b)])
            .await?;
        self.bump().await
    }

    async fn node_edges(&self, key: &str) -> Result<Vec<(String, String)>, AppError> {
        let rows: Vec<PairRow> = self
            .db
            .query("SELECT src_id, tgt_id FROM type::table($table) WHERE src_id = $key OR tgt_id = $key")
            .bind(("table", self.edges.clone()))
            .bind(("key", key.to_owned()))
            .await?
            .take(0)?;
        let mut pairs: Vec<(String, String)> =
            rows.into_iter().map(|row| (row.src_id, row.tgt_id)).collect();
        pairs.sort();
        Ok(pairs)
    }

    async fn all_nodes(&self) -> Result<Vec<KnowledgeEntity>, AppError> {
        let rows: Vec<PayloadRow> = self.db.all_records(&self.nodes).await?;
        let mut nodes = rows
            .iter()
            .map(|row| decode::<KnowledgeEntity>(&row.payload))
            .collect::<Result<Vec<_>, _>>()?;
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(nodes)
    }

    async fn all_edges(&self) -> Result<Vec<KnowledgeRelationship>, AppError> {
        let rows: Vec<PayloadRow> = self.db.all_records(&self.edges).await?;
        let mut edges = rows
            .iter()
            .map(|row| decode::<KnowledgeRelationship>(&row.payload))
            .collect::<Result<Vec<_>, _>>()?;
        edges.sort_by(|a, b| a.pair().cmp(&b.pair()));
        Ok(edges)
    }

    async fn nodes_with_sources(
        &self,
        chunk_ids: &[String],
    ) -> Result<Vec<KnowledgeEntity>, AppError> {
        let payloads = self
            .payloads(
                "SELECT payload FROM type::table($table) WHERE source_ids CONTAINSANY $values",
                &self.nodes,
                chunk_ids.to_vec(),
            )
            .await?;
        payloads.iter().map(|payload| decode(payload)).collect()
    }

    async fn edges_with_sources(
        &self,
        chunk_ids: &[String],
    ) -> Result<Vec<KnowledgeRelationship>, AppError> {
        let payloads = self
            .payloads(
                "SELECT payload FROM type::table($table) WHERE source_ids CONTAINSANY $values",
                &self.edges,
                chunk_ids.to_vec(),
            )
            .await?;
        payloads.iter().map(|payload| decode(payload)).collect()
    }

    async fn version(&self) -> Result<u64, AppError> {
        let row: Option<CounterRow> = self.db.get_record(&self.meta, "version").await?;
        Ok(row.map_or(0, |row| row.counter))
    }

    async fn drop_all(&self) -> Result<(), AppError> {
        self.db.drop_records(&self.nodes).await?;
        self.db.drop_records(&self.edges).await?;
        self.bump().await
    }
}

#[derive(Serialize)]
struct DocContent {
    status: String,
    track_id: String,
    payload: String,
}

pub struct SurrealDocStatusStore {
    db: Arc<SurrealDbClient>,
    table: String,
}

impl SurrealDocStatusStore {
    pub fn new(db: Arc<SurrealDbClient>, namespace: &str) -> Self {
        Self {
            db,
            table: format!("{namespace}_doc_status"),
        }
    }

    async fn where_field(&self, field: &str, value: &str) -> Result<Vec<DocumentRecord>, AppError> {
        let sql = format!("SELECT payload FROM type::table($table) WHERE {field} = $value");
        let rows: Vec<PayloadOnly> = self
            .db
            .query(sql)
            .bind(("table", self.table.clone()))
            .bind(("value", value.to_owned()))
            .await?
            .take(0)?;
        let mut records = rows
            .iter()
            .map(|row| decode::<DocumentRecord>(&row.payload))
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }
}

#[async_trait]
impl DocStatusStore for SurrealDocStatusStore {
    async fn initialize(&self) -> Result<(), AppError> {
        Ok(self
            .db
            .ensure_table(&self.table, &["status", "track_id"])
            .await?)
    }

    async fn get(&self, id: &str) -> Result<Option<DocumentRecord>, AppError> {
        let row: Option<PayloadRow> = self.db.get_record(&self.table, id).await?;
        row.map(|row| decode(&row.payload)).transpose()
    }

    async fn upsert(&self, records: Vec<DocumentRecord>) -> Result<(), AppError> {
        for record in records {
            let content = DocContent {
                status: record.status.as_str().to_string(),
                track_id: record.track_id.clone(),
                payload: serde_json::to_string(&record)?,
            };
            self.db.upsert_record(&self.table, &record.id, content).await?;
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), AppError> {
        Ok(self.db.delete_records(&self.table, ids).await?)
    }

    async fn by_status(&self, status: DocStatus) -> Result<Vec<DocumentRecord>, AppError> {
        self.where_field("status", status.as_str()).await
    }

    async fn by_track_id(&self, track_id: &str) -> Result<Vec<DocumentRecord>, AppError> {
        self.where_field("track_id", track_id).await
    }

    async fn all(&self) -> Result<Vec<DocumentRecord>, AppError> {
        let rows: Vec<PayloadRow> = self.db.all_records(&self.table).await?;
        rows.iter().map(|row| decode(&row.payload)).collect()
    }

    async fn drop_all(&self) -> Result<(), AppError> {
        Ok(self.db.drop_records(&self.table).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    async fn client() -> Arc<SurrealDbClient> {
        Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("Failed to start in-memory surrealdb"),
        )
    }

    #[tokio::test]
    async fn kv_round_trips_json_payloads() {
        let store = SurrealKvStore::new(client().await, "full_docs");
        store.initialize().await.expect("init");
        store
            .upsert(vec![("doc-1".into(), json!({"content": "Acme uses Widget."}))])
            .await
            .expect("upsert");

        let value = store.get_by_id("doc-1").await.expect("get");
        assert_eq!(value, Some(json!({"content": "Acme uses Widget."})));
        let missing = store
            .filter_keys(&["doc-1".into(), "doc-9".into()])
            .await
            .expect("filter");
        assert_eq!(missing, HashSet::from(["doc-9".to_string()]));
    }

    #[tokio::test]
    async fn vector_search_ranks_by_cosine() {
        let store = SurrealVectorStore::new(client().await, "chunks");
        store.initialize().await.expect("init");
        store
            .upsert(vec![
                VectorRecord {
                    id: "chunk-a".into(),
                    embedding: vec![1.0, 0.0, 0.0],
                    content: "a".into(),
                    metadata: json!({"full_doc_id": "doc-1"}),
                },
                VectorRecord {
                    id: "chunk-b".into(),
                    embedding: vec![0.6, 0.8, 0.0],
                    content: "b".into(),
                    metadata: json!({"full_doc_id": "doc-1"}),
                },
            ])
            .await
            .expect("upsert");

        let hits = store.query(&[1.0, 0.0, 0.0], 2, 0.0).await.expect("query");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "chunk-a");
        assert_eq!(hits[0].metadata["full_doc_id"], "doc-1");
        assert_eq!(store.count().await.expect("count"), 2);
    }

    #[tokio::test]
    async fn graph_tracks_edges_sources_and_version() {
        let graph = SurrealGraphStore::new(client().await, "kg");
        graph.initialize().await.expect("init");

        let mut alice = KnowledgeEntity::new("Alice", "PERSON".into());
        alice.source_ids = vec!["chunk-1".into()];
        graph.upsert_node(alice).await.expect("node");
        graph
            .upsert_node(KnowledgeEntity::new("Acme", "ORGANIZATION".into()))
            .await
            .expect("node");
        let mut edge = KnowledgeRelationship::new("Alice", "Acme");
        edge.source_ids = vec!["chunk-1".into()];
        graph.upsert_edge(edge).await.expect("edge");

        assert!(graph.get_edge("acme", "alice").await.expect("get").is_some());
        assert_eq!(graph.node_edges("alice").await.expect("edges").len(), 1);
        assert_eq!(
            graph
                .nodes_with_sources(&["chunk-1".into()])
                .await
                .expect("nodes")
                .len(),
            1
        );
        let version = graph.version().await.expect("version");
        assert!(version >= 3);

        graph.delete_node("acme").await.expect("delete");
        assert!(graph.get_edge("alice", "acme").await.expect("get").is_none());
        assert!(graph.version().await.expect("version") > version);
    }

    #[tokio::test]
    async fn doc_status_queries_by_status() {
        let store = SurrealDocStatusStore::new(client().await, "docs");
        store.initialize().await.expect("init");
        let record = DocumentRecord::new("doc-1".into(), "text", None, "track-1".into());
        store.upsert(vec![record.clone()]).await.expect("upsert");

        let pending = store.by_status(DocStatus::Pending).await.expect("query");
        assert_eq!(pending, vec![record]);
        assert!(store
            .by_status(DocStatus::Processed)
            .await
            .expect("query")
            .is_empty());
    }
}
