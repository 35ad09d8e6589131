use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{
    error::AppError,
    storage::{
        traits::{
            DocStatusStore, GraphStore, KeyValueStore, VectorMatch, VectorRecord, VectorStore,
        },
        types::{
            document::{DocStatus, DocumentRecord},
            knowledge_entity::KnowledgeEntity,
            knowledge_relationship::KnowledgeRelationship,
        },
    },
    utils::{embedding::cosine_similarity, hashing::relation_pair},
};

pub struct MemoryKvStore {
    namespace: String,
    data: RwLock<HashMap<String, Value>>,
}

impl MemoryKvStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            data: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Value>, AppError> {
        Ok(self.data.read().await.get(id).cloned())
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Option<Value>>, AppError> {
        let data = self.data.read().await;
        Ok(ids.iter().map(|id| data.get(id).cloned()).collect())
    }

    async fn filter_keys(&self, ids: &[String]) -> Result<HashSet<String>, AppError> {
        let data = self.data.read().await;
        Ok(ids
            .iter()
            .filter(|id| !data.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn upsert(&self, entries: Vec<(String, Value)>) -> Result<(), AppError> {
        self.data.write().await.extend(entries);
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), AppError> {
        let mut data = self.data.write().await;
        for id in ids {
            data.remove(id);
        }
        Ok(())
    }

    async fn all_keys(&self) -> Result<Vec<String>, AppError> {
        Ok(self.data.read().await.keys().cloned().collect())
    }

    async fn drop_all(&self) -> Result<(), AppError> {
        self.data.write().await.clear();
        Ok(())
    }
}

pub struct MemoryVectorStore {
    namespace: String,
    records: RwLock<HashMap<String, VectorRecord>>,
}

impl MemoryVectorStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            records: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), AppError> {
        let mut stored = self.records.write().await;
        for record in records {
            stored.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<VectorMatch>, AppError> {
        let stored = self.records.read().await;
        let mut matches: Vec<VectorMatch> = stored
            .values()
            .map(|record| VectorMatch {
                id: record.id.clone(),
                score: cosine_similarity(embedding, &record.embedding),
                content: record.content.clone(),
                metadata: record.metadata.clone(),
            })
            .filter(|candidate| candidate.score >= threshold)
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<VectorRecord>, AppError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), AppError> {
        let mut stored = self.records.write().await;
        for id in ids {
            stored.remove(id);
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize, AppError> {
        Ok(self.records.read().await.len())
    }

    async fn drop_all(&self) -> Result<(), AppError> {
        self.records.write().await.clear();
        Ok(())
    }
}

#[derive(Default)]
struct GraphData {
    nodes: HashMap<String, KnowledgeEntity>,
    edges: HashMap<(String, String), KnowledgeRelationship>,
    adjacency: HashMap<String, HashSet<(String, String)>>,
}

impl GraphData {
    fn unlink(&mut self, pair: &(String, String)) {
        for endpoint in [&pair.0, &pair.1] {
            if let Some(incident) = self.adjacency.get_mut(endpoint) {
                incident.remove(pair);
                if incident.is_empty() {
                    self.adjacency.remove(endpoint);
                }
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryGraphStore {
    data: RwLock<GraphData>,
    version: AtomicU64,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn get_node(&self, key: &str) -> Result<Option<KnowledgeEntity>, AppError> {
        Ok(self.data.read().await.nodes.get(key).cloned())
    }

    async fn get_nodes(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, KnowledgeEntity>, AppError> {
        let data = self.data.read().await;
        Ok(keys
            .iter()
            .filter_map(|key| data.nodes.get(key).map(|node| (key.clone(), node.clone())))
            .collect())
    }

    async fn upsert_node(&self, node: KnowledgeEntity) -> Result<(), AppError> {
        self.data.write().await.nodes.insert(node.key.clone(), node);
        self.bump();
        Ok(())
    }

    async fn delete_node(&self, key: &str) -> Result<(), AppError> {
        let mut data = self.data.write().await;
        data.nodes.remove(key);
        let incident: Vec<(String, String)> = data
            .adjacency
            .get(key)
            .map(|pairs| pairs.iter().cloned().collect())
            .unwrap_or_default();
        for pair in incident {
            data.edges.remove(&pair);
            data.unlink(&pair);
        }
        drop(data);
        self.bump();
        Ok(())
    }

    async fn get_edge(
        &self,
        a: &str,
        b: &str,
    ) -> Result<Option<KnowledgeRelationship>, AppError> {
        Ok(self.data.read().await.edges.get(&relation_pair(a, b)).cloned())
    }

    async fn get_edges(
        &self,
        pairs: &[(String, String)],
    ) -> Result<Vec<KnowledgeRelationship>, AppError> {
        let data = self.data.read().await;
        Ok(pairs
            .iter()
            .filter_map(|(a, b)| data.edges.get(&relation_pair(a, b)).cloned())
            .collect())
    }

    async fn upsert_edge(&self, edge: KnowledgeRelationship) -> Result<(), AppError> {
        let pair = relation_pair(&edge.src_id, &edge.tgt_id);
        let mut data = self.data.write().await;
        for endpoint in [&pair.0, &pair.1] {
            data.adjacency
                .entry(endpoint.clone())
                .or_default()
                .insert(pair.clone());
        }
        data.edges.insert(pair, edge);
        drop(data);
        self.bump();
        Ok(())
    }

    async fn delete_edge(&self, a: &str, b: &str) -> Result<(), AppError> {
        let pair = relation_pair(a, b);
        let mut data = self.data.write().await;
        data.edges.remove(&pair);
        data.unlink(&pair);
        drop(data);
        self.bump();
        Ok(())
    }

    async fn node_edges(&self, key: &str) -> Result<Vec<(String, String)>, AppError> {
        let data = self.data.read().await;
        let mut pairs: Vec<(String, String)> = data
            .adjacency
            .get(key)
            .map(|incident| incident.iter().cloned().collect())
            .unwrap_or_default();
        pairs.sort();
        Ok(pairs)
    }

    async fn all_nodes(&self) -> Result<Vec<KnowledgeEntity>, AppError> {
        let mut nodes: Vec<KnowledgeEntity> =
            self.data.read().await.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(nodes)
    }

    async fn all_edges(&self) -> Result<Vec<KnowledgeRelationship>, AppError> {
        let mut edges: Vec<KnowledgeRelationship> =
            self.data.read().await.edges.values().cloned().collect();
        edges.sort_by(|a, b| a.pair().cmp(&b.pair()));
        Ok(edges)
    }

    async fn nodes_with_sources(
        &self,
        chunk_ids: &[String],
    ) -> Result<Vec<KnowledgeEntity>, AppError> {
        let wanted: HashSet<&String> = chunk_ids.iter().collect();
        Ok(self
            .all_nodes()
            .await?
            .into_iter()
            .filter(|node| node.source_ids.iter().any(|id| wanted.contains(id)))
            .collect())
    }

    async fn edges_with_sources(
        &self,
        chunk_ids: &[String],
    ) -> Result<Vec<KnowledgeRelationship>, AppError> {
        let wanted: HashSet<&String> = chunk_ids.iter().collect();
        Ok(self
            .all_edges()
            .await?
            .into_iter()
            .filter(|edge| edge.source_ids.iter().any(|id| wanted.contains(id)))
            .collect())
    }

    async fn version(&self) -> Result<u64, AppError> {
        Ok(self.version.load(Ordering::SeqCst))
    }

    async fn drop_all(&self) -> Result<(), AppError> {
        *self.data.write().await = GraphData::default();
        self.bump();
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryDocStatusStore {
    records: RwLock<HashMap<String, DocumentRecord>>,
}

impl MemoryDocStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocStatusStore for MemoryDocStatusStore {
    async fn get(&self, id: &str) -> Result<Option<DocumentRecord>, AppError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn upsert(&self, records: Vec<DocumentRecord>) -> Result<(), AppError> {
        let mut stored = self.records.write().await;
        for record in records {
            stored.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), AppError> {
        let mut stored = self.records.write().await;
        for id in ids {
            stored.remove(id);
        }
        Ok(())
    }

    async fn by_status(&self, status: DocStatus) -> Result<Vec<DocumentRecord>, AppError> {
        let mut matching: Vec<DocumentRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|record| record.status == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(matching)
    }

    async fn by_track_id(&self, track_id: &str) -> Result<Vec<DocumentRecord>, AppError> {
        let mut matching: Vec<DocumentRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|record| record.track_id == track_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(matching)
    }

    async fn all(&self) -> Result<Vec<DocumentRecord>, AppError> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn drop_all(&self) -> Result<(), AppError> {
        self.records.write().await.clear();
        Ok(())
    }
}
