use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    error::AppError,
    storage::{
        traits::{DocStatusStore, GraphStore, KeyValueStore, VectorMatch, VectorRecord, VectorStore},
        types::{
            document::{DocStatus, DocumentRecord},
            knowledge_entity::KnowledgeEntity,
            knowledge_relationship::KnowledgeRelationship,
        },
    },
    utils::retry::RetryPolicy,
};

/// Wraps a store so every call is retried on transient failure.
pub struct Retrying<S: ?Sized> {
    inner: Arc<S>,
    policy: RetryPolicy,
}

impl<S: ?Sized> Retrying<S> {
    pub fn new(inner: Arc<S>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl KeyValueStore for Retrying<dyn KeyValueStore> {
    fn namespace(&self) -> &str {
        self.inner.namespace()
    }

    async fn initialize(&self) -> Result<(), AppError> {
        self.policy.run("kv.initialize", || self.inner.initialize()).await
    }

    async fn finalize(&self) -> Result<(), AppError> {
        self.inner.finalize().await
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Value>, AppError> {
        self.policy.run("kv.get_by_id", || self.inner.get_by_id(id)).await
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Option<Value>>, AppError> {
        self.policy.run("kv.get_by_ids", || self.inner.get_by_ids(ids)).await
    }

    async fn filter_keys(&self, ids: &[String]) -> Result<HashSet<String>, AppError> {
        self.policy.run("kv.filter_keys", || self.inner.filter_keys(ids)).await
    }

    async fn upsert(&self, entries: Vec<(String, Value)>) -> Result<(), AppError> {
        self.policy
            .run("kv.upsert", || self.inner.upsert(entries.clone()))
            .await
    }

    async fn delete(&self, ids: &[String]) -> Result<(), AppError> {
        self.policy.run("kv.delete", || self.inner.delete(ids)).await
    }

    async fn all_keys(&self) -> Result<Vec<String>, AppError> {
        self.policy.run("kv.all_keys", || self.inner.all_keys()).await
    }

    async fn drop_all(&self) -> Result<(), AppError> {
        self.policy.run("kv.drop_all", || self.inner.drop_all()).await
    }
}

#[async_trait]
impl VectorStore for Retrying<dyn VectorStore> {
    fn namespace(&self) -> &str {
        self.inner.namespace()
    }

    async fn initialize(&self) -> Result<(), AppError> {
        self.policy.run("vector.initialize", || self.inner.initialize()).await
    }

    async fn finalize(&self) -> Result<(), AppError> {
        self.inner.finalize().await
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), AppError> {
        self.policy
            .run("vector.upsert", || self.inner.upsert(records.clone()))
            .await
    }

    async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<VectorMatch>, AppError> {
        self.policy
            .run("vector.query", || self.inner.query(embedding, top_k, threshold))
            .await
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<VectorRecord>, AppError> {
        self.policy.run("vector.get_by_id", || self.inner.get_by_id(id)).await
    }

    async fn delete(&self, ids: &[String]) -> Result<(), AppError> {
        self.policy.run("vector.delete", || self.inner.delete(ids)).await
    }

    async fn count(&self) -> Result<usize, AppError> {
        self.policy.run("vector.count", || self.inner.count()).await
    }

    async fn drop_all(&self) -> Result<(), AppError> {
        self.policy.run("vector.drop_all", || self.inner.drop_all()).await
    }
}

#[async_trait]
impl GraphStore for Retrying<dyn GraphStore> {
    async fn initialize(&self) -> Result<(), AppError> {
        self.policy.run("graph.initialize", || self.inner.initialize()).await
    }

    async fn finalize(&self) -> Result<(), AppError> {
        self.inner.finalize().await
    }

    async fn get_node(&self, key: &str) -> Result<Option<KnowledgeEntity>, AppError> {
        self.policy.run("graph.get_node", || self.inner.get_node(key)).await
    }

    async fn get_nodes(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, KnowledgeEntity>, AppError> {
        self.policy.run("graph.get_nodes", || self.inner.get_nodes(keys)).await
    }

    async fn upsert_node(&self, node: KnowledgeEntity) -> Result<(), AppError> {
        self.policy
            .run("graph.upsert_node", || self.inner.upsert_node(node.clone()))
            .await
    }

    async fn delete_node(&self, key: &str) -> Result<(), AppError> {
        self.policy.run("graph.delete_node", || self.inner.delete_node(key)).await
    }

    async fn get_edge(&self, a: &str, b: &str) -> Result<Option<KnowledgeRelationship>, AppError> {
        self.policy.run("graph.get_edge", || self.inner.get_edge(a, b)).await
    }

    async fn get_edges(
        &self,
        pairs: &[(String, String)],
    ) -> Result<Vec<KnowledgeRelationship>, AppError> {
        self.policy.run("graph.get_edges", || self.inner.get_edges(pairs)).await
    }

    async fn upsert_edge(&self, edge: KnowledgeRelationship) -> Result<(), AppError> {
        self.policy
            .run("graph.upsert_edge", || self.inner.upsert_edge(edge.clone()))
            .await
    }

    async fn delete_edge(&self, a: &str, b: &str) -> Result<(), AppError> {
        self.policy.run("graph.delete_edge", || self.inner.delete_edge(a, b)).await
    }

    async fn node_edges(&self, key: &str) -> Result<Vec<(String, String)>, AppError> {
        self.policy.run("graph.node_edges", || self.inner.node_edges(key)).await
    }

    async fn all_nodes(&self) -> Result<Vec<KnowledgeEntity>, AppError> {
        self.policy.run("graph.all_nodes", || self.inner.all_nodes()).await
    }

    async fn all_edges(&self) -> Result<Vec<KnowledgeRelationship>, AppError> {
        self.policy.run("graph.all_edges", || self.inner.all_edges()).await
    }

    async fn nodes_with_sources(
        &self,
        chunk_ids: &[String],
    ) -> Result<Vec<KnowledgeEntity>, AppError> {
        self.policy
            .run("graph.nodes_with_sources", || self.inner.nodes_with_sources(chunk_ids))
            .await
    }

    async fn edges_with_sources(
        &self,
        chunk_ids: &[String],
    ) -> Result<Vec<KnowledgeRelationship>, AppError> {
        self.policy
            .run("graph.edges_with_sources", || self.inner.edges_with_sources(chunk_ids))
            .await
    }

    async fn version(&self) -> Result<u64, AppError> {
        self.policy.run("graph.version", || self.inner.version()).await
    }

    async fn drop_all(&self) -> Result<(), AppError> {
        self.policy.run("graph.drop_all", || self.inner.drop_all()).await
    }
}

#[async_trait]
impl DocStatusStore for Retrying<dyn DocStatusStore> {
    async fn initialize(&self) -> Result<(), AppError> {
        self.policy.run("doc_status.initialize", || self.inner.initialize()).await
    }

    async fn finalize(&self) -> Result<(), AppError> {
        self.inner.finalize().await
    }

    async fn get(&self, id: &str) -> Result<Option<DocumentRecord>, AppError> {
        self.policy.run("doc_status.get", || self.inner.get(id)).await
    }

    async fn upsert(&self, records: Vec<DocumentRecord>) -> Result<(), AppError> {
        self.policy
            .run("doc_status.upsert", || self.inner.upsert(records.clone()))
            .await
    }

    async fn delete(&self, ids: &[String]) -> Result<(), AppError> {
        self.policy.run("doc_status.delete", || self.inner.delete(ids)).await
    }

    async fn by_status(&self, status: DocStatus) -> Result<Vec<DocumentRecord>, AppError> {
        self.policy
            .run("doc_status.by_status", || self.inner.by_status(status))
            .await
    }

    async fn by_track_id(&self, track_id: &str) -> Result<Vec<DocumentRecord>, AppError> {
        self.policy
            .run("doc_status.by_track_id", || self.inner.by_track_id(track_id))
            .await
    }

    async fn all(&self) -> Result<Vec<DocumentRecord>, AppError> {
        self.policy.run("doc_status.all", || self.inner.all()).await
    }

    async fn drop_all(&self) -> Result<(), AppError> {
        self.policy.run("doc_status.drop_all", || self.inner.drop_all()).await
    }
}
