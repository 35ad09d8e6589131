use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::AppError,
    storage::types::{
        document::{DocStatus, DocumentRecord},
        knowledge_entity::KnowledgeEntity,
        knowledge_relationship::KnowledgeRelationship,
    },
};

/// Namespaced key-value storage for raw text, chunks, extraction results, and
/// the model response cache.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    fn namespace(&self) -> &str;
    async fn initialize(&self) -> Result<(), AppError> {
        Ok(())
    }
    async fn finalize(&self) -> Result<(), AppError> {
        Ok(())
    }
    async fn get_by_id(&self, id: &str) -> Result<Option<Value>, AppError>;
    /// Values in the order of `ids`; missing keys yield `None`.
    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Option<Value>>, AppError>;
    /// The subset of `ids` not present in the store.
    async fn filter_keys(&self, ids: &[String]) -> Result<HashSet<String>, AppError>;
    async fn upsert(&self, entries: Vec<(String, Value)>) -> Result<(), AppError>;
    async fn delete(&self, ids: &[String]) -> Result<(), AppError>;
    async fn all_keys(&self) -> Result<Vec<String>, AppError>;
    async fn drop_all(&self) -> Result<(), AppError>;
}

/// Typed access on top of [`KeyValueStore`].
#[async_trait]
pub trait KeyValueStoreExt: KeyValueStore {
    async fn get_typed<T: DeserializeOwned + Send>(&self, id: &str) -> Result<Option<T>, AppError> {
        self.get_by_id(id)
            .await?
            .map(serde_json::from_value)
            .transpose()
            .map_err(AppError::from)
    }

    async fn get_many_typed<T: DeserializeOwned + Send>(
        &self,
        ids: &[String],
    ) -> Result<Vec<Option<T>>, AppError> {
        self.get_by_ids(ids)
            .await?
            .into_iter()
            .map(|value| value.map(serde_json::from_value).transpose())
            .collect::<Result<Vec<_>, _>>()
            .map_err(AppError::from)
    }

    async fn upsert_typed<T: Serialize + Sync>(
        &self,
        entries: Vec<(String, &T)>,
    ) -> Result<(), AppError> {
        let values = entries
            .into_iter()
            .map(|(id, item)| Ok((id, serde_json::to_value(item)?)))
            .collect::<Result<Vec<_>, serde_json::Error>>()?;
        self.upsert(values).await
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    /// The text that was embedded.
    pub content: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    pub content: String,
    pub metadata: Value,
}

/// Embedding index for one namespace (entities, relationships, or chunks).
#[async_trait]
pub trait VectorStore: Send + Sync {
    fn namespace(&self) -> &str;
    async fn initialize(&self) -> Result<(), AppError> {
        Ok(())
    }
    async fn finalize(&self) -> Result<(), AppError> {
        Ok(())
    }
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), AppError>;
    /// Best matches by cosine similarity, descending, at or above `threshold`.
    async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<VectorMatch>, AppError>;
    async fn get_by_id(&self, id: &str) -> Result<Option<VectorRecord>, AppError>;
    async fn delete(&self, ids: &[String]) -> Result<(), AppError>;
    async fn count(&self) -> Result<usize, AppError>;
    async fn drop_all(&self) -> Result<(), AppError>;
}

/// Entity/relation graph keyed by entity key and canonical key pair.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn initialize(&self) -> Result<(), AppError> {
        Ok(())
    }
    async fn finalize(&self) -> Result<(), AppError> {
        Ok(())
    }
    async fn has_node(&self, key: &str) -> Result<bool, AppError> {
        Ok(self.get_node(key).await?.is_some())
    }
    async fn get_node(&self, key: &str) -> Result<Option<KnowledgeEntity>, AppError>;
    async fn get_nodes(&self, keys: &[String])
        -> Result<HashMap<String, KnowledgeEntity>, AppError>;
    async fn upsert_node(&self, node: KnowledgeEntity) -> Result<(), AppError>;
    /// Removes the node and every edge incident to it.
    async fn delete_node(&self, key: &str) -> Result<(), AppError>;
    /// Endpoints in either order.
    async fn get_edge(&self, a: &str, b: &str) -> Result<Option<KnowledgeRelationship>, AppError>;
    async fn get_edges(
        &self,
        pairs: &[(String, String)],
    ) -> Result<Vec<KnowledgeRelationship>, AppError>;
    async fn upsert_edge(&self, edge: KnowledgeRelationship) -> Result<(), AppError>;
    async fn delete_edge(&self, a: &str, b: &str) -> Result<(), AppError>;
    /// Canonical pairs of the edges incident to `key`.
    async fn node_edges(&self, key: &str) -> Result<Vec<(String, String)>, AppError>;
    async fn node_degree(&self, key: &str) -> Result<usize, AppError> {
        Ok(self.node_edges(key).await?.len())
    }
    async fn all_nodes(&self) -> Result<Vec<KnowledgeEntity>, AppError>;
    async fn all_edges(&self) -> Result<Vec<KnowledgeRelationship>, AppError>;
    /// Entities whose source set intersects `chunk_ids`.
    async fn nodes_with_sources(
        &self,
        chunk_ids: &[String],
    ) -> Result<Vec<KnowledgeEntity>, AppError>;
    /// Relations whose source set intersects `chunk_ids`.
    async fn edges_with_sources(
        &self,
        chunk_ids: &[String],
    ) -> Result<Vec<KnowledgeRelationship>, AppError>;
    /// Monotonic counter bumped on every mutation; lets readers in other
    /// processes notice that cached graph views are stale.
    async fn version(&self) -> Result<u64, AppError>;
    async fn drop_all(&self) -> Result<(), AppError>;
}

#[async_trait]
pub trait DocStatusStore: Send + Sync {
    async fn initialize(&self) -> Result<(), AppError> {
        Ok(())
    }
    async fn finalize(&self) -> Result<(), AppError> {
        Ok(())
    }
    async fn get(&self, id: &str) -> Result<Option<DocumentRecord>, AppError>;
    async fn upsert(&self, records: Vec<DocumentRecord>) -> Result<(), AppError>;
    async fn delete(&self, ids: &[String]) -> Result<(), AppError>;
    async fn by_status(&self, status: DocStatus) -> Result<Vec<DocumentRecord>, AppError>;
    async fn by_track_id(&self, track_id: &str) -> Result<Vec<DocumentRecord>, AppError>;
    async fn all(&self) -> Result<Vec<DocumentRecord>, AppError>;
    async fn status_counts(&self) -> Result<HashMap<DocStatus, usize>, AppError> {
        let mut counts = HashMap::new();
        for record in self.all().await? {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
    async fn drop_all(&self) -> Result<(), AppError>;
}
