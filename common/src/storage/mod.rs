pub mod db;
pub mod memory;
pub mod retrying;
pub mod surreal;
pub mod traits;
pub mod types;

use std::sync::Arc;

use tracing::info;

use crate::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        memory::{MemoryDocStatusStore, MemoryGraphStore, MemoryKvStore, MemoryVectorStore},
        retrying::Retrying,
        surreal::{SurrealDocStatusStore, SurrealGraphStore, SurrealKvStore, SurrealVectorStore},
        traits::{DocStatusStore, GraphStore, KeyValueStore, VectorStore},
    },
    utils::{
        config::{AppConfig, StorageKind},
        retry::RetryPolicy,
    },
};

pub const FULL_DOCS: &str = "full_docs";
pub const TEXT_CHUNKS: &str = "text_chunks";
pub const CHUNK_EXTRACTIONS: &str = "chunk_extractions";
pub const LLM_RESPONSE_CACHE: &str = "llm_response_cache";
pub const ENTITIES_VDB: &str = "entities";
pub const RELATIONSHIPS_VDB: &str = "relationships";
pub const CHUNKS_VDB: &str = "chunks";
pub const GRAPH: &str = "chunk_entity_relation";
pub const DOC_STATUS: &str = "doc_status";

/// Every store the engine reads or writes, bound to one workspace.
#[derive(Clone)]
pub struct Storages {
    pub full_docs: Arc<dyn KeyValueStore>,
    pub text_chunks: Arc<dyn KeyValueStore>,
    pub chunk_extractions: Arc<dyn KeyValueStore>,
    pub llm_cache: Arc<dyn KeyValueStore>,
    pub entities_vdb: Arc<dyn VectorStore>,
    pub relationships_vdb: Arc<dyn VectorStore>,
    pub chunks_vdb: Arc<dyn VectorStore>,
    pub graph: Arc<dyn GraphStore>,
    pub doc_status: Arc<dyn DocStatusStore>,
}

impl Storages {
    pub fn in_memory(config: &AppConfig) -> Self {
        Self {
            full_docs: Arc::new(MemoryKvStore::new(config.namespace(FULL_DOCS))),
            text_chunks: Arc::new(MemoryKvStore::new(config.namespace(TEXT_CHUNKS))),
            chunk_extractions: Arc::new(MemoryKvStore::new(config.namespace(CHUNK_EXTRACTIONS))),
            llm_cache: Arc::new(MemoryKvStore::new(config.namespace(LLM_RESPONSE_CACHE))),
            entities_vdb: Arc::new(MemoryVectorStore::new(config.namespace(ENTITIES_VDB))),
            relationships_vdb: Arc::new(MemoryVectorStore::new(
                config.namespace(RELATIONSHIPS_VDB),
            )),
            chunks_vdb: Arc::new(MemoryVectorStore::new(config.namespace(CHUNKS_VDB))),
            graph: Arc::new(MemoryGraphStore::new()),
            doc_status: Arc::new(MemoryDocStatusStore::new()),
        }
    }

    pub fn surreal(db: Arc<SurrealDbClient>, config: &AppConfig) -> Self {
        Self {
            full_docs: Arc::new(SurrealKvStore::new(db.clone(), &config.namespace(FULL_DOCS))),
            text_chunks: Arc::new(SurrealKvStore::new(db.clone(), &config.namespace(TEXT_CHUNKS))),
            chunk_extractions: Arc::new(SurrealKvStore::new(
                db.clone(),
                &config.namespace(CHUNK_EXTRACTIONS),
            )),
            llm_cache: Arc::new(SurrealKvStore::new(
                db.clone(),
                &config.namespace(LLM_RESPONSE_CACHE),
            )),
            entities_vdb: Arc::new(SurrealVectorStore::new(
                db.clone(),
                &config.namespace(ENTITIES_VDB),
            )),
            relationships_vdb: Arc::new(SurrealVectorStore::new(
                db.clone(),
                &config.namespace(RELATIONSHIPS_VDB),
            )),
            chunks_vdb: Arc::new(SurrealVectorStore::new(db.clone(), &config.namespace(CHUNKS_VDB))),
            graph: Arc::new(SurrealGraphStore::new(db.clone(), &config.namespace(GRAPH))),
            doc_status: Arc::new(SurrealDocStatusStore::new(db, &config.namespace(DOC_STATUS))),
        }
    }

    pub async fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let storages = match config.storage {
            StorageKind::Memory => Self::in_memory(config),
            StorageKind::SurrealDb => {
                let db = Arc::new(SurrealDbClient::from_config(config).await?);
                Self::surreal(db, config)
            }
        };
        info!(storage = ?config.storage, workspace = %config.workspace, "storages configured");
        Ok(storages)
    }

    /// Wraps every store so transient failures are retried under `policy`.
    #[must_use]
    pub fn with_retry(self, policy: RetryPolicy) -> Self {
        fn kv(store: Arc<dyn KeyValueStore>, policy: RetryPolicy) -> Arc<dyn KeyValueStore> {
            Arc::new(Retrying::new(store, policy))
        }
        fn vectors(store: Arc<dyn VectorStore>, policy: RetryPolicy) -> Arc<dyn VectorStore> {
            Arc::new(Retrying::new(store, policy))
        }
        Self {
            full_docs: kv(self.full_docs, policy),
            text_chunks: kv(self.text_chunks, policy),
            chunk_extractions: kv(self.chunk_extractions, policy),
            llm_cache: kv(self.llm_cache, policy),
            entities_vdb: vectors(self.entities_vdb, policy),
            relationships_vdb: vectors(self.relationships_vdb, policy),
            chunks_vdb: vectors(self.chunks_vdb, policy),
            graph: Arc::new(Retrying::new(self.graph, policy)),
            doc_status: Arc::new(Retrying::new(self.doc_status, policy)),
        }
    }

    fn key_values(&self) -> [&Arc<dyn KeyValueStore>; 4] {
        [
            &self.full_docs,
            &self.text_chunks,
            &self.chunk_extractions,
            &self.llm_cache,
        ]
    }

    fn vectors(&self) -> [&Arc<dyn VectorStore>; 3] {
        [&self.entities_vdb, &self.relationships_vdb, &self.chunks_vdb]
    }

    pub async fn initialize(&self) -> Result<(), AppError> {
        for store in self.key_values() {
            store.initialize().await?;
        }
        for store in self.vectors() {
            store.initialize().await?;
        }
        self.graph.initialize().await?;
        self.doc_status.initialize().await
    }

    pub async fn finalize(&self) -> Result<(), AppError> {
        for store in self.key_values() {
            store.finalize().await?;
        }
        for store in self.vectors() {
            store.finalize().await?;
        }
        self.graph.finalize().await?;
        self.doc_status.finalize().await
    }

    /// Empties every store except the response cache.
    pub async fn drop_all(&self) -> Result<(), AppError> {
        self.full_docs.drop_all().await?;
        self.text_chunks.drop_all().await?;
        self.chunk_extractions.drop_all().await?;
        for store in self.vectors() {
            store.drop_all().await?;
        }
        self.graph.drop_all().await?;
        self.doc_status.drop_all().await
    }
}
