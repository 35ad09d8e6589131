use std::{collections::HashSet, sync::Arc, time::Instant};

use common::{
    error::AppError,
    storage::Storages,
    utils::locks::KeyedLocks,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use crate::merger::Merger;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeletionStatus {
    Success,
    NotFound,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeletionResult {
    pub status: DeletionStatus,
    pub doc_id: String,
    pub message: String,
    /// Source path of the deleted document, kept for audit trails.
    pub file_path: Option<String>,
}

/// Counts gathered while removing one document.
#[derive(Debug, Default)]
struct DeletionStats {
    chunks: usize,
    entities_removed: usize,
    entities_rebuilt: usize,
    relations_removed: usize,
    relations_rebuilt: usize,
}

/// Removes a document's contribution from every store. Relations are
/// handled before entities so a rebuilt relation never points at an entity
/// that has already lost its last chunk.
pub struct DeletionCoordinator {
    storages: Storages,
    merger: Arc<Merger>,
    doc_locks: Arc<KeyedLocks>,
}

impl DeletionCoordinator {
    pub fn new(storages: Storages, merger: Arc<Merger>, doc_locks: Arc<KeyedLocks>) -> Self {
        Self {
            storages,
            merger,
            doc_locks,
        }
    }

    #[instrument(skip(self))]
    pub async fn delete_document(&self, doc_id: &str) -> DeletionResult {
        let started = Instant::now();
        let _guard = self.doc_locks.lock(doc_id).await;

        match self.run(doc_id).await {
            Ok(Some((file_path, stats))) => {
                info!(
                    %doc_id,
                    chunks = stats.chunks,
                    entities_removed = stats.entities_removed,
                    entities_rebuilt = stats.entities_rebuilt,
                    relations_removed = stats.relations_removed,
                    relations_rebuilt = stats.relations_rebuilt,
                    total_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "document deleted"
                );
                DeletionResult {
                    status: DeletionStatus::Success,
                    doc_id: doc_id.to_string(),
                    message: format!(
                        "deleted {} chunk(s); removed {} entities and {} relations, rebuilt {} entities and {} relations",
                        stats.chunks,
                        stats.entities_removed,
                        stats.relations_removed,
                        stats.entities_rebuilt,
                        stats.relations_rebuilt
                    ),
                    file_path: Some(file_path),
                }
            }
            Ok(None) => DeletionResult {
                status: DeletionStatus::NotFound,
                doc_id: doc_id.to_string(),
                message: format!("document {doc_id} not found"),
                file_path: None,
            },
            Err(err) => {
                error!(%doc_id, error = %err, "document deletion failed");
                DeletionResult {
                    status: DeletionStatus::Failed,
                    doc_id: doc_id.to_string(),
                    message: err.to_string(),
                    file_path: None,
                }
            }
        }
    }

    async fn run(&self, doc_id: &str) -> Result<Option<(String, DeletionStats)>, AppError> {
        let Some(record) = self.storages.doc_status.get(doc_id).await? else {
            return Ok(None);
        };
        let chunk_ids = record.chunk_ids.clone();
        let deleted: HashSet<&str> = chunk_ids.iter().map(String::as_str).collect();
        let mut stats = DeletionStats {
            chunks: chunk_ids.len(),
            ..DeletionStats::default()
        };

        let (affected_entities, affected_relations) = if chunk_ids.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            (
                self.storages.graph.nodes_with_sources(&chunk_ids).await?,
                self.storages.graph.edges_with_sources(&chunk_ids).await?,
            )
        };
        debug!(
            %doc_id,
            chunks = chunk_ids.len(),
            entities = affected_entities.len(),
            relations = affected_relations.len(),
            "collected affected graph elements"
        );

        if !chunk_ids.is_empty() {
            self.storages.text_chunks.delete(&chunk_ids).await?;
            self.storages.chunks_vdb.delete(&chunk_ids).await?;
            self.storages.chunk_extractions.delete(&chunk_ids).await?;
        }

        let remaining = |sources: &[String]| -> Vec<String> {
            sources
                .iter()
                .filter(|id| !deleted.contains(id.as_str()))
                .cloned()
                .collect()
        };
        let entity_plan: Vec<(String, Vec<String>)> = affected_entities
            .iter()
            .map(|entity| (entity.key.clone(), remaining(&entity.source_ids)))
            .collect();
        let relation_plan: Vec<(String, String, Vec<String>)> = affected_relations
            .iter()
            .map(|relation| {
                (
                    relation.src_id.clone(),
                    relation.tgt_id.clone(),
                    remaining(&relation.source_ids),
                )
            })
            .collect();

        for (src, tgt, sources) in relation_plan {
            if sources.is_empty() {
                self.merger.remove_relation(&src, &tgt).await?;
                stats.relations_removed += 1;
            } else {
                self.merger.rebuild_relation(&src, &tgt, sources).await?;
                stats.relations_rebuilt += 1;
            }
        }

        for (key, sources) in entity_plan {
            if sources.is_empty() {
                self.merger.remove_entity(&key).await?;
                stats.entities_removed += 1;
            } else {
                self.merger.rebuild_entity(&key, sources).await?;
                stats.entities_rebuilt += 1;
            }
        }

        self.storages.full_docs.delete(&[doc_id.to_string()]).await?;
        self.storages.doc_status.delete(&[doc_id.to_string()]).await?;

        Ok(Some((record.file_path, stats)))
    }
}
