use std::collections::{HashMap, HashSet, VecDeque};

use common::{
    error::AppError,
    storage::{
        types::{knowledge_entity::KnowledgeEntity, knowledge_relationship::KnowledgeRelationship},
        Storages,
    },
    utils::hashing::{entity_key, relation_pair},
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

pub const DEFAULT_MAX_DEPTH: usize = 3;
pub const DEFAULT_MAX_NODES: usize = 1000;
pub const DEFAULT_SEARCH_LIMIT: usize = 50;

/// Label that selects the whole graph.
pub const ALL_NODES: &str = "*";

#[derive(Debug, Clone, Default, Serialize)]
pub struct KnowledgeGraph {
    pub nodes: Vec<KnowledgeEntity>,
    pub edges: Vec<KnowledgeRelationship>,
    /// Set when the node cap cut the traversal short.
    pub is_truncated: bool,
}

/// Read-only views over the graph store for browsing clients.
pub struct GraphExplorer {
    storages: Storages,
    labels: Mutex<Option<(u64, Vec<String>)>>,
}

impl GraphExplorer {
    pub fn new(storages: Storages) -> Self {
        Self {
            storages,
            labels: Mutex::new(None),
        }
    }

    /// Breadth-first subgraph around `label`, or the highest-degree nodes of
    /// the whole graph for `*`. Edges are kept only between returned nodes.
    pub async fn knowledge_graph(
        &self,
        label: &str,
        max_depth: usize,
        max_nodes: usize,
    ) -> Result<KnowledgeGraph, AppError> {
        let graph = &self.storages.graph;
        if label.trim() == ALL_NODES {
            let mut nodes = graph.all_nodes().await?;
            let edges = graph.all_edges().await?;
            let is_truncated = nodes.len() > max_nodes;
            if is_truncated {
                let mut degree: HashMap<&str, usize> = HashMap::new();
                for edge in &edges {
                    *degree.entry(edge.src_id.as_str()).or_default() += 1;
                    *degree.entry(edge.tgt_id.as_str()).or_default() += 1;
                }
                nodes.sort_by(|a, b| {
                    let da = degree.get(a.key.as_str()).copied().unwrap_or_default();
                    let db = degree.get(b.key.as_str()).copied().unwrap_or_default();
                    db.cmp(&da).then_with(|| a.key.cmp(&b.key))
                });
                nodes.truncate(max_nodes);
            }
            let kept: HashSet<&str> = nodes.iter().map(|node| node.key.as_str()).collect();
            let edges = edges
                .into_iter()
                .filter(|edge| kept.contains(edge.src_id.as_str()) && kept.contains(edge.tgt_id.as_str()))
                .collect();
            return Ok(KnowledgeGraph {
                nodes,
                edges,
                is_truncated,
            });
        }

        let start = entity_key(label);
        let Some(root) = graph.get_node(&start).await? else {
            return Ok(KnowledgeGraph::default());
        };

        let mut nodes = vec![root];
        let mut visited: HashSet<String> = HashSet::from([start.clone()]);
        let mut pairs: Vec<(String, String)> = Vec::new();
        let mut seen_pairs = HashSet::new();
        let mut queue = VecDeque::from([(start, 0usize)]);
        let mut is_truncated = false;

        'walk: while let Some((key, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for (a, b) in graph.node_edges(&key).await? {
                let pair = relation_pair(&a, &b);
                let neighbor = if pair.0 == key { pair.1.clone() } else { pair.0.clone() };
                if !visited.contains(&neighbor) {
                    if nodes.len() >= max_nodes {
                        is_truncated = true;
                        break 'walk;
                    }
                    let Some(node) = graph.get_node(&neighbor).await? else {
                        continue;
                    };
                    visited.insert(neighbor.clone());
                    nodes.push(node);
                    queue.push_back((neighbor, depth + 1));
                }
                if seen_pairs.insert(pair.clone()) {
                    pairs.push(pair);
                }
            }
        }

        let edges = graph
            .get_edges(&pairs)
            .await?
            .into_iter()
            .filter(|edge| visited.contains(&edge.src_id) && visited.contains(&edge.tgt_id))
            .collect::<Vec<_>>();
        debug!(
            label,
            nodes = nodes.len(),
            edges = edges.len(),
            is_truncated,
            "knowledge subgraph collected"
        );
        Ok(KnowledgeGraph {
            nodes,
            edges,
            is_truncated,
        })
    }

    /// Sorted entity names. Cached until the graph version moves.
    pub async fn graph_labels(&self) -> Result<Vec<String>, AppError> {
        let version = self.storages.graph.version().await?;
        let mut cache = self.labels.lock().await;
        if let Some((cached_version, labels)) = cache.as_ref() {
            if *cached_version == version {
                return Ok(labels.clone());
            }
        }

        let mut labels: Vec<String> = self
            .storages
            .graph
            .all_nodes()
            .await?
            .into_iter()
            .map(|node| node.name)
            .collect();
        labels.sort();
        labels.dedup();
        *cache = Some((version, labels.clone()));
        Ok(labels)
    }

    /// Case-insensitive substring match on entity name or description. Name
    /// matches rank first.
    pub async fn search_entities(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeEntity>, AppError> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let mut by_name = Vec::new();
        let mut by_description = Vec::new();
        for node in self.storages.graph.all_nodes().await? {
            if node.name.to_lowercase().contains(&needle) {
                by_name.push(node);
            } else if node
                .descriptions
                .iter()
                .any(|description| description.to_lowercase().contains(&needle))
            {
                by_description.push(node);
            }
        }
        by_name.extend(by_description);
        by_name.truncate(limit);
        Ok(by_name)
    }
}
