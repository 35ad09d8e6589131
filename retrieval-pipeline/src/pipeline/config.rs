use serde::{Deserialize, Serialize};
use std::fmt;

use common::utils::{config::AppConfig, llm::ChatTurn};

/// Retrieval mode of a query.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// Entities by low-level keywords, then their relations and chunks
    Local,
    /// Relations by high-level keywords, then their endpoints and chunks
    Global,
    /// Local and global interleaved
    Hybrid,
    /// Chunk vector search on the raw query
    Naive,
    /// Hybrid plus chunk vector search
    #[default]
    Mix,
    /// No retrieval; the query goes straight to the model
    Bypass,
}

impl QueryMode {
    pub fn uses_entities(self) -> bool {
        matches!(self, Self::Local | Self::Hybrid | Self::Mix)
    }

    pub fn uses_relations(self) -> bool {
        matches!(self, Self::Global | Self::Hybrid | Self::Mix)
    }

    pub fn uses_vector_chunks(self) -> bool {
        matches!(self, Self::Naive | Self::Mix)
    }

    pub fn needs_keywords(self) -> bool {
        self.uses_entities() || self.uses_relations()
    }
}

impl std::str::FromStr for QueryMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "global" => Ok(Self::Global),
            "hybrid" => Ok(Self::Hybrid),
            "naive" => Ok(Self::Naive),
            "mix" => Ok(Self::Mix),
            "bypass" => Ok(Self::Bypass),
            other => Err(format!("unknown query mode '{other}'")),
        }
    }
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QueryMode::Local => "local",
            QueryMode::Global => "global",
            QueryMode::Hybrid => "hybrid",
            QueryMode::Naive => "naive",
            QueryMode::Mix => "mix",
            QueryMode::Bypass => "bypass",
        };
        f.write_str(label)
    }
}

/// Where a context chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkSource {
    Entity,
    Relation,
    Vector,
}

/// Engine-wide retrieval knobs that do not change per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalTuning {
    pub cosine_threshold: f32,
    /// Chunks resolved per entity or relation.
    pub related_chunk_number: usize,
    /// Tokens held back from the chunk budget for prompt framing.
    pub safety_margin_tokens: usize,
    /// Round-robin order of chunk sources; on a duplicate the earlier
    /// source keeps the chunk.
    pub chunk_source_order: Vec<ChunkSource>,
}

impl Default for RetrievalTuning {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

impl RetrievalTuning {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            cosine_threshold: config.cosine_threshold,
            related_chunk_number: config.related_chunk_number.max(1),
            safety_margin_tokens: 200,
            chunk_source_order: vec![ChunkSource::Entity, ChunkSource::Relation, ChunkSource::Vector],
        }
    }
}

/// Per-request query options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryParam {
    pub mode: QueryMode,
    pub top_k_entities: usize,
    pub top_k_relations: usize,
    pub chunk_top_k: usize,
    pub max_entity_tokens: usize,
    pub max_relation_tokens: usize,
    pub max_total_tokens: usize,
    pub stream: bool,
    pub only_need_context: bool,
    pub only_need_prompt: bool,
    /// Keep going with what was retrieved when one source fails.
    pub allow_partial: bool,
    pub response_type: String,
    pub user_prompt: Option<String>,
    pub conversation_history: Vec<ChatTurn>,
    pub hl_keywords: Vec<String>,
    pub ll_keywords: Vec<String>,
    pub enable_rerank: bool,
}

impl Default for QueryParam {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

impl QueryParam {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            mode: QueryMode::default(),
            top_k_entities: config.top_k,
            top_k_relations: config.top_k,
            chunk_top_k: config.chunk_top_k,
            max_entity_tokens: config.max_entity_tokens,
            max_relation_tokens: config.max_relation_tokens,
            max_total_tokens: config.max_total_tokens,
            stream: false,
            only_need_context: false,
            only_need_prompt: false,
            allow_partial: false,
            response_type: "Multiple Paragraphs".to_string(),
            user_prompt: None,
            conversation_history: Vec::new(),
            hl_keywords: Vec::new(),
            ll_keywords: Vec::new(),
            enable_rerank: config.reranking_enabled,
        }
    }

    pub fn with_mode(mut self, mode: QueryMode) -> Self {
        self.mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_round_trip_through_strings() {
        for mode in [
            QueryMode::Local,
            QueryMode::Global,
            QueryMode::Hybrid,
            QueryMode::Naive,
            QueryMode::Mix,
            QueryMode::Bypass,
        ] {
            assert_eq!(mode.to_string().parse::<QueryMode>(), Ok(mode));
        }
        assert_eq!("  HYBRID ".parse::<QueryMode>(), Ok(QueryMode::Hybrid));
        assert!("graph".parse::<QueryMode>().is_err());
    }

    #[test]
    fn mode_sources_follow_the_dispatch_table() {
        assert!(QueryMode::Local.uses_entities() && !QueryMode::Local.uses_relations());
        assert!(QueryMode::Global.uses_relations() && !QueryMode::Global.uses_entities());
        assert!(!QueryMode::Hybrid.uses_vector_chunks());
        assert!(QueryMode::Mix.uses_vector_chunks() && QueryMode::Mix.needs_keywords());
        assert!(!QueryMode::Naive.needs_keywords());
        assert!(!QueryMode::Bypass.needs_keywords() && !QueryMode::Bypass.uses_vector_chunks());
    }
}
