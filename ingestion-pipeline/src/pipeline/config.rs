use common::utils::config::AppConfig;

#[derive(Debug, Clone)]
pub struct IngestionTuning {
    pub chunk_token_size: usize,
    pub chunk_overlap_token_size: usize,
    pub split_by_character: Option<String>,
    pub split_by_character_only: bool,
    /// Documents processed at the same time.
    pub max_parallel_insert: usize,
    /// Chunk extractions in flight across all documents.
    pub chunk_concurrency: usize,
    pub status_history_len: usize,
}

impl Default for IngestionTuning {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

impl IngestionTuning {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            chunk_token_size: config.chunk_token_size,
            chunk_overlap_token_size: config.chunk_overlap_token_size,
            split_by_character: None,
            split_by_character_only: false,
            max_parallel_insert: config.max_parallel_insert.max(1),
            chunk_concurrency: config.chunk_concurrency.max(1),
            status_history_len: 10,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestionConfig {
    pub tuning: IngestionTuning,
    /// Chunk and embed only; skip graph extraction.
    pub chunk_only: bool,
}

impl IngestionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            tuning: IngestionTuning::from_app_config(config),
            chunk_only: false,
        }
    }
}
