use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::utils::embedding::EmbeddingBackend;

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    #[serde(alias = "surreal")]
    SurrealDb,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Memory
}

/// Which chunk ids survive once an entity or relation hits its source cap.
#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceIdsLimitMethod {
    /// Keep the oldest ids and ignore new ones.
    #[default]
    Keep,
    /// Keep the newest ids and evict the oldest.
    Fifo,
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct AppConfig {
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub llm_model: String,
    pub llm_temperature: f32,
    pub embedding_backend: EmbeddingBackend,
    pub embedding_model: Option<String>,
    pub embedding_dimensions: u32,
    pub storage: StorageKind,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    pub workspace: String,
    pub data_dir: String,

    // Ingestion
    pub chunk_token_size: usize,
    pub chunk_overlap_token_size: usize,
    pub entity_types: Vec<String>,
    pub summary_language: String,
    pub max_gleaning: usize,
    pub force_llm_summary_on_merge: usize,
    pub summary_max_tokens: usize,
    pub summary_context_size: usize,
    pub max_source_ids_per_entity: usize,
    pub max_source_ids_per_relation: usize,
    pub source_ids_limit_method: SourceIdsLimitMethod,
    pub max_parallel_insert: usize,
    pub chunk_concurrency: usize,

    // Model access
    pub llm_max_async: usize,
    pub embedding_max_async: usize,
    pub embedding_batch_num: usize,
    pub enable_llm_cache: bool,
    pub retry_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,

    // Query
    pub top_k: usize,
    pub chunk_top_k: usize,
    pub max_entity_tokens: usize,
    pub max_relation_tokens: usize,
    pub max_total_tokens: usize,
    pub cosine_threshold: f32,
    pub related_chunk_number: usize,

    // Reranking
    pub reranking_enabled: bool,
    pub reranking_pool_size: Option<usize>,
    pub fastembed_cache_dir: Option<String>,
    pub fastembed_show_download_progress: Option<bool>,
    pub fastembed_max_length: Option<usize>,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_backend() -> EmbeddingBackend {
    EmbeddingBackend::Hashed
}

fn default_embedding_dimensions() -> u32 {
    1536
}

fn default_surrealdb_address() -> String {
    "mem://".to_string()
}

fn default_surrealdb_credential() -> String {
    "root".to_string()
}

fn default_surrealdb_namespace() -> String {
    "graphrag".to_string()
}

fn default_surrealdb_database() -> String {
    "graphrag".to_string()
}

fn default_workspace() -> String {
    "default".to_string()
}

fn default_chunk_token_size() -> usize {
    1200
}

fn default_chunk_overlap_token_size() -> usize {
    100
}

pub fn default_entity_types() -> Vec<String> {
    [
        "PERSON",
        "ORGANIZATION",
        "LOCATION",
        "EVENT",
        "CONCEPT",
        "TECHNOLOGY",
        "PRODUCT",
        "PROJECT",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_summary_language() -> String {
    "English".to_string()
}

fn default_max_gleaning() -> usize {
    1
}

fn default_force_llm_summary_on_merge() -> usize {
    8
}

fn default_summary_max_tokens() -> usize {
    500
}

fn default_summary_context_size() -> usize {
    10_000
}

fn default_max_source_ids() -> usize {
    300
}

fn default_max_parallel_insert() -> usize {
    2
}

fn default_chunk_concurrency() -> usize {
    4
}

fn default_llm_max_async() -> usize {
    4
}

fn default_embedding_max_async() -> usize {
    8
}

fn default_embedding_batch_num() -> usize {
    10
}

fn default_retry_attempts() -> usize {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

fn default_top_k() -> usize {
    40
}

fn default_chunk_top_k() -> usize {
    20
}

fn default_max_entity_tokens() -> usize {
    6_000
}

fn default_max_relation_tokens() -> usize {
    8_000
}

fn default_max_total_tokens() -> usize {
    30_000
}

fn default_cosine_threshold() -> f32 {
    0.2
}

fn default_related_chunk_number() -> usize {
    5
}

impl AppConfig {
    /// Namespaced key for one of the persisted stores.
    pub fn namespace(&self, name: &str) -> String {
        format!("{}_{name}", self.workspace)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            openai_base_url: default_base_url(),
            llm_model: default_llm_model(),
            llm_temperature: 0.0,
            embedding_backend: default_embedding_backend(),
            embedding_model: None,
            embedding_dimensions: default_embedding_dimensions(),
            storage: default_storage_kind(),
            surrealdb_address: default_surrealdb_address(),
            surrealdb_username: default_surrealdb_credential(),
            surrealdb_password: default_surrealdb_credential(),
            surrealdb_namespace: default_surrealdb_namespace(),
            surrealdb_database: default_surrealdb_database(),
            workspace: default_workspace(),
            data_dir: default_data_dir(),
            chunk_token_size: default_chunk_token_size(),
            chunk_overlap_token_size: default_chunk_overlap_token_size(),
            entity_types: default_entity_types(),
            summary_language: default_summary_language(),
            max_gleaning: default_max_gleaning(),
            force_llm_summary_on_merge: default_force_llm_summary_on_merge(),
            summary_max_tokens: default_summary_max_tokens(),
            summary_context_size: default_summary_context_size(),
            max_source_ids_per_entity: default_max_source_ids(),
            max_source_ids_per_relation: default_max_source_ids(),
            source_ids_limit_method: SourceIdsLimitMethod::default(),
            max_parallel_insert: default_max_parallel_insert(),
            chunk_concurrency: default_chunk_concurrency(),
            llm_max_async: default_llm_max_async(),
            embedding_max_async: default_embedding_max_async(),
            embedding_batch_num: default_embedding_batch_num(),
            enable_llm_cache: true,
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            top_k: default_top_k(),
            chunk_top_k: default_chunk_top_k(),
            max_entity_tokens: default_max_entity_tokens(),
            max_relation_tokens: default_max_relation_tokens(),
            max_total_tokens: default_max_total_tokens(),
            cosine_threshold: default_cosine_threshold(),
            related_chunk_number: default_related_chunk_number(),
            reranking_enabled: false,
            reranking_pool_size: None,
            fastembed_cache_dir: None,
            fastembed_show_download_progress: None,
            fastembed_max_length: None,
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(
            Environment::default()
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("entity_types"),
        )
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_an_in_memory_engine() {
        let config = AppConfig::default();
        assert_eq!(config.storage, StorageKind::Memory);
        assert_eq!(config.chunk_token_size, 1200);
        assert_eq!(config.chunk_overlap_token_size, 100);
        assert_eq!(config.max_total_tokens, 30_000);
        assert_eq!(config.source_ids_limit_method, SourceIdsLimitMethod::Keep);
        assert_eq!(config.entity_types.len(), 8);
        assert_eq!(config.namespace("full_docs"), "default_full_docs");
    }

    #[test]
    fn reads_overrides_from_a_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.toml");
        std::fs::write(
            &path,
            "storage = \"surrealdb\"\nworkspace = \"team\"\nmax_gleaning = 0\nsource_ids_limit_method = \"fifo\"\n",
        )
        .expect("write config");

        let config: AppConfig = Config::builder()
            .add_source(File::from(path))
            .build()
            .expect("build")
            .try_deserialize()
            .expect("deserialize");

        assert_eq!(config.storage, StorageKind::SurrealDb);
        assert_eq!(config.workspace, "team");
        assert_eq!(config.max_gleaning, 0);
        assert_eq!(config.source_ids_limit_method, SourceIdsLimitMethod::Fifo);
    }
}
