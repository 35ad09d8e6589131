use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("LLM parsing error: {0}")]
    LLMParsing(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Ingestion Processing error: {0}")]
    Processing(String),
    #[error("Token budget exhausted: {0}")]
    ResourceExhausted(String),
    #[error("Graph consistency error: {0}")]
    Consistency(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Database(_)
                | AppError::OpenAI(_)
                | AppError::Join(_)
                | AppError::Io(_)
                | AppError::Anyhow(_)
                | AppError::InternalError(_)
        )
    }
}
