use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    str::FromStr,
    sync::Arc,
};

use anyhow::{anyhow, Context};
use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use fastembed::{EmbeddingModel, ModelTrait, TextEmbedding, TextInitOptions};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    error::AppError,
    utils::{
        config::AppConfig,
        limiter::{Priority, PriorityLimiter},
        retry::RetryPolicy,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    #[serde(alias = "open-ai")]
    OpenAI,
    #[serde(alias = "fast-embed")]
    FastEmbed,
    Hashed,
}

impl FromStr for EmbeddingBackend {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" | "open-ai" => Ok(Self::OpenAI),
            "fastembed" | "fast-embed" | "fast" => Ok(Self::FastEmbed),
            "hashed" => Ok(Self::Hashed),
            other => Err(AppError::Validation(format!(
                "unknown embedding backend '{other}', expected openai, fastembed or hashed"
            ))),
        }
    }
}

/// Embedding access for chunks, entities, relations, and queries. Calls share
/// one priority limiter so query embeddings overtake bulk ingestion.
#[derive(Clone)]
pub struct EmbeddingProvider {
    inner: EmbeddingInner,
    limiter: Arc<PriorityLimiter>,
    batch_size: usize,
    retry: RetryPolicy,
}

#[derive(Clone)]
enum EmbeddingInner {
    OpenAI {
        client: Arc<Client<OpenAIConfig>>,
        model: String,
        dimensions: u32,
    },
    Hashed {
        dimension: usize,
    },
    FastEmbed {
        model: Arc<Mutex<TextEmbedding>>,
        model_name: EmbeddingModel,
        dimension: usize,
    },
}

impl EmbeddingProvider {
    fn with_inner(inner: EmbeddingInner) -> Self {
        Self {
            inner,
            limiter: PriorityLimiter::new(8),
            batch_size: 10,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replaces the concurrency gate and batch size.
    pub fn with_limits(mut self, limiter: Arc<PriorityLimiter>, batch_size: usize) -> Self {
        self.limiter = limiter;
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn backend_label(&self) -> &'static str {
        match self.inner {
            EmbeddingInner::Hashed { .. } => "hashed",
            EmbeddingInner::FastEmbed { .. } => "fastembed",
            EmbeddingInner::OpenAI { .. } => "openai",
        }
    }

    pub fn dimension(&self) -> usize {
        match &self.inner {
            EmbeddingInner::Hashed { dimension } | EmbeddingInner::FastEmbed { dimension, .. } => {
                *dimension
            }
            EmbeddingInner::OpenAI { dimensions, .. } => *dimensions as usize,
        }
    }

    pub fn model_code(&self) -> Option<String> {
        match &self.inner {
            EmbeddingInner::FastEmbed { model_name, .. } => Some(model_name.to_string()),
            EmbeddingInner::OpenAI { model, .. } => Some(model.clone()),
            EmbeddingInner::Hashed { .. } => None,
        }
    }

    pub async fn embed(&self, text: &str, priority: Priority) -> Result<Vec<f32>, AppError> {
        let mut vectors = self.embed_batch(vec![text.to_owned()], priority).await?;
        vectors
            .pop()
            .ok_or_else(|| AppError::LLMParsing("No embedding data received".into()))
    }

    /// Embeds `texts` in order, `batch_size` inputs per backend call.
    pub async fn embed_batch(
        &self,
        texts: Vec<String>,
        priority: Priority,
    ) -> Result<Vec<Vec<f32>>, AppError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let _permit = self.limiter.acquire(priority).await;
            let embedded = self
                .retry
                .run("embed_batch", || self.embed_group(batch.to_vec()))
                .await?;
            if embedded.len() != batch.len() {
                return Err(AppError::LLMParsing(format!(
                    "expected {} embeddings, received {}",
                    batch.len(),
                    embedded.len()
                )));
            }
            vectors.extend(embedded);
        }
        debug!(
            backend = self.backend_label(),
            count = vectors.len(),
            "embedded batch"
        );
        Ok(vectors)
    }

    async fn embed_group(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        match &self.inner {
            EmbeddingInner::Hashed { dimension } => Ok(texts
                .iter()
                .map(|text| hashed_embedding(text, *dimension))
                .collect()),
            EmbeddingInner::FastEmbed { model, .. } => {
                let mut guard = model.lock().await;
                Ok(guard
                    .embed(texts, None)
                    .context("generating fastembed batch embeddings")?)
            }
            EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            } => {
                let request = CreateEmbeddingRequestArgs::default()
                    .model(model.clone())
                    .input(texts)
                    .dimensions(*dimensions)
                    .build()?;

                let response = client.embeddings().create(request).await?;

                Ok(response
                    .data
                    .into_iter()
                    .map(|item| item.embedding)
                    .collect())
            }
        }
    }

    pub fn new_openai(client: Arc<Client<OpenAIConfig>>, model: String, dimensions: u32) -> Self {
        Self::with_inner(EmbeddingInner::OpenAI {
            client,
            model,
            dimensions,
        })
    }

    pub async fn new_fastembed(model_override: Option<String>) -> Result<Self, AppError> {
        let model_name = if let Some(code) = model_override {
            EmbeddingModel::from_str(&code).map_err(|err| anyhow!(err))?
        } else {
            EmbeddingModel::default()
        };

        let options = TextInitOptions::new(model_name.clone()).with_show_download_progress(true);
        let model_name_for_task = model_name.clone();
        let model_name_code = model_name.to_string();

        let (model, dimension) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let model =
                TextEmbedding::try_new(options).context("initialising FastEmbed text model")?;
            let info = EmbeddingModel::get_model_info(&model_name_for_task)
                .ok_or_else(|| anyhow!("FastEmbed model metadata missing for {model_name_code}"))?;
            Ok((model, info.dim))
        })
        .await??;

        Ok(Self::with_inner(EmbeddingInner::FastEmbed {
            model: Arc::new(Mutex::new(model)),
            model_name,
            dimension,
        }))
    }

    pub fn new_hashed(dimension: usize) -> Self {
        Self::with_inner(EmbeddingInner::Hashed {
            dimension: dimension.max(1),
        })
    }

    pub async fn from_config(
        config: &AppConfig,
        openai_client: Option<Arc<Client<OpenAIConfig>>>,
    ) -> Result<Self, AppError> {
        let provider = match config.embedding_backend {
            EmbeddingBackend::Hashed => Self::new_hashed(config.embedding_dimensions as usize),
            EmbeddingBackend::FastEmbed => {
                Self::new_fastembed(config.embedding_model.clone()).await?
            }
            EmbeddingBackend::OpenAI => {
                let client = openai_client.ok_or_else(|| {
                    AppError::Validation("openai embedding backend requires a client".into())
                })?;
                Self::new_openai(
                    client,
                    config
                        .embedding_model
                        .clone()
                        .unwrap_or_else(|| "text-embedding-3-small".to_string()),
                    config.embedding_dimensions,
                )
            }
        };
        Ok(provider
            .with_limits(
                PriorityLimiter::new(config.embedding_max_async),
                config.embedding_batch_num,
            )
            .with_retry(RetryPolicy::from_app_config(config)))
    }
}

/// Cosine similarity; zero when either vector is empty or all zeros.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Bag-of-words feature hashing over lowercase ASCII alphanumeric words,
/// L2-normalised. Deterministic across runs of the same binary.
fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimension];
    let buckets = u64::try_from(dimension).unwrap_or(u64::MAX).max(1);
    for word in text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
    {
        let mut hasher = DefaultHasher::new();
        word.to_ascii_lowercase().hash(&mut hasher);
        let index = usize::try_from(hasher.finish() % buckets).unwrap_or_default();
        if let Some(slot) = vector.get_mut(index) {
            *slot += 1.0;
        }
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|value| *value /= norm);
    }
    vector
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashed_vectors_share_vocabulary_signal() {
        let provider = EmbeddingProvider::new_hashed(64);
        let acme = provider.embed("Acme CEO", Priority::High).await.expect("embed");
        let related = provider
            .embed("Alice is the CEO of Acme", Priority::High)
            .await
            .expect("embed");
        let unrelated = provider.embed("tidal basin", Priority::High).await.expect("embed");

        assert_eq!(acme.len(), 64);
        assert!(cosine_similarity(&acme, &related) > cosine_similarity(&acme, &unrelated));
    }

    #[tokio::test]
    async fn batches_preserve_input_order() {
        let provider = EmbeddingProvider::new_hashed(32).with_limits(PriorityLimiter::new(1), 2);
        let texts: Vec<String> = ["alpha", "beta", "gamma", "delta", "epsilon"]
            .into_iter()
            .map(str::to_string)
            .collect();
        let batch = provider
            .embed_batch(texts.clone(), Priority::Low)
            .await
            .expect("batch");
        assert_eq!(batch.len(), 5);
        for (text, vector) in texts.iter().zip(&batch) {
            let single = provider.embed(text, Priority::Low).await.expect("single");
            assert_eq!(&single, vector);
        }
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!(
            "fast".parse::<EmbeddingBackend>().expect("parse"),
            EmbeddingBackend::FastEmbed
        );
        assert!("word2vec".parse::<EmbeddingBackend>().is_err());
    }
}
