use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::available_parallelism,
};

use async_trait::async_trait;
use common::{error::AppError, utils::config::AppConfig};
use fastembed::{RerankInitOptions, RerankResult, TextRerank};
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Scores documents against a query; higher is more relevant. The returned
/// vector is aligned with `documents`.
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    async fn score(&self, query: &str, documents: Vec<String>) -> Result<Vec<f32>, AppError>;
}

/// Cross-encoder models shared by concurrent queries. Each model scores one
/// batch at a time on the blocking thread pool.
pub struct RerankerPool {
    engines: Vec<Arc<Mutex<TextRerank>>>,
    slots: Semaphore,
    next: AtomicUsize,
}

impl RerankerPool {
    pub fn new(pool_size: usize) -> Result<Arc<Self>, AppError> {
        Self::with_options(pool_size, RerankInitOptions::default())
    }

    fn with_options(pool_size: usize, options: RerankInitOptions) -> Result<Arc<Self>, AppError> {
        if pool_size == 0 {
            return Err(AppError::Validation(
                "reranking pool size must be positive".to_string(),
            ));
        }
        fs::create_dir_all(&options.cache_dir)?;

        let engines = (0..pool_size)
            .map(|slot| {
                debug!(slot, "loading reranker model");
                TextRerank::try_new(options.clone())
                    .map(|model| Arc::new(Mutex::new(model)))
                    .map_err(|err| AppError::InternalError(format!("reranker init failed: {err}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        info!(pool_size, cache_dir = %options.cache_dir.display(), "reranker pool ready");

        Ok(Arc::new(Self {
            engines,
            slots: Semaphore::new(pool_size),
            next: AtomicUsize::new(0),
        }))
    }

    /// `None` unless reranking is enabled in the configuration.
    pub fn maybe_from_config(config: &AppConfig) -> Result<Option<Arc<Self>>, AppError> {
        if !config.reranking_enabled {
            return Ok(None);
        }
        let pool_size = config.reranking_pool_size.unwrap_or_else(default_pool_size);
        Self::with_options(pool_size, init_options(config)).map(Some)
    }

    fn next_engine(&self) -> Result<Arc<Mutex<TextRerank>>, AppError> {
        let len = self.engines.len().max(1);
        let index = self.next.fetch_add(1, Ordering::Relaxed) % len;
        self.engines
            .get(index)
            .cloned()
            .ok_or_else(|| AppError::InternalError("reranker pool is empty".to_string()))
    }
}

#[async_trait]
impl RelevanceScorer for RerankerPool {
    async fn score(&self, query: &str, documents: Vec<String>) -> Result<Vec<f32>, AppError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| AppError::InternalError("reranker pool is closed".to_string()))?;
        let engine = self.next_engine()?;
        let query = query.to_owned();
        let count = documents.len();

        let results = tokio::task::spawn_blocking(move || {
            let mut model = engine.lock().unwrap_or_else(PoisonError::into_inner);
            model.rerank(query, documents, false, None)
        })
        .await?
        .map_err(|err| AppError::InternalError(format!("rerank failed: {err}")))?;

        Ok(scores_by_index(count, &results))
    }
}

/// fastembed returns results sorted by score; put them back in input order.
fn scores_by_index(count: usize, results: &[RerankResult]) -> Vec<f32> {
    let mut scores = vec![f32::MIN; count];
    for result in results {
        if let Some(slot) = scores.get_mut(result.index) {
            *slot = result.score;
        }
    }
    scores
}

fn default_pool_size() -> usize {
    available_parallelism()
        .map(|value| value.get().min(2))
        .unwrap_or(2)
        .max(1)
}

fn init_options(config: &AppConfig) -> RerankInitOptions {
    let mut options = RerankInitOptions::default();
    options.cache_dir = config.fastembed_cache_dir.as_ref().map_or_else(
        || Path::new(&config.data_dir).join("fastembed").join("reranker"),
        PathBuf::from,
    );
    options.show_download_progress = config.fastembed_show_download_progress.unwrap_or(false);
    if let Some(max_length) = config.fastembed_max_length {
        options.max_length = max_length;
    }
    options
}
