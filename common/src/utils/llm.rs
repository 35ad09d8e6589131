use std::sync::Arc;

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs, ResponseFormat,
    },
    Client,
};
use async_stream::stream;
use async_trait::async_trait;
use chrono::Utc;
use futures::{stream::BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::{
    error::AppError,
    storage::traits::KeyValueStore,
    utils::{
        config::AppConfig,
        hashing::sha256_hex,
        limiter::{Priority, PriorityLimiter},
        retry::RetryPolicy,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// One chat-completion call: optional system prompt, prior turns, and the new
/// user prompt.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_prompt: Option<String>,
    pub history: Vec<ChatTurn>,
    pub prompt: String,
    pub priority: Priority,
    pub json_response: bool,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: None,
            history: Vec::new(),
            prompt: prompt.into(),
            priority: Priority::Normal,
            json_response: false,
        }
    }

    pub fn with_system(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_history(mut self, history: Vec<ChatTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn json(mut self) -> Self {
        self.json_response = true;
        self
    }

    /// Cache key scoped by `mode` and the full conversation content.
    pub fn cache_key(&self, mode: &str) -> String {
        let mut material = String::new();
        if let Some(system) = &self.system_prompt {
            material.push_str(system);
        }
        for turn in &self.history {
            material.push('\u{1e}');
            material.push_str(&turn.content);
        }
        material.push('\u{1e}');
        material.push_str(&self.prompt);
        format!("{mode}:{}", sha256_hex(&material))
    }
}

pub type CompletionStream = BoxStream<'static, Result<String, AppError>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String, AppError>;

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionStream, AppError> {
        let text = self.complete(request).await?;
        Ok(futures::stream::once(async move { Ok(text) }).boxed())
    }
}

pub struct OpenAiLanguageModel {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
    temperature: f32,
}

impl OpenAiLanguageModel {
    pub fn new(client: Arc<Client<OpenAIConfig>>, model: String, temperature: f32) -> Self {
        Self {
            client,
            model,
            temperature,
        }
    }

    pub fn from_config(client: Arc<Client<OpenAIConfig>>, config: &AppConfig) -> Self {
        Self::new(client, config.llm_model.clone(), config.llm_temperature)
    }

    fn build_request(
        &self,
        request: &CompletionRequest,
    ) -> Result<CreateChatCompletionRequest, AppError> {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(ChatCompletionRequestSystemMessage::from(system.as_str()).into());
        }
        for turn in &request.history {
            match turn.role {
                ChatRole::User => messages
                    .push(ChatCompletionRequestUserMessage::from(turn.content.as_str()).into()),
                ChatRole::Assistant => messages.push(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(turn.content.clone())
                        .build()?
                        .into(),
                ),
            }
        }
        messages.push(ChatCompletionRequestUserMessage::from(request.prompt.as_str()).into());

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&self.model)
            .temperature(self.temperature)
            .messages(messages);
        if request.json_response {
            builder.response_format(ResponseFormat::JsonObject);
        }
        Ok(builder.build()?)
    }
}

#[async_trait]
impl LanguageModel for OpenAiLanguageModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, AppError> {
        let response = self
            .client
            .chat()
            .create(self.build_request(request)?)
            .await?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or(AppError::LLMParsing(
                "No content found in LLM response".into(),
            ))
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionStream, AppError> {
        let stream = self
            .client
            .chat()
            .create_stream(self.build_request(request)?)
            .await?;

        Ok(stream
            .filter_map(|item| async move {
                match item {
                    Ok(response) => response
                        .choices
                        .first()
                        .and_then(|choice| choice.delta.content.clone())
                        .filter(|content| !content.is_empty())
                        .map(Ok),
                    Err(err) => Some(Err(AppError::from(err))),
                }
            })
            .boxed())
    }
}

/// Language-model access shared by ingestion and queries: priority-limited,
/// retried on transient failures, and optionally cached.
pub struct LlmService {
    model: Arc<dyn LanguageModel>,
    limiter: Arc<PriorityLimiter>,
    retry: RetryPolicy,
    cache: Option<Arc<dyn KeyValueStore>>,
}

impl LlmService {
    pub fn new(model: Arc<dyn LanguageModel>, limiter: Arc<PriorityLimiter>, retry: RetryPolicy) -> Self {
        Self {
            model,
            limiter,
            retry,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn KeyValueStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    pub fn limiter(&self) -> &Arc<PriorityLimiter> {
        &self.limiter
    }

    async fn attempt(&self, request: &CompletionRequest) -> Result<String, AppError> {
        let _permit = self.limiter.acquire(request.priority).await;
        self.model.complete(request).await
    }

    pub async fn complete(&self, request: &CompletionRequest) -> Result<String, AppError> {
        self.retry
            .run("llm_complete", || self.attempt(request))
            .await
    }

    /// Completes through the response cache. `mode` scopes the key, so the
    /// same prompt issued for extraction and for a query never collide.
    pub async fn complete_cached(
        &self,
        mode: &str,
        request: &CompletionRequest,
    ) -> Result<String, AppError> {
        let Some(cache) = &self.cache else {
            return self.complete(request).await;
        };

        let key = request.cache_key(mode);
        if let Some(entry) = cache.get_by_id(&key).await? {
            if let Some(text) = entry.get("return").and_then(|value| value.as_str()) {
                debug!(cache_mode = mode, "llm cache hit");
                return Ok(text.to_string());
            }
        }

        let text = self.complete(request).await?;
        cache
            .upsert(vec![(
                key,
                json!({
                    "return": text,
                    "cache_type": mode,
                    "create_time": Utc::now().timestamp(),
                }),
            )])
            .await?;
        Ok(text)
    }

    /// Streams a completion. The concurrency slot is held until the stream is
    /// dropped.
    pub async fn complete_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionStream, AppError> {
        let permit = self.limiter.acquire(request.priority).await;
        let mut inner = self
            .retry
            .run("llm_stream", || self.model.complete_stream(request))
            .await?;
        Ok(stream! {
            let _permit = permit;
            while let Some(fragment) = inner.next().await {
                yield fragment;
            }
        }
        .boxed())
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use scripted::ScriptedLanguageModel;

#[cfg(any(test, feature = "test-utils"))]
mod scripted {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    };

    use async_trait::async_trait;

    use super::{AppError, CompletionRequest, LanguageModel};

    type Responder = Box<dyn Fn(&CompletionRequest) -> Result<String, AppError> + Send + Sync>;

    /// Stub model answering from a closure and recording every request.
    pub struct ScriptedLanguageModel {
        responder: Responder,
        calls: AtomicUsize,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedLanguageModel {
        pub fn new(
            responder: impl Fn(&CompletionRequest) -> Result<String, AppError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                responder: Box::new(responder),
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn requests(&self) -> Vec<CompletionRequest> {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedLanguageModel {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<String, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request.clone());
            (self.responder)(request)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryKvStore;
    use futures::TryStreamExt;

    fn service(model: Arc<ScriptedLanguageModel>) -> LlmService {
        LlmService::new(model, PriorityLimiter::new(2), RetryPolicy::none())
    }

    #[tokio::test]
    async fn cached_completions_hit_the_model_once() {
        let model = Arc::new(ScriptedLanguageModel::new(|request| {
            Ok(format!("echo: {}", request.prompt))
        }));
        let cache: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new("llm_cache"));
        let llm = service(Arc::clone(&model)).with_cache(cache);
        let request = CompletionRequest::new("summarize acme");

        let first = llm.complete_cached("extract", &request).await.expect("first");
        let second = llm.complete_cached("extract", &request).await.expect("second");

        assert_eq!(first, "echo: summarize acme");
        assert_eq!(first, second);
        assert_eq!(model.calls(), 1);

        llm.complete_cached("query", &request).await.expect("other mode");
        assert_eq!(model.calls(), 2);
    }

    #[test]
    fn cache_keys_cover_history_and_system_prompt() {
        let base = CompletionRequest::new("continue");
        let with_history = base.clone().with_history(vec![ChatTurn::assistant("earlier")]);
        let with_system = base.clone().with_system("rules");
        assert_ne!(base.cache_key("extract"), with_history.cache_key("extract"));
        assert_ne!(base.cache_key("extract"), with_system.cache_key("extract"));
        assert!(base.cache_key("extract").starts_with("extract:"));
    }

    #[tokio::test]
    async fn default_stream_yields_the_whole_completion() {
        let model = Arc::new(ScriptedLanguageModel::new(|_| Ok("Alice leads Acme.".into())));
        let llm = service(model);
        let chunks: Vec<String> = llm
            .complete_stream(&CompletionRequest::new("who leads acme?"))
            .await
            .expect("stream")
            .try_collect()
            .await
            .expect("collect");
        assert_eq!(chunks.concat(), "Alice leads Acme.");
        assert_eq!(llm.limiter().available(), 2);
    }
}
