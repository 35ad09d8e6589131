use common::{
    error::AppError,
    utils::{
        limiter::Priority,
        llm::{ChatTurn, CompletionRequest, LlmService},
    },
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const KEYWORDS_CACHE_MODE: &str = "keywords";

const KEYWORDS_SYSTEM_MESSAGE: &str = "You identify the keywords of a user query for a retrieval system. Reply with JSON only.";

/// High-level keywords name themes and concepts; low-level keywords name
/// concrete entities and details.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryKeywords {
    #[serde(default, rename = "high_level_keywords")]
    pub high_level: Vec<String>,
    #[serde(default, rename = "low_level_keywords")]
    pub low_level: Vec<String>,
}

impl QueryKeywords {
    fn cleaned(self) -> Self {
        let clean = |items: Vec<String>| -> Vec<String> {
            let mut seen = std::collections::HashSet::new();
            items
                .into_iter()
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty() && seen.insert(item.to_lowercase()))
                .collect()
        };
        Self {
            high_level: clean(self.high_level),
            low_level: clean(self.low_level),
        }
    }

    /// Empty sets fall back to the raw query text.
    pub fn or_query(mut self, query: &str) -> Self {
        let query = query.trim();
        if self.high_level.is_empty() {
            self.high_level = vec![query.to_string()];
        }
        if self.low_level.is_empty() {
            self.low_level = vec![query.to_string()];
        }
        self
    }
}

fn keywords_prompt(query: &str, history: &[ChatTurn]) -> String {
    let history = history
        .iter()
        .map(|turn| format!("{:?}: {}", turn.role, turn.content))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"-Goal-
Given the query and the conversation history, list both high-level and low-level keywords.
High-level keywords cover overarching concepts or themes; low-level keywords cover specific entities, details, or concrete terms.

-Output-
A JSON object with two keys:
- "high_level_keywords": array of strings
- "low_level_keywords": array of strings

Conversation history:
{history}

Query: {query}

Output:"#
    )
}

/// Extracts the first JSON object from a reply, tolerating code fences and
/// surrounding prose.
pub fn parse_keywords(reply: &str) -> Result<QueryKeywords, AppError> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let body = match (start, end) {
        (Some(start), Some(end)) if start < end => reply.get(start..=end).unwrap_or(reply),
        _ => {
            return Err(AppError::LLMParsing(
                "keyword reply contains no JSON object".into(),
            ))
        }
    };
    serde_json::from_str::<QueryKeywords>(body)
        .map(QueryKeywords::cleaned)
        .map_err(|err| AppError::LLMParsing(format!("invalid keyword JSON: {err}")))
}

/// Asks the model for keywords. Unparseable replies yield empty sets, which
/// callers replace with the query itself.
pub async fn extract_keywords(
    llm: &LlmService,
    query: &str,
    history: &[ChatTurn],
) -> Result<QueryKeywords, AppError> {
    let request = CompletionRequest::new(keywords_prompt(query, history))
        .with_system(KEYWORDS_SYSTEM_MESSAGE)
        .with_priority(Priority::High)
        .json();
    let reply = llm.complete_cached(KEYWORDS_CACHE_MODE, &request).await?;
    match parse_keywords(&reply) {
        Ok(keywords) => {
            debug!(
                high_level = keywords.high_level.len(),
                low_level = keywords.low_level.len(),
                "keywords extracted"
            );
            Ok(keywords)
        }
        Err(err) => {
            warn!(error = %err, "keyword extraction reply unusable");
            Ok(QueryKeywords::default())
        }
    }
}
