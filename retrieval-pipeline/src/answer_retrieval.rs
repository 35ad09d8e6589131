use common::utils::{
    limiter::Priority,
    llm::{ChatTurn, CompletionRequest},
};

use crate::pipeline::QueryParam;

/// Cache mode for generated answers.
pub const QUERY_CACHE_MODE: &str = "query";

const RAG_SYSTEM_TEMPLATE: &str = r"---Role---

You are a helpful assistant responding to user queries about the Knowledge Graph and Document Chunks provided in the context below.

---Goal---

Answer the user query using only the provided context. Summarize the relevant facts, and combine them with general knowledge only where the context leaves a gap that general knowledge clearly covers. If the answer is not in the context, say that you do not know. Do not make anything up.

---Citations---

Cite supporting sources by their reference id in square brackets, for example [1]. End the answer with a ### References section listing each cited reference id and its document path.

---Conversation History---

{history}

---Context---

{context}

---Response Rules---

- Target format and length: {response_type}
- Use markdown formatting with appropriate section headings.
- Respond in the same language as the user query.
{user_prompt}";

/// Renders the system prompt around an already serialized context document.
pub fn render_system_prompt(context: &str, param: &QueryParam) -> String {
    let user_prompt = param
        .user_prompt
        .as_deref()
        .map(str::trim)
        .filter(|prompt| !prompt.is_empty())
        .map(|prompt| format!("- Additional instructions: {prompt}"))
        .unwrap_or_default();

    RAG_SYSTEM_TEMPLATE
        .replace("{history}", &format_history(&param.conversation_history))
        .replace("{context}", context)
        .replace("{response_type}", &param.response_type)
        .replace("{user_prompt}", &user_prompt)
}

pub fn format_history(history: &[ChatTurn]) -> String {
    if history.is_empty() {
        return "(none)".to_string();
    }
    history
        .iter()
        .map(|turn| format!("{:?}: {}", turn.role, turn.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Generation request for a retrieved context.
pub fn create_answer_request(system_prompt: String, query: &str, param: &QueryParam) -> CompletionRequest {
    CompletionRequest::new(query)
        .with_system(system_prompt)
        .with_history(param.conversation_history.clone())
        .with_priority(Priority::High)
}

/// Bypass mode forwards the query and history without any retrieval.
pub fn create_bypass_request(query: &str, param: &QueryParam) -> CompletionRequest {
    let mut request = CompletionRequest::new(query)
        .with_history(param.conversation_history.clone())
        .with_priority(Priority::High);
    if let Some(prompt) = param
        .user_prompt
        .as_deref()
        .map(str::trim)
        .filter(|prompt| !prompt.is_empty())
    {
        request = request.with_system(prompt);
    }
    request
}

/// The full prompt as it would be sent, for `only_need_prompt` callers.
pub fn render_full_prompt(system_prompt: &str, query: &str) -> String {
    format!("{system_prompt}\n\n---User Query---\n{query}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_embeds_context_and_instructions() {
        let param = QueryParam {
            user_prompt: Some("Answer in one sentence.".into()),
            response_type: "Single Paragraph".into(),
            conversation_history: vec![ChatTurn::user("Hi"), ChatTurn::assistant("Hello")],
            ..QueryParam::default()
        };

        let prompt = render_system_prompt("-----Entities(KG)-----\n[]", &param);

        assert!(prompt.contains("-----Entities(KG)-----"));
        assert!(prompt.contains("Target format and length: Single Paragraph"));
        assert!(prompt.contains("Additional instructions: Answer in one sentence."));
        assert!(prompt.contains("User: Hi"));
        assert!(!prompt.contains("{context}"));
    }

    #[test]
    fn blank_user_prompt_leaves_no_instruction_line() {
        let param = QueryParam {
            user_prompt: Some("   ".into()),
            ..QueryParam::default()
        };
        let prompt = render_system_prompt("ctx", &param);
        assert!(!prompt.contains("Additional instructions"));
        assert!(prompt.contains("(none)"));
    }

    #[test]
    fn bypass_request_carries_history_at_high_priority() {
        let param = QueryParam {
            conversation_history: vec![ChatTurn::user("earlier")],
            ..QueryParam::default()
        };
        let request = create_bypass_request("What now?", &param);
        assert_eq!(request.prompt, "What now?");
        assert_eq!(request.history.len(), 1);
        assert_eq!(request.priority, Priority::High);
        assert!(request.system_prompt.is_none());
    }
}
