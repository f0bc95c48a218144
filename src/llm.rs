//! LLM completion providers.
//!
//! | Provider | Config value | Endpoint |
//! |----------|--------------|----------|
//! | [`DisabledCompletion`] | `"disabled"` | none, every call fails |
//! | [`OpenAICompletion`] | `"openai"` | `POST {url}/v1/chat/completions` |
//!
//! A failing provider is not fatal for question answering: the QA service
//! falls back to returning retrieved context directly.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use ekp_rag_core::completion::CompletionProvider;
use ekp_rag_core::models::ChatMessage;

use crate::config::LlmConfig;
use crate::http::{build_client, post_json_with_retry};

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com";

pub struct DisabledCompletion;

#[async_trait]
impl CompletionProvider for DisabledCompletion {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(
        &self,
        _prompt: &str,
        _system_prompt: Option<&str>,
        _history: &[ChatMessage],
    ) -> Result<String> {
        bail!("LLM provider is disabled")
    }
}

/// Chat-completions client for OpenAI or a compatible gateway.
/// Requires `OPENAI_API_KEY`.
pub struct OpenAICompletion {
    model: String,
    url: String,
    api_key: String,
    max_tokens: u32,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAICompletion {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_URL.to_string()),
            api_key,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            max_retries: config.max_retries,
            client: build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAICompletion {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        history: &[ChatMessage],
    ) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": build_messages(prompt, system_prompt, history),
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });
        let json = post_json_with_retry(
            &self.client,
            &format!("{}/v1/chat/completions", self.url.trim_end_matches('/')),
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI API",
        )
        .await?;
        parse_chat_response(&json)
    }
}

/// System prompt first, then prior turns, then the new user prompt.
fn build_messages(
    prompt: &str,
    system_prompt: Option<&str>,
    history: &[ChatMessage],
) -> Vec<serde_json::Value> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    if let Some(system) = system_prompt {
        messages.push(serde_json::json!({"role": "system", "content": system}));
    }
    for turn in history {
        messages.push(serde_json::json!({"role": turn.role, "content": turn.content}));
    }
    messages.push(serde_json::json!({"role": "user", "content": prompt}));
    messages
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing choices[0].message.content"))
}

pub fn create_completion(config: &LlmConfig) -> Result<Arc<dyn CompletionProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledCompletion)),
        "openai" => Ok(Arc::new(OpenAICompletion::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_response() {
        let json = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "42"}}],
            "usage": {"total_tokens": 10}
        });
        assert_eq!(parse_chat_response(&json).unwrap(), "42");
        assert!(parse_chat_response(&serde_json::json!({"choices": []})).is_err());
    }

    #[test]
    fn test_build_messages_order() {
        let history = vec![
            ChatMessage::new("user", "hi"),
            ChatMessage::new("assistant", "hello"),
        ];
        let messages = build_messages("q", Some("sys"), &history);
        let roles: Vec<&str> = messages
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(messages[3]["content"], "q");

        let messages = build_messages("q", None, &[]);
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_completion_fails() {
        let llm = create_completion(&LlmConfig::default()).unwrap();
        assert_eq!(llm.model_name(), "disabled");
        assert!(llm.complete("q", None, &[]).await.is_err());
    }
}
