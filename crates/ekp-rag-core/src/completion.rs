//! LLM text-completion collaborator.
//!
//! The model itself is opaque: it takes a prompt, an optional system
//! prompt, and prior conversation turns, and returns text or fails.
//! HTTP-backed providers live in the app crate.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::ChatMessage;

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Model identifier reported alongside answers.
    fn model_name(&self) -> &str;

    async fn complete(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        history: &[ChatMessage],
    ) -> Result<String>;
}
