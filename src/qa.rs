//! Question answering: rate limit → cache → locked generation → memory.
//!
//! ```text
//! ask ──▶ rate limit ──▶ cache hit? ──yes──▶ answer (from_cache)
//!                           │ no
//!                           ▼
//!                  lock "qa:{answer key}"
//!                  re-check cache
//!                  retrieve context ──empty──▶ "no knowledge" answer
//!                  complete (history) ──err──▶ context fallback
//!                  cache answer + hot set
//! ```
//!
//! Questions restricted to `document_ids` skip the cache and the lock
//! entirely.
//!
//! Cache and memory failures never fail a question; they are logged and
//! the answer is produced without them. When another caller holds the
//! generation lock past the retry budget, the answer is generated without
//! touching the cache.

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use ekp_rag_core::cache::{AnswerCache, HotQuestion};
use ekp_rag_core::completion::CompletionProvider;
use ekp_rag_core::kv::KvStore;
use ekp_rag_core::lock::LockService;
use ekp_rag_core::memory::WorkingMemory;
use ekp_rag_core::models::{ChatMessage, RetrievalMode, SourceRef};
use ekp_rag_core::rate_limit::RateLimiter;
use ekp_rag_core::retrieve::Retriever;
use ekp_rag_core::RagError;

use crate::config::Config;

pub const SYSTEM_PROMPT: &str = "你是一个专业的知识库问答助手，擅长根据提供的资料准确回答问题。";

pub const NO_KNOWLEDGE_ANSWER: &str =
    "抱歉，我在知识库中没有找到与您问题相关的内容。请尝试换一种方式提问，或者上传相关文档。";

/// Reported as `model_used` when the completion call failed.
pub const FALLBACK_MODEL: &str = "fallback";

/// Rate-limit action name for questions.
const QUERY_ACTION: &str = "query";

/// Prior turns passed to the completion provider.
const HISTORY_MESSAGES: usize = 10;

/// Context characters quoted in the fallback answer.
const FALLBACK_CONTEXT_CHARS: usize = 500;

pub fn build_prompt(question: &str, context: &str) -> String {
    format!(
        "你是一个专业的知识库问答助手。请根据以下参考资料回答用户的问题。\n\n\
         要求：\n\
         1. 只使用参考资料中的信息回答问题\n\
         2. 如果参考资料中没有相关信息，请明确告知用户\n\
         3. 回答要简洁、准确、有条理\n\
         4. 可以引用参考资料中的具体内容\n\n\
         参考资料：\n{}\n\n\
         用户问题：{}\n\n\
         请回答：",
        context, question
    )
}

pub fn fallback_answer(context: &str) -> String {
    let excerpt: String = context.chars().take(FALLBACK_CONTEXT_CHARS).collect();
    format!(
        "根据知识库中的相关内容，我找到了以下信息：\n\n{}...\n\n（注：由于LLM服务暂时不可用，以上是直接返回的相关内容片段）",
        excerpt
    )
}

#[derive(Debug, Clone)]
pub struct AskRequest {
    pub user_id: String,
    pub question: String,
    /// Defaults to the configured retrieval mode.
    pub mode: Option<RetrievalMode>,
    /// Defaults to the configured `top_k`.
    pub top_k: Option<usize>,
    pub document_ids: Option<Vec<String>>,
    pub session_id: Option<String>,
}

impl AskRequest {
    pub fn new(user_id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            question: question.into(),
            mode: None,
            top_k: None,
            document_ids: None,
            session_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QaAnswer {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub mode: RetrievalMode,
    /// `None` for cache hits and the no-knowledge answer.
    pub model_used: Option<String>,
    pub from_cache: bool,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AskOutcome {
    Answered(QaAnswer),
    RateLimited,
}

#[derive(Debug, Clone)]
pub struct QaSettings {
    pub top_k: usize,
    pub mode: RetrievalMode,
    pub max_requests: u64,
    pub window: Duration,
}

impl QaSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            mode: config.retrieval.mode,
            max_requests: config.rate_limit.max_requests,
            window: config.rate_limit.window(),
        }
    }
}

/// An answer before timing and mode are attached.
struct Draft {
    answer: String,
    sources: Vec<SourceRef>,
    model_used: Option<String>,
    from_cache: bool,
    /// Only real completions are cached.
    cacheable: bool,
}

pub struct QaService {
    retriever: Arc<Retriever>,
    completion: Arc<dyn CompletionProvider>,
    cache: AnswerCache,
    locks: LockService,
    limiter: RateLimiter,
    memory: WorkingMemory,
    settings: QaSettings,
}

impl QaService {
    pub fn new(
        retriever: Arc<Retriever>,
        completion: Arc<dyn CompletionProvider>,
        kv: Arc<dyn KvStore>,
        config: &Config,
    ) -> Self {
        let prefix = &config.cache.prefix;
        Self {
            retriever,
            completion,
            cache: AnswerCache::new(kv.clone(), config.cache.settings()),
            locks: LockService::new(kv.clone(), config.lock.settings(prefix)),
            limiter: RateLimiter::new(kv.clone(), prefix),
            memory: WorkingMemory::new(kv, prefix),
            settings: QaSettings::from_config(config),
        }
    }

    pub fn cache(&self) -> &AnswerCache {
        &self.cache
    }

    pub fn memory(&self) -> &WorkingMemory {
        &self.memory
    }

    pub async fn ask(&self, request: AskRequest) -> Result<AskOutcome> {
        let started = Instant::now();
        let question = request.question.trim();
        if question.is_empty() {
            return Err(RagError::EmptyQuery.into());
        }
        let mode = request.mode.unwrap_or(self.settings.mode);
        let top_k = request.top_k.unwrap_or(self.settings.top_k);
        if top_k == 0 {
            return Err(RagError::InvalidParameter("top_k must be >= 1".into()).into());
        }

        match self
            .limiter
            .is_allowed(
                &request.user_id,
                QUERY_ACTION,
                self.settings.max_requests,
                self.settings.window,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!(user_id = %request.user_id, "question rate limited");
                return Ok(AskOutcome::RateLimited);
            }
            Err(e) => warn!(error = %e, "rate limiter unavailable, allowing request"),
        }

        let history = match &request.session_id {
            Some(session) => self
                .memory
                .chat_history(session, HISTORY_MESSAGES)
                .await
                .unwrap_or_else(|e| {
                    warn!(session = %session, error = %e, "could not load history");
                    Vec::new()
                }),
            None => Vec::new(),
        };
        // The answer cache is keyed by question and mode only, so answers
        // scoped to a document subset neither read nor populate it.
        let draft = match request.document_ids.as_deref() {
            Some(ids) => {
                debug!(documents = ids.len(), "scoped question, bypassing cache");
                self.generate(question, mode, top_k, Some(ids), &history)
                    .await?
            }
            None => match self.cached(question, mode).await {
                Some(hit) => hit,
                None => self.answer_locked(question, mode, top_k, &history).await?,
            },
        };

        if let Some(session) = &request.session_id {
            self.remember(session, question, &draft).await;
        }

        Ok(AskOutcome::Answered(QaAnswer {
            answer: draft.answer,
            sources: draft.sources,
            mode,
            model_used: draft.model_used,
            from_cache: draft.from_cache,
            response_time_ms: started.elapsed().as_millis() as u64,
        }))
    }

    pub async fn hot_questions(&self, limit: usize) -> Result<Vec<HotQuestion>> {
        self.cache.get_hot(limit).await
    }

    /// Generate under the per-question lock so concurrent identical
    /// questions call the LLM once.
    async fn answer_locked(
        &self,
        question: &str,
        mode: RetrievalMode,
        top_k: usize,
        history: &[ChatMessage],
    ) -> Result<Draft> {
        let lock_name = format!("qa:{}", self.cache.answer_key(question, mode));
        let this = self;
        let locked = self
            .locks
            .with_lock(&lock_name, move || async move {
                if let Some(hit) = this.cached(question, mode).await {
                    return Ok(hit);
                }
                let draft = this
                    .generate(question, mode, top_k, None, history)
                    .await?;
                if draft.cacheable {
                    this.store(question, mode, &draft).await;
                }
                Ok::<Draft, anyhow::Error>(draft)
            })
            .await;

        match locked {
            Ok(Some(result)) => result,
            Ok(None) => {
                debug!(lock = %lock_name, "generation lock contended, answering uncached");
                self.generate(question, mode, top_k, None, history)
                    .await
            }
            Err(e) => {
                warn!(lock = %lock_name, error = %e, "lock unavailable, answering uncached");
                self.generate(question, mode, top_k, None, history)
                    .await
            }
        }
    }

    async fn cached(&self, question: &str, mode: RetrievalMode) -> Option<Draft> {
        match self.cache.get(question, mode).await {
            Ok(Some(hit)) => Some(Draft {
                answer: hit.answer,
                sources: hit.sources,
                model_used: None,
                from_cache: true,
                cacheable: false,
            }),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "answer cache read failed, treating as miss");
                None
            }
        }
    }

    async fn generate(
        &self,
        question: &str,
        mode: RetrievalMode,
        top_k: usize,
        document_ids: Option<&[String]>,
        history: &[ChatMessage],
    ) -> Result<Draft> {
        let retrieved = self
            .retriever
            .retrieve_with_context(question, top_k, mode, document_ids)
            .await?;

        if retrieved.is_empty() {
            return Ok(Draft {
                answer: NO_KNOWLEDGE_ANSWER.to_string(),
                sources: Vec::new(),
                model_used: None,
                from_cache: false,
                cacheable: false,
            });
        }

        let prompt = build_prompt(question, &retrieved.context);
        match self
            .completion
            .complete(&prompt, Some(SYSTEM_PROMPT), history)
            .await
        {
            Ok(answer) => Ok(Draft {
                answer,
                sources: retrieved.sources,
                model_used: Some(self.completion.model_name().to_string()),
                from_cache: false,
                cacheable: true,
            }),
            Err(e) => {
                warn!(error = %e, "completion failed, returning context fallback");
                Ok(Draft {
                    answer: fallback_answer(&retrieved.context),
                    sources: retrieved.sources,
                    model_used: Some(FALLBACK_MODEL.to_string()),
                    from_cache: false,
                    cacheable: false,
                })
            }
        }
    }

    async fn store(&self, question: &str, mode: RetrievalMode, draft: &Draft) {
        if let Err(e) = self
            .cache
            .put(question, &draft.answer, &draft.sources, mode, None)
            .await
        {
            warn!(error = %e, "could not cache answer");
            return;
        }
        if let Err(e) = self.cache.add_hot(question, &draft.answer).await {
            warn!(error = %e, "could not update hot questions");
        }
    }

    async fn remember(&self, session: &str, question: &str, draft: &Draft) {
        let metadata = serde_json::json!({
            "sources": draft.sources.len(),
            "from_cache": draft.from_cache,
        });
        let result = async {
            self.memory.add_message(session, "user", question, None).await?;
            self.memory
                .add_message(session, "assistant", &draft.answer, Some(metadata))
                .await
        }
        .await;
        if let Err(e) = result {
            warn!(session, error = %e, "could not record conversation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_contains_context_and_question() {
        let prompt = build_prompt("什么是RAG？", "[1] 检索增强生成");
        assert!(prompt.contains("参考资料：\n[1] 检索增强生成"));
        assert!(prompt.contains("用户问题：什么是RAG？"));
        assert!(prompt.ends_with("请回答："));
    }

    #[test]
    fn test_fallback_truncates_context_by_chars() {
        let context = "z".repeat(600);
        let answer = fallback_answer(&context);
        assert_eq!(answer.matches('z').count(), 500);
        assert!(answer.contains("LLM服务暂时不可用"));
    }

    #[test]
    fn test_ask_request_defaults() {
        let request = AskRequest::new("u1", "q");
        assert!(request.mode.is_none());
        assert!(request.top_k.is_none());
        assert!(request.session_id.is_none());
    }
}
