//! TOML configuration.
//!
//! Every section is optional; omitted sections and fields take the
//! defaults listed below. [`load_config`] parses a file and rejects values
//! that would make the pipeline misbehave (zero chunk size, weights outside
//! `[0, 1]`, zero-length windows or lock ttls, unknown providers).
//!
//! ```toml
//! [chunking]
//! max_chars = 1000
//! overlap_chars = 200
//!
//! [retrieval]
//! top_k = 5
//! keyword_weight = 0.3
//! min_score = 0.0
//! timeout_ms = 10000
//! mode = "hybrid"
//!
//! [embedding]
//! provider = "openai"          # disabled | openai | ollama
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [llm]
//! provider = "openai"          # disabled | openai
//! model = "gpt-3.5-turbo"
//!
//! [cache]
//! prefix = "ekp"
//! answer_ttl_secs = 3600
//! stats_ttl_secs = 1800
//! hot_limit = 50
//!
//! [lock]
//! ttl_secs = 30
//! retry_interval_ms = 100
//! retry_times = 50
//!
//! [rate_limit]
//! max_requests = 30
//! window_secs = 60
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use ekp_rag_core::cache::CacheSettings;
use ekp_rag_core::lock::LockSettings;
use ekp_rag_core::models::RetrievalMode;
use ekp_rag_core::retrieve::RetrievalParams;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    #[serde(default)]
    pub min_score: f64,
    #[serde(default = "default_retrieval_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub mode: RetrievalMode,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            keyword_weight: default_keyword_weight(),
            min_score: 0.0,
            timeout_ms: default_retrieval_timeout_ms(),
            mode: RetrievalMode::default(),
        }
    }
}

impl RetrievalConfig {
    pub fn params(&self) -> RetrievalParams {
        RetrievalParams {
            timeout: Duration::from_millis(self.timeout_ms),
            keyword_weight: self.keyword_weight,
            min_score: self.min_score,
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_keyword_weight() -> f64 {
    0.3
}
fn default_retrieval_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (OpenAI-compatible gateway or Ollama host).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_embedding_retries(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_embedding_retries() -> u32 {
    5
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: default_llm_model(),
            url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_retries: default_llm_retries(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_model() -> String {
    "gpt-3.5-turbo".to_string()
}
fn default_max_tokens() -> u32 {
    1000
}
fn default_temperature() -> f32 {
    0.7
}
fn default_llm_retries() -> u32 {
    3
}
fn default_llm_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_answer_ttl_secs")]
    pub answer_ttl_secs: u64,
    #[serde(default = "default_stats_ttl_secs")]
    pub stats_ttl_secs: u64,
    #[serde(default = "default_hot_limit")]
    pub hot_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            answer_ttl_secs: default_answer_ttl_secs(),
            stats_ttl_secs: default_stats_ttl_secs(),
            hot_limit: default_hot_limit(),
        }
    }
}

impl CacheConfig {
    pub fn settings(&self) -> CacheSettings {
        CacheSettings {
            prefix: self.prefix.clone(),
            answer_ttl: Duration::from_secs(self.answer_ttl_secs),
            stats_ttl: Duration::from_secs(self.stats_ttl_secs),
            hot_limit: self.hot_limit,
        }
    }
}

fn default_prefix() -> String {
    "ekp".to_string()
}
fn default_answer_ttl_secs() -> u64 {
    3600
}
fn default_stats_ttl_secs() -> u64 {
    1800
}
fn default_hot_limit() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct LockConfig {
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_retry_times")]
    pub retry_times: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lock_ttl_secs(),
            retry_interval_ms: default_retry_interval_ms(),
            retry_times: default_retry_times(),
        }
    }
}

impl LockConfig {
    pub fn settings(&self, prefix: &str) -> LockSettings {
        LockSettings {
            prefix: prefix.to_string(),
            ttl: Duration::from_secs(self.ttl_secs),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            retry_times: self.retry_times,
        }
    }
}

fn default_lock_ttl_secs() -> u64 {
    30
}
fn default_retry_interval_ms() -> u64 {
    100
}
fn default_retry_times() -> u32 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

fn default_max_requests() -> u64 {
    30
}
fn default_window_secs() -> u64 {
    60
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        // Chunking
        if self.chunking.max_chars == 0 {
            bail!("chunking.max_chars must be > 0");
        }
        if self.chunking.overlap_chars >= self.chunking.max_chars {
            bail!("chunking.overlap_chars must be < chunking.max_chars");
        }

        // Retrieval
        if self.retrieval.top_k == 0 {
            bail!("retrieval.top_k must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.retrieval.keyword_weight) {
            bail!("retrieval.keyword_weight must be in [0.0, 1.0]");
        }
        if self.retrieval.timeout_ms == 0 {
            bail!("retrieval.timeout_ms must be > 0");
        }

        // Embedding
        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }
        if self.embedding.is_enabled() {
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }

        // LLM
        match self.llm.provider.as_str() {
            "disabled" | "openai" => {}
            other => bail!(
                "Unknown llm provider: '{}'. Must be disabled or openai.",
                other
            ),
        }

        // Cache, lock, rate limit
        if self.cache.answer_ttl_secs == 0 || self.cache.stats_ttl_secs == 0 {
            bail!("cache ttls must be > 0");
        }
        if self.lock.ttl_secs == 0 {
            bail!("lock.ttl_secs must be > 0");
        }
        if self.rate_limit.window_secs == 0 {
            bail!("rate_limit.window_secs must be > 0");
        }

        Ok(())
    }
}
