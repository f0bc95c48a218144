//! Retrieval with vector and hybrid ranking modes.
//!
//! The [`Retriever`] owns an injected [`Embedder`] and [`VectorIndex`] and
//! turns a question into ranked [`SearchResult`]s, or into a numbered
//! context block ready for an LLM prompt.
//!
//! # Hybrid Scoring Algorithm
//!
//! 1. Fetch `2 × top_k` vector candidates (cosine similarity).
//! 2. Lexical score per candidate: case-insensitive occurrences of the
//!    query in the content, divided by 10 and capped at `1.0`.
//! 3. Merge: `score = (1 - w) × vector + w × lexical`.
//! 4. Sort by score (desc) and truncate to `top_k`.
//!
//! Only the vector-selected candidates are re-ranked; this is not a
//! corpus-wide keyword search.
//!
//! # Failure Handling
//!
//! Invalid input (empty query, `top_k == 0`, weight outside `[0, 1]`) is
//! returned as [`RagError`]. Embedder or index failures, and calls that
//! exceed [`RetrievalParams::timeout`], are logged and produce an empty
//! result so the caller can answer "nothing found".

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::embedding::{embed_one, Embedder};
use crate::error::RagError;
use crate::index::VectorIndex;
use crate::models::{RetrievalMode, RetrievedContext, SearchResult, SourceRef};

/// Default blend weight of the lexical signal in hybrid mode.
pub const DEFAULT_KEYWORD_WEIGHT: f64 = 0.3;

/// Maximum characters of a source excerpt shown for display.
const SOURCE_PREVIEW_CHARS: usize = 200;

/// Occurrence count at which the lexical score saturates.
const LEXICAL_SATURATION: f64 = 10.0;

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone)]
pub struct RetrievalParams {
    /// Upper bound for embedding + index round-trips of a single query.
    pub timeout: Duration,
    /// Lexical weight `w` in `(1 - w) × vector + w × lexical`.
    pub keyword_weight: f64,
    /// Results scoring below this are dropped (`0.0` disables).
    pub min_score: f64,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            keyword_weight: DEFAULT_KEYWORD_WEIGHT,
            min_score: 0.0,
        }
    }
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    params: RetrievalParams,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        params: RetrievalParams,
    ) -> Self {
        Self {
            embedder,
            index,
            params,
        }
    }

    pub fn params(&self) -> &RetrievalParams {
        &self.params
    }

    /// Pure vector retrieval: embed `query`, return the `top_k` nearest
    /// chunks, dropping those below `min_score` when it is positive.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        document_ids: Option<&[String]>,
        min_score: f64,
    ) -> Result<Vec<SearchResult>, RagError> {
        validate_query(query, top_k)?;

        let mut results = self.vector_candidates(query, top_k, document_ids).await;
        if min_score > 0.0 {
            results.retain(|r| r.score >= min_score);
        }
        Ok(results)
    }

    /// Vector retrieval over `2 × top_k` candidates, re-ranked by blending
    /// in the lexical score with weight `keyword_weight`.
    pub async fn hybrid_search(
        &self,
        query: &str,
        top_k: usize,
        document_ids: Option<&[String]>,
        keyword_weight: f64,
    ) -> Result<Vec<SearchResult>, RagError> {
        validate_query(query, top_k)?;
        if !(0.0..=1.0).contains(&keyword_weight) {
            return Err(RagError::InvalidParameter(format!(
                "keyword_weight must be in [0.0, 1.0], got {}",
                keyword_weight
            )));
        }

        let candidates = self
            .retrieve(query, top_k * 2, document_ids, self.params.min_score)
            .await?;
        debug!(
            candidates = candidates.len(),
            top_k, keyword_weight, "hybrid re-rank"
        );
        Ok(rerank_hybrid(candidates, query, top_k, keyword_weight))
    }

    /// Dispatch on `mode` using the configured weight and score floor.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        mode: RetrievalMode,
        document_ids: Option<&[String]>,
    ) -> Result<Vec<SearchResult>, RagError> {
        match mode {
            RetrievalMode::Vector => {
                self.retrieve(query, top_k, document_ids, self.params.min_score)
                    .await
            }
            RetrievalMode::Hybrid => {
                self.hybrid_search(query, top_k, document_ids, self.params.keyword_weight)
                    .await
            }
        }
    }

    /// Search and assemble the numbered context plus display sources.
    pub async fn retrieve_with_context(
        &self,
        query: &str,
        top_k: usize,
        mode: RetrievalMode,
        document_ids: Option<&[String]>,
    ) -> Result<RetrievedContext, RagError> {
        let results = self.search(query, top_k, mode, document_ids).await?;
        Ok(build_context(&results))
    }

    async fn vector_candidates(
        &self,
        query: &str,
        k: usize,
        document_ids: Option<&[String]>,
    ) -> Vec<SearchResult> {
        let lookup = async {
            let query_vec = embed_one(self.embedder.as_ref(), query).await?;
            self.index.query(&query_vec, k, document_ids).await
        };

        match tokio::time::timeout(self.params.timeout, lookup).await {
            Ok(Ok(results)) => results,
            Ok(Err(e)) => {
                warn!(error = %e, "retrieval backend failed, returning no results");
                Vec::new()
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.params.timeout.as_millis() as u64,
                    "retrieval timed out, returning no results"
                );
                Vec::new()
            }
        }
    }
}

fn validate_query(query: &str, top_k: usize) -> Result<(), RagError> {
    if query.trim().is_empty() {
        return Err(RagError::EmptyQuery);
    }
    if top_k == 0 {
        return Err(RagError::InvalidParameter("top_k must be >= 1".to_string()));
    }
    Ok(())
}

/// Lexical signal: `min(occurrences(query in content) / 10, 1.0)`,
/// case-insensitive, non-overlapping substring matches.
pub fn lexical_score(query: &str, content: &str) -> f64 {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return 0.0;
    }
    let count = content.to_lowercase().matches(needle.as_str()).count();
    (count as f64 / LEXICAL_SATURATION).min(1.0)
}

/// Replace each candidate's score with the hybrid blend, sort descending,
/// and keep the best `top_k`.
pub fn rerank_hybrid(
    mut candidates: Vec<SearchResult>,
    query: &str,
    top_k: usize,
    keyword_weight: f64,
) -> Vec<SearchResult> {
    for c in &mut candidates {
        let lexical = lexical_score(query, &c.content);
        c.score = (1.0 - keyword_weight) * c.score + keyword_weight * lexical;
    }
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(top_k);
    candidates
}

/// Number the results from 1 and join them with blank lines. Sources carry
/// a display excerpt; the context keeps the full content.
pub fn build_context(results: &[SearchResult]) -> RetrievedContext {
    let context = results
        .iter()
        .enumerate()
        .map(|(i, r)| format!("[{}] {}", i + 1, r.content))
        .collect::<Vec<_>>()
        .join("\n\n");

    let sources = results
        .iter()
        .map(|r| SourceRef {
            chunk_id: r.chunk_id.clone(),
            document_id: r.document_id.clone(),
            document_title: r.document_title.clone(),
            content: preview(&r.content, SOURCE_PREVIEW_CHARS),
            relevance_score: r.score,
        })
        .collect();

    RetrievedContext {
        context,
        sources,
        total_chunks: results.len(),
    }
}

/// First `max` characters of `text`, with `...` appended when cut.
pub fn preview(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}
