//! Core data models shared by the ingestion and retrieval pipeline.

use serde::{Deserialize, Serialize};

/// A chunk of a document's text, the unit of retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic UUID derived from the document ID and index.
    pub id: String,
    pub document_id: String,
    /// Contiguous ordinal within the document, starting at 0.
    pub chunk_index: usize,
    pub content: String,
    /// Estimated token count (see [`crate::chunk::estimate_tokens`]).
    pub token_count: usize,
    /// SHA-256 of `content`.
    pub hash: String,
}

/// A ranked hit from the vector index or the retriever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    /// Cosine similarity for vector search, combined score after hybrid
    /// re-ranking. Higher is better.
    pub score: f64,
    pub document_title: Option<String>,
}

/// A source descriptor shown to users alongside an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub chunk_id: String,
    pub document_id: String,
    pub document_title: Option<String>,
    /// Display excerpt, at most 200 characters plus an ellipsis.
    pub content: String,
    pub relevance_score: f64,
}

/// Retrieval output ready to be placed into an LLM prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievedContext {
    /// `[1] ...\n\n[2] ...` with the untruncated chunk contents.
    pub context: String,
    pub sources: Vec<SourceRef>,
    pub total_chunks: usize,
}

impl RetrievedContext {
    pub fn is_empty(&self) -> bool {
        self.total_chunks == 0
    }
}

/// Retrieval strategy. Also partitions the answer cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    /// Pure vector similarity.
    #[serde(alias = "semantic")]
    Vector,
    /// Vector candidates re-ranked with a lexical signal.
    #[default]
    Hybrid,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMode::Vector => "vector",
            RetrievalMode::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RetrievalMode {
    type Err = crate::RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vector" | "semantic" => Ok(RetrievalMode::Vector),
            "hybrid" => Ok(RetrievalMode::Hybrid),
            other => Err(crate::RagError::InvalidParameter(format!(
                "unknown retrieval mode '{}': use vector or hybrid",
                other
            ))),
        }
    }
}

/// One turn of a conversation, as kept in working memory and passed to
/// the completion collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}
