//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait defines what the retrieval pipeline needs
//! from a nearest-neighbour store: upsert a chunk vector, and return the
//! chunks most similar to a query vector. The index itself (pgvector,
//! Qdrant, ...) is an external collaborator; [`memory::InMemoryVectorIndex`]
//! is a brute-force implementation for tests and single-process use.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::SearchResult;

/// A chunk vector ready to be written to the index.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub vector: Vec<f32>,
    pub document_title: Option<String>,
}

/// Abstract nearest-neighbour store.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorIndex::upsert) | Insert or replace a chunk vector |
/// | [`query`](VectorIndex::query) | Similarity-ranked search, nearest first |
/// | [`delete_document`](VectorIndex::delete_document) | Drop all vectors of a document |
/// | [`count_for_document`](VectorIndex::count_for_document) | Vectors stored for a document |
/// | [`document_ids`](VectorIndex::document_ids) | Distinct indexed documents |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Configured vector dimension. Upserts of any other length fail.
    fn dims(&self) -> usize;

    /// Insert a chunk vector, replacing any existing entry for the chunk.
    async fn upsert(&self, chunk: IndexedChunk) -> Result<()>;

    /// Return up to `top_k` chunks ordered by descending similarity
    /// (`1 - cosine_distance`). When `document_ids` is given, only chunks
    /// of those documents are considered.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        document_ids: Option<&[String]>,
    ) -> Result<Vec<SearchResult>>;

    /// Remove every vector belonging to `document_id`. Returns the count.
    async fn delete_document(&self, document_id: &str) -> Result<usize>;

    async fn count_for_document(&self, document_id: &str) -> Result<usize>;

    async fn document_ids(&self) -> Result<Vec<String>>;
}
