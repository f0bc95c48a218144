//! In-memory [`VectorIndex`] implementation for testing and small corpora.
//!
//! Uses a `Vec` behind `std::sync::RwLock`. Search is brute-force cosine
//! similarity over all stored vectors.

use std::collections::BTreeSet;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use super::{IndexedChunk, VectorIndex};
use crate::embedding::cosine_similarity;
use crate::error::RagError;
use crate::models::SearchResult;

/// In-memory vector index with a fixed dimension.
pub struct InMemoryVectorIndex {
    dims: usize,
    entries: RwLock<Vec<IndexedChunk>>,
}

impl InMemoryVectorIndex {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn upsert(&self, chunk: IndexedChunk) -> Result<()> {
        if chunk.vector.len() != self.dims {
            return Err(RagError::DimensionMismatch {
                got: chunk.vector.len(),
                want: self.dims,
            }
            .into());
        }
        let mut entries = self.entries.write().unwrap();
        entries.retain(|e| e.chunk_id != chunk.chunk_id);
        entries.push(chunk);
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        document_ids: Option<&[String]>,
    ) -> Result<Vec<SearchResult>> {
        if vector.len() != self.dims {
            return Err(RagError::DimensionMismatch {
                got: vector.len(),
                want: self.dims,
            }
            .into());
        }
        let entries = self.entries.read().unwrap();
        let mut results: Vec<SearchResult> = entries
            .iter()
            .filter(|e| document_ids.map_or(true, |ids| ids.contains(&e.document_id)))
            .map(|e| SearchResult {
                chunk_id: e.chunk_id.clone(),
                document_id: e.document_id.clone(),
                content: e.content.clone(),
                score: cosine_similarity(vector, &e.vector) as f64,
                document_title: e.document_title.clone(),
            })
            .collect();
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(top_k);
        Ok(results)
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|e| e.document_id != document_id);
        Ok(before - entries.len())
    }

    async fn count_for_document(&self, document_id: &str) -> Result<usize> {
        let entries = self.entries.read().unwrap();
        Ok(entries
            .iter()
            .filter(|e| e.document_id == document_id)
            .count())
    }

    async fn document_ids(&self) -> Result<Vec<String>> {
        let entries = self.entries.read().unwrap();
        let ids: BTreeSet<&str> = entries.iter().map(|e| e.document_id.as_str()).collect();
        Ok(ids.into_iter().map(str::to_string).collect())
    }
}
