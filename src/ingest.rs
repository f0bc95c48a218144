//! Ingestion pipeline: text → chunks → embeddings → vector index.
//!
//! Re-ingesting a document replaces it. The new chunks are embedded and
//! dimension-checked first; the old vectors are deleted only once every new
//! vector is in hand, so a failed embedding leaves the previous version
//! searchable. Unlike retrieval, embedding failure here is an error.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;

use ekp_rag_core::chunk::{chunk_stats, chunk_text, ChunkStats};
use ekp_rag_core::embedding::Embedder;
use ekp_rag_core::index::{IndexedChunk, VectorIndex};
use ekp_rag_core::RagError;

use crate::config::ChunkingConfig;
use crate::embedding::embed_batched;

/// File extensions read by [`read_text_file`] and [`scan_directory`].
const TEXT_EXTENSIONS: [&str; 3] = ["txt", "md", "markdown"];

/// A plain-text document ready for ingestion.
#[derive(Debug, Clone)]
pub struct TextDocument {
    pub document_id: String,
    pub title: Option<String>,
    pub text: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    pub document_id: String,
    pub chunks: usize,
    pub vectors_written: usize,
    pub replaced: usize,
    pub stats: ChunkStats,
}

pub struct Ingestor {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    chunking: ChunkingConfig,
    batch_size: usize,
}

impl Ingestor {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        chunking: ChunkingConfig,
        batch_size: usize,
    ) -> Self {
        Self {
            embedder,
            index,
            chunking,
            batch_size,
        }
    }

    /// Chunk, embed and index one document, replacing any earlier version.
    pub async fn ingest_document(
        &self,
        document_id: &str,
        title: Option<&str>,
        text: &str,
    ) -> Result<IngestReport> {
        if document_id.trim().is_empty() {
            return Err(RagError::InvalidParameter("document_id must not be empty".into()).into());
        }
        if self.embedder.dims() != self.index.dims() {
            return Err(RagError::DimensionMismatch {
                got: self.embedder.dims(),
                want: self.index.dims(),
            }
            .into());
        }

        let chunks = chunk_text(
            document_id,
            text,
            self.chunking.max_chars,
            self.chunking.overlap_chars,
        );
        let stats = chunk_stats(&chunks);

        let contents: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = embed_batched(self.embedder.as_ref(), &contents, self.batch_size)
            .await
            .with_context(|| format!("Failed to embed document {}", document_id))?;
        if vectors.len() != chunks.len() {
            bail!(
                "Embedder returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            );
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.index.dims()) {
            return Err(RagError::DimensionMismatch {
                got: bad.len(),
                want: self.index.dims(),
            }
            .into());
        }

        let replaced = self.index.delete_document(document_id).await?;
        if replaced > 0 {
            debug!(document_id, replaced, "removed previous vectors");
        }

        let mut written = 0;
        for (chunk, vector) in chunks.into_iter().zip(vectors) {
            self.index
                .upsert(IndexedChunk {
                    chunk_id: chunk.id,
                    document_id: chunk.document_id,
                    content: chunk.content,
                    vector,
                    document_title: title.map(str::to_string),
                })
                .await?;
            written += 1;
        }

        info!(
            document_id,
            chunks = stats.total_chunks,
            tokens = stats.total_tokens,
            "document indexed"
        );

        Ok(IngestReport {
            document_id: document_id.to_string(),
            chunks: stats.total_chunks,
            vectors_written: written,
            replaced,
            stats,
        })
    }

    pub async fn ingest(&self, doc: &TextDocument) -> Result<IngestReport> {
        debug!(document_id = %doc.document_id, updated_at = %doc.updated_at, "ingesting");
        self.ingest_document(&doc.document_id, doc.title.as_deref(), &doc.text)
            .await
    }

    /// Remove a document's vectors. Returns how many were deleted.
    pub async fn delete_document(&self, document_id: &str) -> Result<usize> {
        self.index.delete_document(document_id).await
    }
}

fn is_text_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| TEXT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Read a `.txt` or `.md` file. The document ID is `id` when given,
/// otherwise the path as written; the title is the file stem.
pub fn read_text_file(path: &Path, id: Option<&str>) -> Result<TextDocument> {
    if !is_text_file(path) {
        bail!(
            "Unsupported file type: {} (expected .txt or .md)",
            path.display()
        );
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let updated_at = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    let title = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string());

    Ok(TextDocument {
        document_id: id
            .map(str::to_string)
            .unwrap_or_else(|| path.to_string_lossy().to_string()),
        title,
        text,
        updated_at,
    })
}

/// Collect every text file under `root` (or `root` itself when it is a
/// file), sorted by document ID. IDs are paths relative to `root`.
pub fn scan_directory(root: &Path) -> Result<Vec<TextDocument>> {
    if !root.exists() {
        bail!("Path does not exist: {}", root.display());
    }
    if root.is_file() {
        return Ok(vec![read_text_file(root, None)?]);
    }

    let mut docs = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() || !is_text_file(entry.path()) {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let id = relative.to_string_lossy().to_string();
        docs.push(read_text_file(entry.path(), Some(&id))?);
    }
    docs.sort_by(|a, b| a.document_id.cmp(&b.document_id));
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ekp_rag_core::index::memory::InMemoryVectorIndex;

    /// Two-dimensional embedder: `[len, 1]`.
    struct LenEmbedder {
        dims: usize,
    }

    #[async_trait]
    impl Embedder for LenEmbedder {
        fn model_name(&self) -> &str {
            "len"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| vec![t.chars().count() as f32, 1.0])
                .collect())
        }
    }

    fn ingestor(embedder_dims: usize) -> (Ingestor, Arc<InMemoryVectorIndex>) {
        let index = Arc::new(InMemoryVectorIndex::new(2));
        let ingestor = Ingestor::new(
            Arc::new(LenEmbedder {
                dims: embedder_dims,
            }),
            index.clone(),
            ChunkingConfig {
                max_chars: 20,
                overlap_chars: 0,
            },
            2,
        );
        (ingestor, index)
    }

    #[tokio::test]
    async fn test_ingest_then_reingest_replaces() {
        let (ingestor, index) = ingestor(2);
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird one.";
        let report = ingestor
            .ingest_document("doc-1", Some("Doc"), text)
            .await
            .unwrap();
        assert_eq!(report.chunks, 3);
        assert_eq!(report.vectors_written, 3);
        assert_eq!(report.replaced, 0);
        assert_eq!(index.count_for_document("doc-1").await.unwrap(), 3);

        let report = ingestor
            .ingest_document("doc-1", Some("Doc"), "Short now.")
            .await
            .unwrap();
        assert_eq!(report.replaced, 3);
        assert_eq!(index.count_for_document("doc-1").await.unwrap(), 1);

        assert_eq!(ingestor.delete_document("doc-1").await.unwrap(), 1);
        assert!(index.is_empty());
    }

    /// Fails every call after the first `ok_calls`.
    struct FlakyEmbedder {
        ok_calls: usize,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let n = self
                .calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n >= self.ok_calls {
                bail!("embedding service unavailable");
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    #[tokio::test]
    async fn test_failed_reingest_keeps_previous_version() {
        let index = Arc::new(InMemoryVectorIndex::new(2));
        let ingestor = Ingestor::new(
            Arc::new(FlakyEmbedder {
                ok_calls: 1,
                calls: std::sync::atomic::AtomicUsize::new(0),
            }),
            index.clone(),
            ChunkingConfig {
                max_chars: 20,
                overlap_chars: 0,
            },
            8,
        );
        let text = "First paragraph.\n\nSecond paragraph.";
        ingestor.ingest_document("doc-1", None, text).await.unwrap();
        assert_eq!(index.count_for_document("doc-1").await.unwrap(), 2);

        assert!(ingestor
            .ingest_document("doc-1", None, "Rewritten text.")
            .await
            .is_err());
        assert_eq!(index.count_for_document("doc-1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let (ingestor, index) = ingestor(3);
        let err = ingestor
            .ingest_document("doc-1", None, "text")
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RagError>(),
            Some(RagError::DimensionMismatch { got: 3, want: 2 })
        ));
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_empty_text_writes_nothing() {
        let (ingestor, _) = ingestor(2);
        let report = ingestor.ingest_document("doc-1", None, "  \n ").await.unwrap();
        assert_eq!(report.chunks, 0);
        assert_eq!(report.vectors_written, 0);
    }

    #[test]
    fn test_scan_directory_reads_text_files_only() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.md"), "# A").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), "B").unwrap();
        std::fs::write(dir.path().join("c.pdf"), "binary").unwrap();

        let docs = scan_directory(dir.path()).unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.document_id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], "a.md");
        assert!(ids[1].ends_with("b.txt"));
        assert_eq!(docs[0].title.as_deref(), Some("a"));

        assert!(read_text_file(&dir.path().join("c.pdf"), None).is_err());
    }
}
