//! Composition root: builds the pipeline from a [`Config`].
//!
//! The key-value store and vector index are the in-process backends from
//! `ekp-rag-core`; providers come from config. Everything is injected as
//! `Arc<dyn Trait>`, so tests assemble the same [`App`] from fakes with
//! [`App::from_parts`].

use anyhow::{bail, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use ekp_rag_core::completion::CompletionProvider;
use ekp_rag_core::embedding::Embedder;
use ekp_rag_core::index::memory::InMemoryVectorIndex;
use ekp_rag_core::index::VectorIndex;
use ekp_rag_core::kv::memory::InMemoryKv;
use ekp_rag_core::kv::KvStore;
use ekp_rag_core::retrieve::Retriever;

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::ingest::{scan_directory, IngestReport, Ingestor};
use crate::llm::create_completion;
use crate::qa::QaService;

pub struct App {
    pub config: Config,
    pub retriever: Arc<Retriever>,
    pub ingestor: Ingestor,
    pub qa: QaService,
}

impl App {
    /// Build from config with in-process stores. Fails when no embedding
    /// provider is configured, since nothing could be indexed.
    pub fn build(config: Config) -> Result<Self> {
        if !config.embedding.is_enabled() {
            bail!("No embedding provider configured. Set [embedding] provider in config or pass --embedding-provider.");
        }
        let embedder = create_embedder(&config.embedding)?;
        let completion = create_completion(&config.llm)?;
        let index: Arc<dyn VectorIndex> = Arc::new(InMemoryVectorIndex::new(embedder.dims()));
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        Ok(Self::from_parts(config, embedder, index, completion, kv))
    }

    pub fn from_parts(
        config: Config,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        completion: Arc<dyn CompletionProvider>,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        let retriever = Arc::new(Retriever::new(
            embedder.clone(),
            index.clone(),
            config.retrieval.params(),
        ));
        let ingestor = Ingestor::new(
            embedder,
            index,
            config.chunking.clone(),
            config.embedding.batch_size,
        );
        let qa = QaService::new(retriever.clone(), completion, kv, &config);
        Self {
            config,
            retriever,
            ingestor,
            qa,
        }
    }

    /// Ingest every text file under each path.
    pub async fn ingest_paths(&self, paths: &[impl AsRef<Path>]) -> Result<Vec<IngestReport>> {
        let mut reports = Vec::new();
        for path in paths {
            for doc in scan_directory(path.as_ref())? {
                reports.push(self.ingestor.ingest(&doc).await?);
            }
        }
        let chunks: usize = reports.iter().map(|r| r.chunks).sum();
        info!(documents = reports.len(), chunks, "ingestion complete");
        Ok(reports)
    }
}
