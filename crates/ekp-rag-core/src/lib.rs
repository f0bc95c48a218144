//! # EKP RAG Core
//!
//! Shared logic for the EKP knowledge service: data models, chunking,
//! collaborator traits (embedder, vector index, key-value store, LLM
//! completion), retrieval with hybrid re-ranking, and the concurrency layer
//! (answer cache, distributed locks, rate limits).
//!
//! This crate contains no HTTP clients or filesystem I/O. Concrete
//! embedding and completion backends live in the `ekp-rag` app crate;
//! in-memory index and key-value backends live here so that tests and
//! single-process deployments need nothing external.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`chunk`] | Paragraph/sentence chunker and token estimation |
//! | [`embedding`] | `Embedder` trait and cosine similarity |
//! | [`index`] | `VectorIndex` trait and brute-force in-memory index |
//! | [`retrieve`] | Vector and hybrid retrieval, context assembly |
//! | [`kv`] | `KvStore` trait, atomic scripts, in-memory store, clocks |
//! | [`cache`] | Answer cache, hot questions, document cache |
//! | [`lock`] | Identifier-tagged distributed lock |
//! | [`rate_limit`] | Fixed-window limiter and token bucket |
//! | [`memory`] | Per-session working memory |
//! | [`completion`] | LLM completion collaborator trait |

pub mod cache;
pub mod chunk;
pub mod completion;
pub mod embedding;
pub mod error;
pub mod index;
pub mod kv;
pub mod lock;
pub mod memory;
pub mod models;
pub mod rate_limit;
pub mod retrieve;

pub use error::RagError;
