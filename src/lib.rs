//! # EKP RAG
//!
//! Retrieval-augmented question answering over an enterprise knowledge
//! base. The engine (chunking, retrieval, caching, locking, rate limiting,
//! working memory) lives in `ekp-rag-core`; this crate wires it to
//! configuration, HTTP model providers, file ingestion, and the `ekp` CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ .txt / .md │──▶│ Chunk+Embed  │──▶│ Vector index │
//! └────────────┘   └──────────────┘   └──────┬───────┘
//!                                            │
//!   question ──▶ rate limit ──▶ cache ──▶ retrieve ──▶ LLM ──▶ answer
//!                      └────── key-value store ──────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`embedding`] | OpenAI / Ollama embedding providers |
//! | [`llm`] | OpenAI chat-completion provider |
//! | [`ingest`] | File reading and document indexing |
//! | [`qa`] | Question answering orchestration |
//! | [`app`] | Composition root |

pub mod app;
pub mod config;
pub mod embedding;
mod http;
pub mod ingest;
pub mod llm;
pub mod qa;
