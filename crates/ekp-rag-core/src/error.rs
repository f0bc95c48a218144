//! Classified errors surfaced to callers.
//!
//! Backend failures travel as `anyhow::Error` through the collaborator
//! traits. `RagError` covers the cases a caller is expected to match on:
//! bad input that must be rejected without retry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    /// The query or question was empty or whitespace-only.
    #[error("query text is empty")]
    EmptyQuery,

    /// A parameter was out of its valid range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A vector's length did not match the configured dimension.
    #[error("vector size mismatch: got {got}, want {want}")]
    DimensionMismatch { got: usize, want: usize },
}
