//! Embedder / summarizer interface
//!
//! Opaque calls producing fixed-dimension float vectors and bounded-length
//! summaries. Backends are pluggable and selected per user at core
//! construction; the core records which backend produced each vector and
//! summary. Every call accepts a deadline.

pub mod local;
pub mod remote;

pub use local::{ExtractiveSummarizer, HashEmbedder};
pub use remote::{RemoteLlm, RemoteLlmConfig};

use async_trait::async_trait;
use thiserror::Error;

use crate::deadline::Deadline;
use crate::error::CoreError;

/// Embedder/summarizer errors
#[derive(Error, Debug)]
pub enum LlmError {
    /// The backend is unreachable or returned a transport-level failure
    #[error("LLM backend '{backend}' unavailable: {reason}")]
    Unavailable {
        /// Backend name
        backend: String,
        /// Short failure description
        reason: String,
    },

    /// The deadline expired before the backend answered
    #[error("LLM call timed out during {0}")]
    Timeout(String),

    /// The backend returned a malformed response
    #[error("LLM backend '{backend}' returned invalid output: {reason}")]
    InvalidOutput {
        /// Backend name
        backend: String,
        /// What was wrong
        reason: String,
    },
}

/// Result type for embedder/summarizer calls
pub type LlmResult<T> = Result<T, LlmError>;

impl From<LlmError> for CoreError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Timeout(stage) => CoreError::DeadlineExceeded(stage),
            LlmError::Unavailable { backend, reason }
            | LlmError::InvalidOutput { backend, reason } => {
                CoreError::BackendUnavailable { backend, reason }
            }
        }
    }
}

/// Produces fixed-dimension embedding vectors.
///
/// Deterministic for a given backend version: identical text yields an
/// identical vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Backend name and version, recorded on every item
    fn name(&self) -> &str;

    /// Output dimension D
    fn dimension(&self) -> usize;

    /// Embed one text
    async fn embed(&self, text: &str, deadline: Deadline) -> LlmResult<Vec<f32>>;

    /// Embed a batch; backends override when they have a native batch call
    async fn embed_batch(&self, texts: &[String], deadline: Deadline) -> LlmResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text, deadline).await?);
        }
        Ok(vectors)
    }
}

/// Produces bounded-length summaries.
///
/// Output must not exceed `target_tokens` by more than 10% and must only
/// restate facts present in the input.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Backend name and version, recorded on every consolidated item
    fn name(&self) -> &str;

    /// Summarize the given texts for the given intent, within the target
    /// token budget
    async fn summarize(
        &self,
        texts: &[String],
        intent: &str,
        target_tokens: usize,
        deadline: Deadline,
    ) -> LlmResult<String>;
}

/// Cosine similarity between two vectors, 0 when either has zero norm
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }
}
