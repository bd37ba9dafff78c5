//! Local deterministic backends
//!
//! [`HashEmbedder`] projects token hashes into a fixed-dimension space and
//! L2-normalizes; identical text always yields an identical vector, which is
//! what batch score recomputation relies on. [`ExtractiveSummarizer`] selects
//! whole sentences under a token budget, so its output contains only facts
//! present in the input by construction.
//!
//! These are real backends for fully local operation, not just test
//! doubles: they trade quality for determinism and zero network surface.

use async_trait::async_trait;

use super::{Embedder, LlmResult, Summarizer};
use crate::deadline::Deadline;

/// Deterministic hash-projection embedder
pub struct HashEmbedder {
    dimension: usize,
    name: String,
}

impl HashEmbedder {
    /// Create an embedder producing `dimension`-length vectors
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            name: format!("hash-embedder-v1/{dimension}"),
        }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            let digest = blake3::hash(token.as_bytes());
            let bytes = digest.as_bytes();
            let bucket = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
                % self.dimension;
            let sign = if bytes[4] & 1 == 0 { 1.0 } else { -1.0 };
            let magnitude = 1.0 + (bytes[5] as f32 / 255.0);
            vector[bucket] += sign * magnitude;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str, _deadline: Deadline) -> LlmResult<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String], _deadline: Deadline) -> LlmResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }
}

/// Sentence-extractive summarizer
pub struct ExtractiveSummarizer;

impl ExtractiveSummarizer {
    /// Rough token estimate used to respect the budget: chars / 4
    fn estimate_tokens(text: &str) -> usize {
        text.len().div_ceil(4)
    }

    fn split_sentences(text: &str) -> Vec<&str> {
        let mut sentences = Vec::new();
        let mut start = 0;
        for (i, c) in text.char_indices() {
            if matches!(c, '.' | '!' | '?' | '\n') {
                let end = i + c.len_utf8();
                let sentence = text[start..end].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                start = end;
            }
        }
        let tail = text[start..].trim();
        if !tail.is_empty() {
            sentences.push(tail);
        }
        sentences
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    fn name(&self) -> &str {
        "extractive-summarizer-v1"
    }

    async fn summarize(
        &self,
        texts: &[String],
        _intent: &str,
        target_tokens: usize,
        _deadline: Deadline,
    ) -> LlmResult<String> {
        let mut parts: Vec<&str> = Vec::new();
        let mut used = 0usize;

        // Round-robin one sentence from each input so every source item
        // contributes before any item gets a second sentence.
        let per_text: Vec<Vec<&str>> = texts.iter().map(|t| Self::split_sentences(t)).collect();
        let max_len = per_text.iter().map(Vec::len).max().unwrap_or(0);
        'outer: for round in 0..max_len {
            for sentences in &per_text {
                if let Some(sentence) = sentences.get(round) {
                    let cost = Self::estimate_tokens(sentence) + 1;
                    if used + cost > target_tokens {
                        break 'outer;
                    }
                    parts.push(sentence);
                    used += cost;
                }
            }
        }

        // A non-empty input always yields at least one (possibly truncated)
        // sentence so zero-ish budgets still produce well-formed output.
        if parts.is_empty() {
            if let Some(first) = per_text.iter().flatten().next() {
                let budget_chars = (target_tokens * 4).max(1).min(first.len());
                let mut end = budget_chars;
                while !first.is_char_boundary(end) {
                    end -= 1;
                }
                return Ok(first[..end].to_string());
            }
            return Ok(String::new());
        }

        Ok(parts.join(" "))
    }
}
