//! Remote HTTP embedding/summarization backend
//!
//! Talks to an OpenAI-compatible JSON API. The deadline of the calling
//! request bounds every HTTP round trip; transport failures surface as
//! `Unavailable` so the caller's retry policy can take over.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{Embedder, LlmError, LlmResult, Summarizer};
use crate::deadline::Deadline;

/// Configuration for a remote backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLlmConfig {
    /// Base URL, e.g. `https://api.example.com/v1`
    pub base_url: String,
    /// Bearer token
    pub api_key: String,
    /// Embedding model identifier
    pub embedding_model: String,
    /// Embedding dimension the model produces
    pub embedding_dimension: usize,
    /// Summarization model identifier
    pub summary_model: String,
    /// Sampling temperature for summaries; kept low so output stays factual
    pub summary_temperature: f32,
    /// Fallback timeout when the caller passes an unbounded deadline
    pub default_timeout_secs: u64,
}

impl Default for RemoteLlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8089/v1".to_string(),
            api_key: String::new(),
            embedding_model: "text-embed-small".to_string(),
            embedding_dimension: 384,
            summary_model: "summary-small".to_string(),
            summary_temperature: 0.2,
            default_timeout_secs: 30,
        }
    }
}

/// Remote embedder + summarizer over one HTTP client
pub struct RemoteLlm {
    config: RemoteLlmConfig,
    client: reqwest::Client,
    name: String,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDatum>,
}

#[derive(Deserialize)]
struct EmbedDatum {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct SummaryRequest<'a> {
    model: &'a str,
    input: &'a [String],
    intent: &'a str,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Deserialize)]
struct SummaryResponse {
    summary: String,
}

impl RemoteLlm {
    /// Create a backend from configuration
    pub fn new(config: RemoteLlmConfig) -> Self {
        let name = format!("remote/{}+{}", config.embedding_model, config.summary_model);
        Self {
            config,
            client: reqwest::Client::new(),
            name,
        }
    }

    fn timeout_for(&self, deadline: Deadline) -> Duration {
        deadline
            .remaining()
            .unwrap_or(Duration::from_secs(self.config.default_timeout_secs))
    }

    fn unavailable(&self, reason: impl std::fmt::Display) -> LlmError {
        LlmError::Unavailable {
            backend: self.name.clone(),
            reason: reason.to_string(),
        }
    }

    async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
        deadline: Deadline,
    ) -> LlmResult<Resp> {
        let timeout = self.timeout_for(deadline);
        if timeout.is_zero() {
            return Err(LlmError::Timeout(path.to_string()));
        }
        let url = format!("{}{path}", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(path.to_string())
                } else {
                    self.unavailable(e)
                }
            })?;

        if !response.status().is_success() {
            return Err(self.unavailable(format!("HTTP {}", response.status())));
        }
        response
            .json::<Resp>()
            .await
            .map_err(|e| LlmError::InvalidOutput {
                backend: self.name.clone(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl Embedder for RemoteLlm {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> usize {
        self.config.embedding_dimension
    }

    async fn embed(&self, text: &str, deadline: Deadline) -> LlmResult<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()], deadline).await?;
        vectors.pop().ok_or_else(|| LlmError::InvalidOutput {
            backend: self.name.clone(),
            reason: "empty embedding response".to_string(),
        })
    }

    async fn embed_batch(&self, texts: &[String], deadline: Deadline) -> LlmResult<Vec<Vec<f32>>> {
        let request = EmbedRequest {
            model: &self.config.embedding_model,
            input: texts,
        };
        let response: EmbedResponse = self.post_json("/embeddings", &request, deadline).await?;
        if response.data.len() != texts.len() {
            return Err(LlmError::InvalidOutput {
                backend: self.name.clone(),
                reason: format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    response.data.len()
                ),
            });
        }
        let dimension = self.config.embedding_dimension;
        response
            .data
            .into_iter()
            .map(|d| {
                if d.embedding.len() == dimension {
                    Ok(d.embedding)
                } else {
                    Err(LlmError::InvalidOutput {
                        backend: self.name.clone(),
                        reason: format!(
                            "expected dimension {dimension}, got {}",
                            d.embedding.len()
                        ),
                    })
                }
            })
            .collect()
    }
}

#[async_trait]
impl Summarizer for RemoteLlm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn summarize(
        &self,
        texts: &[String],
        intent: &str,
        target_tokens: usize,
        deadline: Deadline,
    ) -> LlmResult<String> {
        if texts.is_empty() {
            return Ok(String::new());
        }
        let request = SummaryRequest {
            model: &self.config.summary_model,
            input: texts,
            intent,
            max_tokens: target_tokens,
            temperature: self.config.summary_temperature,
        };
        let response: SummaryResponse = self.post_json("/summaries", &request, deadline).await?;

        // Enforce the contract even against a misbehaving backend: trim to
        // target + 10%.
        let limit_chars = target_tokens.saturating_mul(4).saturating_add(target_tokens * 4 / 10);
        if response.summary.len() > limit_chars && limit_chars > 0 {
            let mut end = limit_chars;
            while !response.summary.is_char_boundary(end) {
                end -= 1;
            }
            return Ok(response.summary[..end].to_string());
        }
        Ok(response.summary)
    }
}
