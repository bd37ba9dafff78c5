//! Context bundle
//!
//! The product of rehydration: a token-bounded summary with per-item
//! provenance records, timing, and cache/partial flags. Bundles are what
//! the external LLM consumes; they carry excerpts and summaries, never raw
//! encrypted records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::Tier;
use crate::rehydrate::intent::Intent;

/// Per-item provenance record inside a bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleItem {
    /// Item id
    pub id: Uuid,
    /// Tier at bundle time
    pub tier: Tier,
    /// Retention score at bundle time
    pub score: f32,
    /// Short excerpt of the item text
    pub excerpt: String,
    /// Hybrid ranking score (relevance to this query)
    pub relevance: f32,
    /// Aggregated outcome success rate
    pub outcome_rate: f32,
}

/// The assembled context for one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    /// Identifier linking later outcome events to this query
    pub query_id: Uuid,
    /// Combined summary text (one section per topic/day group, each with a
    /// trailing source-id list)
    pub summary: String,
    /// Items whose content contributed to the summary
    pub items: Vec<BundleItem>,
    /// Classified (or caller-supplied) intent
    pub intent_tag: String,
    /// Estimated tokens of the returned content
    pub total_tokens: usize,
    /// Candidate retrieval duration
    pub retrieval_ms: u64,
    /// Summarization duration
    pub summarization_ms: u64,
    /// Whether this bundle came from the cache
    pub cache_hit: bool,
    /// Whether a deadline cut summarization short (some groups excluded)
    pub partial: bool,
    /// When the bundle was assembled
    pub generated_at: DateTime<Utc>,
}

impl ContextBundle {
    /// An empty, well-formed bundle (no candidates, zero budget, ...)
    pub fn empty(query_id: Uuid, intent: &Intent, retrieval_ms: u64) -> Self {
        Self {
            query_id,
            summary: String::new(),
            items: Vec::new(),
            intent_tag: intent.as_str().to_string(),
            total_tokens: 0,
            retrieval_ms,
            summarization_ms: 0,
            cache_hit: false,
            partial: false,
            generated_at: Utc::now(),
        }
    }

    /// Ids of the items used in this bundle
    pub fn item_ids(&self) -> Vec<Uuid> {
        self.items.iter().map(|i| i.id).collect()
    }
}
