//! Hybrid candidate ranking
//!
//! ```text
//! hybrid = α·vector_sim + β·recency + γ·outcome_rate + δ·current_score
//! ```
//!
//! Base weights come from configuration; the active intent may override
//! individual components through the configured override table. Ties break
//! by higher retention score, then more recent last-used time.

use ordered_float::OrderedFloat;

use crate::config::{HybridWeights, RetrievalConfig};
use crate::model::DecryptedItem;
use crate::rehydrate::intent::Intent;

/// A candidate with its ranking inputs and final hybrid score
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    /// The decrypted item
    pub item: DecryptedItem,
    /// Vector similarity from retrieval
    pub similarity: f32,
    /// Aggregated outcome success rate
    pub outcome_rate: f32,
    /// Final hybrid score
    pub hybrid: f32,
}

/// The effective weights for an intent: base weights with the intent's
/// override applied on top
pub fn weights_for(config: &RetrievalConfig, intent: &Intent) -> HybridWeights {
    match config.intent_overrides.get(intent.as_str()) {
        Some(overrides) => overrides.apply(config.hybrid),
        None => config.hybrid,
    }
}

/// Rank candidates by hybrid score, descending
pub fn rank(
    candidates: Vec<(DecryptedItem, f32)>,
    weights: HybridWeights,
    now: chrono::DateTime<chrono::Utc>,
) -> Vec<RankedCandidate> {
    let mut ranked: Vec<RankedCandidate> = candidates
        .into_iter()
        .map(|(item, similarity)| {
            let idle_days =
                (now - item.item.last_used_at).num_seconds().max(0) as f32 / 86_400.0;
            let recency = 1.0 / (1.0 + idle_days);
            let outcome_rate = item.outcome_rate();
            let hybrid = weights.alpha * similarity
                + weights.beta * recency
                + weights.gamma * outcome_rate
                + weights.delta * item.item.score;
            RankedCandidate {
                item,
                similarity,
                outcome_rate,
                hybrid,
            }
        })
        .collect();

    ranked.sort_by_key(|c| {
        (
            std::cmp::Reverse(OrderedFloat(c.hybrid)),
            std::cmp::Reverse(OrderedFloat(c.item.item.score)),
            std::cmp::Reverse(c.item.item.last_used_at),
            c.item.item.id,
        )
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MemoryItem, PiiFlags, Tier, TopicId, SCHEMA_VERSION};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn candidate(score: f32, idle_days: i64) -> (DecryptedItem, f32) {
        let now = Utc::now();
        (
            DecryptedItem {
                item: MemoryItem {
                    id: Uuid::new_v4(),
                    user_id: "u1".to_string(),
                    topic: TopicId::new("work").unwrap(),
                    content: vec![],
                    vector: vec![],
                    tier: Tier::Short,
                    score,
                    promoted_at_score: None,
                    created_at: now - Duration::days(idle_days + 1),
                    updated_at: now,
                    last_used_at: now - Duration::days(idle_days),
                    access_count: 0,
                    pii_flags: PiiFlags::none(),
                    outcomes: Vec::new(),
                    archived: false,
                    archived_at: None,
                    quarantined: false,
                    pinned: false,
                    source_items: None,
                    key_id: "work/v1".to_string(),
                    embedding_backend: "test".to_string(),
                    schema_version: SCHEMA_VERSION,
                    record_version: 1,
                },
                text: String::new(),
                vector: vec![],
            },
            0.5,
        )
    }

    #[test]
    fn test_similarity_dominates_with_default_weights() {
        let now = Utc::now();
        let (strong, _) = candidate(0.5, 0);
        let (weak, _) = candidate(0.5, 0);
        let ranked = rank(
            vec![(weak, 0.1), (strong.clone(), 0.95)],
            HybridWeights::default(),
            now,
        );
        assert_eq!(ranked[0].item.item.id, strong.item.id);
        assert!(ranked[0].hybrid > ranked[1].hybrid);
    }

    #[test]
    fn test_recency_breaks_similarity_ties() {
        let now = Utc::now();
        let fresh = candidate(0.5, 0);
        let stale = candidate(0.5, 20);
        let fresh_id = fresh.0.item.id;
        let ranked = rank(vec![stale, fresh], HybridWeights::default(), now);
        assert_eq!(ranked[0].item.item.id, fresh_id);
    }

    #[test]
    fn test_score_breaks_full_ties() {
        let now = Utc::now();
        let mut high = candidate(0.9, 5);
        let mut low = candidate(0.2, 5);
        // Identical hybrid inputs except current score; make last_used equal
        low.0.item.last_used_at = high.0.item.last_used_at;
        let high_id = high.0.item.id;
        // Zero out delta so hybrid ties, leaving score as tie-break
        let weights = HybridWeights {
            alpha: 1.0,
            beta: 0.0,
            gamma: 0.0,
            delta: 0.0,
        };
        high.1 = 0.5;
        low.1 = 0.5;
        let ranked = rank(vec![low, high], weights, now);
        assert_eq!(ranked[0].item.item.id, high_id);
    }

    #[test]
    fn test_intent_overrides_change_effective_weights() {
        let config = RetrievalConfig::default();
        let base = weights_for(&config, &Intent::General);
        assert_eq!(base.alpha, 0.5);
        let code = weights_for(&config, &Intent::CodeAssist);
        assert_eq!(code.alpha, 0.4);
        assert_eq!(code.gamma, 0.3);
        assert_eq!(code.beta, base.beta);
        let research = weights_for(&config, &Intent::Research);
        assert_eq!(research.alpha, 0.6);
        assert_eq!(research.beta, 0.1);
    }
}
