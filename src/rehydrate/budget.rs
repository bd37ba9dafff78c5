//! Token budgeting
//!
//! A fixed share of the caller's budget is reserved for bundle overhead;
//! the rest is filled greedily in ranked order, stopping at the first
//! candidate that no longer fits. Token estimation defaults to the
//! character-length / 4 approximation; an accurate tokenizer can be
//! injected behind the same trait.

use crate::rehydrate::ranking::RankedCandidate;

/// Estimates the token footprint of a text
pub trait TokenEstimator: Send + Sync {
    /// Estimated token count
    fn estimate(&self, text: &str) -> usize;
}

/// chars / 4, rounded up
#[derive(Debug, Clone, Copy, Default)]
pub struct CharEstimator;

impl TokenEstimator for CharEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
}

/// The usable budget after the overhead reserve
pub fn usable_budget(token_budget: usize, overhead_reserve_percent: u8) -> usize {
    token_budget.saturating_sub(token_budget * overhead_reserve_percent as usize / 100)
}

/// Greedily take ranked candidates while they fit; stop at the first
/// overflow.
pub fn select_within_budget(
    ranked: Vec<RankedCandidate>,
    token_budget: usize,
    overhead_reserve_percent: u8,
    estimator: &dyn TokenEstimator,
) -> Vec<RankedCandidate> {
    let mut remaining = usable_budget(token_budget, overhead_reserve_percent);
    let mut selected = Vec::new();
    for candidate in ranked {
        let cost = estimator.estimate(&candidate.item.text);
        if cost > remaining {
            break;
        }
        remaining -= cost;
        selected.push(candidate);
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DecryptedItem, MemoryItem, PiiFlags, Tier, TopicId, SCHEMA_VERSION};
    use chrono::Utc;
    use uuid::Uuid;

    fn candidate(text: &str, hybrid: f32) -> RankedCandidate {
        let now = Utc::now();
        RankedCandidate {
            item: DecryptedItem {
                item: MemoryItem {
                    id: Uuid::new_v4(),
                    user_id: "u1".to_string(),
                    topic: TopicId::new("work").unwrap(),
                    content: vec![],
                    vector: vec![],
                    tier: Tier::Short,
                    score: 0.5,
                    promoted_at_score: None,
                    created_at: now,
                    updated_at: now,
                    last_used_at: now,
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
                text: text.to_string(),
                vector: vec![],
            },
            similarity: 0.5,
            outcome_rate: 0.5,
            hybrid,
        }
    }

    #[test]
    fn test_char_estimator_rounds_up() {
        let estimator = CharEstimator;
        assert_eq!(estimator.estimate(""), 0);
        assert_eq!(estimator.estimate("abc"), 1);
        assert_eq!(estimator.estimate("abcd"), 1);
        assert_eq!(estimator.estimate("abcde"), 2);
    }

    #[test]
    fn test_overhead_reserve() {
        assert_eq!(usable_budget(400, 10), 360);
        assert_eq!(usable_budget(0, 10), 0);
        assert_eq!(usable_budget(100, 0), 100);
    }

    #[test]
    fn test_selection_stops_at_first_overflow() {
        // 40 chars ≈ 10 tokens each; budget 100 with 10% reserve = 90 usable
        let big = "x".repeat(40);
        let ranked: Vec<RankedCandidate> =
            (0..20).map(|i| candidate(&big, 1.0 - i as f32 / 100.0)).collect();
        let selected = select_within_budget(ranked, 100, 10, &CharEstimator);
        assert_eq!(selected.len(), 9);
    }

    #[test]
    fn test_zero_budget_selects_nothing() {
        let ranked = vec![candidate("some text", 0.9)];
        let selected = select_within_budget(ranked, 0, 10, &CharEstimator);
        assert!(selected.is_empty());
    }

    #[test]
    fn test_first_oversized_item_stops_selection() {
        // Greedy with stop-at-first-overflow: an oversized head blocks the
        // tail even if the tail would fit.
        let ranked = vec![candidate(&"x".repeat(4000), 0.9), candidate("tiny", 0.8)];
        let selected = select_within_budget(ranked, 100, 10, &CharEstimator);
        assert!(selected.is_empty());
    }
}
