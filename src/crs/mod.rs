//! # Context Retention Score engine
//!
//! Scores each item in [0, 1]:
//!
//! ```text
//! base  = w_sim·sim + w_rec·freq + w_out·outcome + w_corr·corr + w_recent·recency
//! score = clip( base · exp(-λ · age_days) − pii_penalty , 0, 1 )
//! ```
//!
//! Component semantics are documented on [`ScoreBreakdown`]. Computation is
//! pure: the same inputs produce bit-identical scores, which batch
//! recomputation relies on. Batches parallelize over rayon.

use rayon::prelude::*;
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::{CrsConfig, TierThresholds};
use crate::llm::cosine_similarity;
use crate::model::events::{aggregate_outcomes, corrections_signal};
use crate::model::{DecryptedItem, MemoryItem, Tier, TransitionReason, UserProfile};

/// The individual components feeding one score
#[derive(Debug, Clone, Copy)]
pub struct ScoreBreakdown {
    /// Cosine similarity to the topic centroid, 0.5 neutral for topics with
    /// fewer than 3 items, clamped to [0, 1]
    pub sim: f32,
    /// Recurrence: `min(1, access_count / K)`
    pub freq: f32,
    /// Aggregated outcome success rate, 0.5 when empty
    pub outcome: f32,
    /// Corrections signal in [-1, 1]; positive means corrections validated
    /// the item
    pub corr: f32,
    /// Creation recency: `1 / (1 + days_since_creation)`
    pub recency: f32,
    /// Summed per-kind PII penalty, capped
    pub pii_penalty: f32,
    /// Final clipped score
    pub score: f32,
}

/// Pure scoring and transition-evaluation engine
#[derive(Debug, Default)]
pub struct CrsEngine;

impl CrsEngine {
    /// Compute one item's score with full component breakdown
    pub fn compute_breakdown(
        item: &DecryptedItem,
        profile: &UserProfile,
        config: &CrsConfig,
        now: chrono::DateTime<chrono::Utc>,
    ) -> ScoreBreakdown {
        let record = &item.item;

        let sim = match profile.established_centroid(&record.topic) {
            Some(centroid) => cosine_similarity(&item.vector, centroid).clamp(0.0, 1.0),
            None => 0.5,
        };
        let freq =
            (record.access_count as f32 / config.recurrence_soft_cap as f32).min(1.0);
        let outcome = aggregate_outcomes(&record.outcomes);
        let corr = corrections_signal(&record.outcomes);
        let age_days = (now - record.created_at).num_seconds().max(0) as f32 / 86_400.0;
        let recency = 1.0 / (1.0 + age_days);

        let pii_penalty = record
            .pii_flags
            .kinds()
            .iter()
            .map(|kind| config.pii_penalties.get(kind).copied().unwrap_or(0.0))
            .sum::<f32>()
            .min(config.pii_penalty_cap);

        let weights = &config.weights;
        let base = weights.sim * sim
            + weights.recurrence * freq
            + weights.outcome * outcome
            + weights.corrections * corr
            + weights.recency * recency;
        let score =
            (base * (-config.decay_lambda_per_day * age_days).exp() - pii_penalty).clamp(0.0, 1.0);

        ScoreBreakdown {
            sim,
            freq,
            outcome,
            corr,
            recency,
            pii_penalty,
            score,
        }
    }

    /// Compute one item's score. Pure; sub-millisecond per call.
    pub fn compute(
        item: &DecryptedItem,
        profile: &UserProfile,
        config: &CrsConfig,
        now: chrono::DateTime<chrono::Utc>,
    ) -> f32 {
        Self::compute_breakdown(item, profile, config, now).score
    }

    /// Vectorized batch recomputation
    pub fn compute_batch(
        items: &[DecryptedItem],
        profile: &UserProfile,
        config: &CrsConfig,
        now: chrono::DateTime<chrono::Utc>,
    ) -> HashMap<Uuid, f32> {
        items
            .par_iter()
            .map(|item| (item.item.id, Self::compute(item, profile, config, now)))
            .collect()
    }
}

/// One planned tier movement
#[derive(Debug, Clone)]
pub struct PlannedTransition {
    /// The item to move
    pub item_id: Uuid,
    /// Tier it is in now
    pub from: Tier,
    /// Tier it should move to
    pub to: Tier,
    /// Score driving the decision
    pub score: f32,
    /// Why
    pub reason: TransitionReason,
}

/// The outcome of one evaluation pass
#[derive(Debug, Clone, Default)]
pub struct TransitionPlan {
    /// Upward movements
    pub promotions: Vec<PlannedTransition>,
    /// Downward movements
    pub demotions: Vec<PlannedTransition>,
}

impl CrsEngine {
    /// Evaluate tier transitions for a user's non-archived items given
    /// freshly computed scores.
    ///
    /// Rules:
    /// - SHORT → MID: score above threshold and enough accesses.
    /// - MID → LONG: score above threshold, old enough, outcome strong
    ///   enough.
    /// - Any tier → next lower: score under the demotion floor or idle past
    ///   the inactivity window; pinned items are exempt.
    ///
    /// Within each list, ties order by higher access count, then more
    /// recent last-used, then lexicographic id.
    pub fn evaluate_transitions(
        items: &[MemoryItem],
        scores: &HashMap<Uuid, f32>,
        thresholds: &TierThresholds,
        now: chrono::DateTime<chrono::Utc>,
    ) -> TransitionPlan {
        let mut plan = TransitionPlan::default();

        let mut ordered: Vec<&MemoryItem> = items
            .iter()
            .filter(|i| i.retrievable())
            .collect();
        ordered.sort_by(|a, b| {
            b.access_count
                .cmp(&a.access_count)
                .then(b.last_used_at.cmp(&a.last_used_at))
                .then(a.id.cmp(&b.id))
        });

        for item in ordered {
            let score = scores.get(&item.id).copied().unwrap_or(item.score);
            let age_days = (now - item.created_at).num_days();
            let idle_days = (now - item.last_used_at).num_days();
            let outcome = aggregate_outcomes(&item.outcomes);

            // Demotion takes precedence: a stale high-tier item should not
            // also be considered for promotion.
            let demotion_reason = if score < thresholds.demotion_score {
                Some(TransitionReason::CrsThreshold)
            } else if idle_days > thresholds.demotion_inactivity_days {
                Some(TransitionReason::Inactivity)
            } else {
                None
            };
            if let Some(reason) = demotion_reason {
                if !item.pinned {
                    if let Some(lower) = item.tier.demoted() {
                        plan.demotions.push(PlannedTransition {
                            item_id: item.id,
                            from: item.tier,
                            to: lower,
                            score,
                            reason,
                        });
                    }
                }
                continue;
            }

            match item.tier {
                Tier::Short => {
                    if score > thresholds.short_to_mid_score
                        && item.access_count >= thresholds.short_to_mid_uses
                    {
                        plan.promotions.push(PlannedTransition {
                            item_id: item.id,
                            from: Tier::Short,
                            to: Tier::Mid,
                            score,
                            reason: TransitionReason::CrsThreshold,
                        });
                    }
                }
                Tier::Mid => {
                    if score > thresholds.mid_to_long_score
                        && age_days >= thresholds.mid_to_long_age_days
                        && outcome >= thresholds.mid_to_long_outcome
                    {
                        plan.promotions.push(PlannedTransition {
                            item_id: item.id,
                            from: Tier::Mid,
                            to: Tier::Long,
                            score,
                            reason: TransitionReason::CrsThreshold,
                        });
                    }
                }
                Tier::Long => {}
            }
        }

        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::events::{OutcomeEvent, OutcomeKind};
    use crate::model::{PiiFlags, TopicId, SCHEMA_VERSION};
    use chrono::{Duration, Utc};

    fn make_item(topic: &str, access_count: u64, age_days: i64) -> DecryptedItem {
        let now = Utc::now();
        let created = now - Duration::days(age_days);
        DecryptedItem {
            item: MemoryItem {
                id: Uuid::new_v4(),
                user_id: "u1".to_string(),
                topic: TopicId::new(topic).unwrap(),
                content: vec![],
                vector: vec![],
                tier: Tier::Short,
                score: 0.0,
                promoted_at_score: None,
                created_at: created,
                updated_at: created,
                last_used_at: now,
                access_count,
                pii_flags: PiiFlags::none(),
                outcomes: Vec::new(),
                archived: false,
                archived_at: None,
                quarantined: false,
                pinned: false,
                source_items: None,
                key_id: format!("{topic}/v1"),
                embedding_backend: "test".to_string(),
                schema_version: SCHEMA_VERSION,
                record_version: 1,
            },
            text: String::new(),
            vector: vec![1.0, 0.0],
        }
    }

    fn profile() -> UserProfile {
        UserProfile::new("u1", CrsConfig::default())
    }

    #[test]
    fn test_score_in_unit_interval() {
        let config = CrsConfig::default();
        let item = make_item("work", 100, 0);
        let score = CrsEngine::compute(&item, &profile(), &config, Utc::now());
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn test_neutral_sim_for_small_topics() {
        let config = CrsConfig::default();
        let item = make_item("work", 0, 0);
        let breakdown =
            CrsEngine::compute_breakdown(&item, &profile(), &config, Utc::now());
        assert_eq!(breakdown.sim, 0.5);
    }

    #[test]
    fn test_established_centroid_drives_sim() {
        let config = CrsConfig::default();
        let mut profile = profile();
        let topic = TopicId::new("work").unwrap();
        for _ in 0..3 {
            profile.observe_item(&topic, &[1.0, 0.0]);
        }
        let item = make_item("work", 0, 0);
        let breakdown = CrsEngine::compute_breakdown(&item, &profile, &config, Utc::now());
        assert!((breakdown.sim - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_recurrence_soft_cap() {
        let config = CrsConfig::default();
        let now = Utc::now();
        let at_cap = make_item("work", 5, 0);
        let above_cap = make_item("work", 50, 0);
        let low = make_item("work", 1, 0);
        let b_cap = CrsEngine::compute_breakdown(&at_cap, &profile(), &config, now);
        let b_above = CrsEngine::compute_breakdown(&above_cap, &profile(), &config, now);
        let b_low = CrsEngine::compute_breakdown(&low, &profile(), &config, now);
        assert_eq!(b_cap.freq, 1.0);
        assert_eq!(b_above.freq, 1.0);
        assert!((b_low.freq - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_age_decay_lowers_score() {
        let config = CrsConfig::default();
        let now = Utc::now();
        let fresh = make_item("work", 3, 0);
        let old = make_item("work", 3, 60);
        let fresh_score = CrsEngine::compute(&fresh, &profile(), &config, now);
        let old_score = CrsEngine::compute(&old, &profile(), &config, now);
        assert!(fresh_score > old_score);
    }

    #[test]
    fn test_pii_penalty_applies_and_caps() {
        let config = CrsConfig::default();
        let now = Utc::now();
        let clean = make_item("work", 3, 0);
        let mut flagged = make_item("work", 3, 0);
        flagged.item.pii_flags.record("government_id", 1);
        flagged.item.pii_flags.record("credit_card", 1);
        flagged.item.pii_flags.record("email", 1);

        let clean_b = CrsEngine::compute_breakdown(&clean, &profile(), &config, now);
        let flagged_b = CrsEngine::compute_breakdown(&flagged, &profile(), &config, now);
        assert_eq!(clean_b.pii_penalty, 0.0);
        // 0.5 + 0.4 + 0.1 capped at 0.5
        assert_eq!(flagged_b.pii_penalty, 0.5);
        assert!(flagged_b.score <= clean_b.score);
    }

    #[test]
    fn test_batch_matches_single_and_is_deterministic() {
        let config = CrsConfig::default();
        let now = Utc::now();
        let items: Vec<DecryptedItem> = (0..20).map(|i| make_item("work", i, 2)).collect();
        let profile = profile();
        let first = CrsEngine::compute_batch(&items, &profile, &config, now);
        let second = CrsEngine::compute_batch(&items, &profile, &config, now);
        assert_eq!(first, second);
        for item in &items {
            let single = CrsEngine::compute(item, &profile, &config, now);
            assert_eq!(first[&item.item.id], single);
        }
    }

    #[test]
    fn test_short_to_mid_promotion_rules() {
        let thresholds = TierThresholds::default();
        let now = Utc::now();
        let qualified = make_item("work", 3, 1).item;
        let unqualified = make_item("work", 2, 1).item;
        let mut scores = HashMap::new();
        scores.insert(qualified.id, 0.7);
        scores.insert(unqualified.id, 0.7);

        let plan = CrsEngine::evaluate_transitions(
            &[qualified.clone(), unqualified],
            &scores,
            &thresholds,
            now,
        );
        assert_eq!(plan.promotions.len(), 1);
        assert_eq!(plan.promotions[0].item_id, qualified.id);
        assert_eq!(plan.promotions[0].to, Tier::Mid);
    }

    #[test]
    fn test_mid_to_long_requires_age_and_outcome() {
        let thresholds = TierThresholds::default();
        let now = Utc::now();

        let mut ready = make_item("work", 5, 8).item;
        ready.tier = Tier::Mid;
        for _ in 0..4 {
            ready.outcomes.push(OutcomeEvent::new(Uuid::new_v4(), OutcomeKind::ThumbsUp));
        }

        let mut too_young = make_item("work", 5, 2).item;
        too_young.tier = Tier::Mid;
        too_young
            .outcomes
            .push(OutcomeEvent::new(Uuid::new_v4(), OutcomeKind::ThumbsUp));

        let mut weak_outcome = make_item("work", 5, 8).item;
        weak_outcome.tier = Tier::Mid;
        weak_outcome
            .outcomes
            .push(OutcomeEvent::new(Uuid::new_v4(), OutcomeKind::ThumbsDown));

        let mut scores = HashMap::new();
        for item in [&ready, &too_young, &weak_outcome] {
            scores.insert(item.id, 0.85);
        }
        let plan = CrsEngine::evaluate_transitions(
            &[ready.clone(), too_young, weak_outcome],
            &scores,
            &thresholds,
            now,
        );
        assert_eq!(plan.promotions.len(), 1);
        assert_eq!(plan.promotions[0].item_id, ready.id);
        assert_eq!(plan.promotions[0].to, Tier::Long);
    }

    #[test]
    fn test_demotion_on_low_score_and_inactivity() {
        let thresholds = TierThresholds::default();
        let now = Utc::now();

        let mut low_score = make_item("work", 5, 10).item;
        low_score.tier = Tier::Mid;

        let mut stale = make_item("work", 5, 40).item;
        stale.tier = Tier::Long;
        stale.last_used_at = now - Duration::days(31);

        let mut pinned = make_item("work", 5, 10).item;
        pinned.tier = Tier::Mid;
        pinned.pinned = true;

        let mut scores = HashMap::new();
        scores.insert(low_score.id, 0.1);
        scores.insert(stale.id, 0.6);
        scores.insert(pinned.id, 0.1);

        let plan = CrsEngine::evaluate_transitions(
            &[low_score.clone(), stale.clone(), pinned],
            &scores,
            &thresholds,
            now,
        );
        assert_eq!(plan.demotions.len(), 2);
        let reasons: HashMap<Uuid, TransitionReason> = plan
            .demotions
            .iter()
            .map(|d| (d.item_id, d.reason))
            .collect();
        assert_eq!(reasons[&low_score.id], TransitionReason::CrsThreshold);
        assert_eq!(reasons[&stale.id], TransitionReason::Inactivity);
    }

    #[test]
    fn test_tie_break_ordering() {
        let thresholds = TierThresholds::default();
        let now = Utc::now();
        let mut a = make_item("work", 10, 1).item;
        let mut b = make_item("work", 3, 1).item;
        a.access_count = 10;
        b.access_count = 3;
        let mut scores = HashMap::new();
        scores.insert(a.id, 0.9);
        scores.insert(b.id, 0.9);

        let plan =
            CrsEngine::evaluate_transitions(&[b.clone(), a.clone()], &scores, &thresholds, now);
        assert_eq!(plan.promotions[0].item_id, a.id);
        assert_eq!(plan.promotions[1].item_id, b.id);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn score_always_in_unit_interval(
                access in 0u64..10_000,
                age in 0i64..3650,
                edit in 0.0f32..=1.0,
            ) {
                let config = CrsConfig::default();
                let mut item = make_item("work", access, age);
                item.item.outcomes.push(OutcomeEvent::new(
                    Uuid::new_v4(),
                    OutcomeKind::EditDistance(edit),
                ));
                let score = CrsEngine::compute(&item, &profile(), &config, Utc::now());
                prop_assert!((0.0..=1.0).contains(&score));
            }

            #[test]
            fn pii_never_raises_score(age in 0i64..365, access in 0u64..100) {
                let config = CrsConfig::default();
                let now = Utc::now();
                let clean = make_item("work", access, age);
                let mut flagged = make_item("work", access, age);
                flagged.item.id = clean.item.id;
                flagged.item.created_at = clean.item.created_at;
                flagged.item.pii_flags.record("government_id", 1);
                let clean_score = CrsEngine::compute(&clean, &profile(), &config, now);
                let flagged_score = CrsEngine::compute(&flagged, &profile(), &config, now);
                prop_assert!(flagged_score <= clean_score);
            }
        }
    }
}
