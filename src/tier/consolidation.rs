//! Promotion consolidation
//!
//! When several items are promoted together to the same tier for one user,
//! same-topic groups created around the same day are merged: a summary is
//! commissioned, embedded, and stored as one new item whose sources are
//! archived in the same commit. Groups of one are promoted in place.

use chrono::{NaiveDate, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEventBuilder, AuditLogger};
use crate::crs::PlannedTransition;
use crate::crypto::KeyManager;
use crate::deadline::{CancelToken, Deadline};
use crate::error::{CoreError, CoreResult};
use crate::llm::{Embedder, Summarizer};
use crate::model::{
    ConsolidationEvent, DecryptedItem, MemoryItem, PiiFlags, Tier, TopicId, TransitionReason,
    SCHEMA_VERSION,
};
use crate::store::backend::EventFamily;
use crate::store::HybridStore;

/// Token budget shared by one consolidation run's summaries; each group
/// receives its proportional share.
pub const CONSOLIDATION_SUMMARY_BUDGET: usize = 512;

/// Outcome of consolidating one user's promotions
#[derive(Debug, Default)]
pub struct ConsolidationReport {
    /// Items promoted in place (groups of one)
    pub promoted_in_place: usize,
    /// Consolidated items produced
    pub consolidated: Vec<Uuid>,
    /// Source items archived into consolidated items
    pub sources_archived: usize,
}

/// Groups promoted items and produces consolidated summaries
pub struct Consolidator {
    store: Arc<HybridStore>,
    keys: Arc<KeyManager>,
    embedder: Arc<dyn Embedder>,
    summarizer: Arc<dyn Summarizer>,
    audit: Arc<AuditLogger>,
}

impl Consolidator {
    /// Wire a consolidator over the store and model backends
    pub fn new(
        store: Arc<HybridStore>,
        keys: Arc<KeyManager>,
        embedder: Arc<dyn Embedder>,
        summarizer: Arc<dyn Summarizer>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            store,
            keys,
            embedder,
            summarizer,
            audit,
        }
    }

    /// Apply one user's promotions: group by `(topic, creation day)`,
    /// consolidate groups of two or more, promote singles in place.
    ///
    /// Skips groups whose sources are already archived (idempotent re-run
    /// after a partial failure).
    pub async fn run(
        &self,
        user_id: &str,
        promotions: &[PlannedTransition],
        deadline: Deadline,
        cancel: &CancelToken,
    ) -> CoreResult<ConsolidationReport> {
        let mut report = ConsolidationReport::default();

        // Load and bucket the promoted items
        let mut groups: BTreeMap<(TopicId, NaiveDate, Tier), Vec<DecryptedItem>> = BTreeMap::new();
        for promotion in promotions {
            cancel.check("consolidation grouping")?;
            let Some(item) = self.store.get(user_id, promotion.item_id)? else {
                continue;
            };
            if item.item.archived {
                continue;
            }
            groups
                .entry((
                    item.item.topic.clone(),
                    item.item.created_at.date_naive(),
                    promotion.to,
                ))
                .or_default()
                .push(item);
        }

        let total_items: usize = groups.values().map(Vec::len).sum();
        if total_items == 0 {
            return Ok(report);
        }

        for ((topic, _day, target_tier), group) in groups {
            cancel.check("consolidation")?;
            deadline.check("consolidation")?;

            if group.len() < 2 {
                for item in &group {
                    self.store.transition_tier(
                        user_id,
                        item.item.id,
                        target_tier,
                        TransitionReason::CrsThreshold,
                    )?;
                    report.promoted_in_place += 1;
                }
                continue;
            }

            let share = (CONSOLIDATION_SUMMARY_BUDGET * group.len() / total_items).max(32);
            let id = self
                .consolidate_group(user_id, &topic, target_tier, &group, share, deadline)
                .await?;
            report.sources_archived += group.len();
            report.consolidated.push(id);
        }

        Ok(report)
    }

    async fn consolidate_group(
        &self,
        user_id: &str,
        topic: &TopicId,
        target_tier: Tier,
        group: &[DecryptedItem],
        target_tokens: usize,
        deadline: Deadline,
    ) -> CoreResult<Uuid> {
        let started = Instant::now();
        let source_tier = group[0].item.tier;

        let texts: Vec<String> = group.iter().map(|i| i.text.clone()).collect();
        let summary = self
            .summarizer
            .summarize(&texts, "consolidation", target_tokens, deadline)
            .await?;

        let source_ids: Vec<Uuid> = group.iter().map(|i| i.item.id).collect();
        let footer = source_ids
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let text = format!("{summary}\n\nSources: {footer}");

        let vector = self.embedder.embed(&summary, deadline).await?;
        let (content_blob, key_id) = self.keys.encrypt(text.as_bytes(), user_id, topic)?;
        let vector_plain = bincode::serialize(&vector).map_err(CoreError::internal)?;
        let (vector_blob, _) = self.keys.encrypt(&vector_plain, user_id, topic)?;

        let mut pii_flags = PiiFlags::none();
        for item in group {
            pii_flags.merge(&item.item.pii_flags);
        }
        let score =
            group.iter().map(|i| i.item.score).sum::<f32>() / group.len() as f32;

        let now = Utc::now();
        let consolidated = MemoryItem {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            topic: topic.clone(),
            content: content_blob,
            vector: vector_blob,
            tier: target_tier,
            score: score.clamp(0.0, 1.0),
            promoted_at_score: Some(score.clamp(0.0, 1.0)),
            created_at: now,
            updated_at: now,
            last_used_at: now,
            access_count: 0,
            pii_flags,
            outcomes: Vec::new(),
            archived: false,
            archived_at: None,
            quarantined: false,
            pinned: false,
            source_items: Some(source_ids.clone()),
            key_id: key_id.encode(),
            embedding_backend: self.embedder.name().to_string(),
            schema_version: SCHEMA_VERSION,
            record_version: 1,
        };
        let consolidated_id = consolidated.id;

        self.store
            .commit_consolidation(consolidated, vector, &source_ids)?;

        let event = ConsolidationEvent {
            user_id: user_id.to_string(),
            topic: topic.clone(),
            source_tier,
            target_tier,
            source_count: source_ids.len(),
            produced: vec![consolidated_id],
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        };
        let payload = bincode::serialize(&event).map_err(CoreError::internal)?;
        self.store
            .backend()
            .append_event(EventFamily::Consolidation, user_id, &payload)?;
        self.audit
            .log(
                AuditEventBuilder::new(user_id, AuditAction::Consolidate)
                    .resource(consolidated_id)
                    .detail("topic", topic)
                    .detail("sources", source_ids.len())
                    .detail("target_tier", target_tier),
            )
            .map_err(CoreError::from)?;

        tracing::info!(
            user_id,
            topic = %topic,
            sources = source_ids.len(),
            consolidated = %consolidated_id,
            "consolidated promotion group"
        );
        Ok(consolidated_id)
    }
}
