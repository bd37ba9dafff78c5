//! Compliance-mode filtering
//!
//! When a request runs in compliance mode, retrieval is constrained to a
//! single topic: items from other topics must not appear in candidate sets,
//! rankings, or summaries. Every filtering decision is audit-logged with
//! original and surviving counts.

use std::sync::Arc;

use crate::audit::{AuditAction, AuditEventBuilder, AuditLogger};
use crate::model::{DecryptedItem, TopicId};
use crate::store::StoreResult;

/// PII kinds that are never allowed into a query bundle, regardless of
/// consent. Consent gates tier promotion; bundles are an exfiltration
/// surface and stay conservative.
pub const BUNDLE_BLOCKED_PII: &[&str] = &[
    super::pii::kinds::GOVERNMENT_ID,
    super::pii::kinds::CREDIT_CARD,
];

/// Applies and audits compliance-mode decisions
pub struct ComplianceGuard {
    audit: Arc<AuditLogger>,
}

impl ComplianceGuard {
    /// Create a guard writing to the given audit trail
    pub fn new(audit: Arc<AuditLogger>) -> Self {
        Self { audit }
    }

    /// Restrict candidates to `topic` and log the decision.
    ///
    /// Returns the surviving candidates. Call only when compliance mode is
    /// active for the request.
    pub fn filter_topic(
        &self,
        user_id: &str,
        topic: &TopicId,
        candidates: Vec<(DecryptedItem, f32)>,
    ) -> StoreResult<Vec<(DecryptedItem, f32)>> {
        let original = candidates.len();
        let kept: Vec<(DecryptedItem, f32)> = candidates
            .into_iter()
            .filter(|(item, _)| item.item.topic == *topic)
            .collect();

        self.audit.log(
            AuditEventBuilder::new(user_id, AuditAction::PolicyFilter)
                .detail("filter", "compliance_topic")
                .detail("topic", topic)
                .detail("original", original)
                .detail("filtered", kept.len()),
        )?;
        tracing::debug!(
            user_id,
            topic = %topic,
            original,
            kept = kept.len(),
            "compliance topic filter"
        );
        Ok(kept)
    }

    /// Drop candidates whose PII flags are not permitted in a bundle and
    /// log when anything was dropped.
    pub fn filter_bundle_pii(
        &self,
        user_id: &str,
        candidates: Vec<(DecryptedItem, f32)>,
    ) -> StoreResult<Vec<(DecryptedItem, f32)>> {
        let original = candidates.len();
        let kept: Vec<(DecryptedItem, f32)> = candidates
            .into_iter()
            .filter(|(item, _)| {
                !BUNDLE_BLOCKED_PII
                    .iter()
                    .any(|kind| item.item.pii_flags.count(kind) > 0)
            })
            .collect();

        if kept.len() != original {
            self.audit.log(
                AuditEventBuilder::new(user_id, AuditAction::PolicyFilter)
                    .detail("filter", "bundle_pii")
                    .detail("original", original)
                    .detail("filtered", kept.len()),
            )?;
        }
        Ok(kept)
    }
}
