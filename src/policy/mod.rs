//! # Policy engine
//!
//! PII detection, compliance-mode filtering, tier-promotion gating, and the
//! export/erasure surfaces. The policy engine sits between the store and
//! everything that moves data: ingest scans content, retrieval filters
//! candidates, and promotion to LONG of PII-flagged items is gated on
//! recorded consent.

pub mod compliance;
pub mod consent;
pub mod export;
pub mod pii;

pub use compliance::{ComplianceGuard, BUNDLE_BLOCKED_PII};
pub use consent::ConsentRegistry;
pub use export::{ecies_open, ecies_seal, ExportBundle, ExportedItem, ExportedProfile};
pub use pii::{risk_score, scan_text, PiiScan};

use std::sync::Arc;

use crate::audit::{AuditAction, AuditEventBuilder, AuditLogger};
use crate::error::{CoreError, CoreResult};
use crate::model::{MemoryItem, Tier};
use crate::store::backend::StoreBackend;

/// Policy engine facade
pub struct PolicyEngine {
    consents: ConsentRegistry,
    compliance: ComplianceGuard,
    audit: Arc<AuditLogger>,
}

impl PolicyEngine {
    /// Create the engine over the store backend and audit trail
    pub fn new(backend: Arc<dyn StoreBackend>, audit: Arc<AuditLogger>) -> Self {
        Self {
            consents: ConsentRegistry::new(backend),
            compliance: ComplianceGuard::new(audit.clone()),
            audit,
        }
    }

    /// Scan a text for PII
    pub fn scan(&self, text: &str) -> PiiScan {
        pii::scan_text(text)
    }

    /// The consent registry
    pub fn consents(&self) -> &ConsentRegistry {
        &self.consents
    }

    /// The compliance guard
    pub fn compliance(&self) -> &ComplianceGuard {
        &self.compliance
    }

    /// Gate a tier promotion. Promotion to LONG of a PII-flagged item
    /// requires recorded consent for every flagged kind; a denial is
    /// audit-logged and surfaces the missing kinds.
    pub fn gate_promotion(&self, item: &MemoryItem, to: Tier) -> CoreResult<()> {
        if to != Tier::Long || item.pii_flags.is_empty() {
            return Ok(());
        }
        let required = item.pii_flags.kinds();
        let missing = self
            .consents
            .missing_kinds(&item.user_id, &item.topic, &required)
            .map_err(CoreError::from)?;
        if missing.is_empty() {
            return Ok(());
        }

        self.audit
            .log(
                AuditEventBuilder::new(&item.user_id, AuditAction::PolicyFilter)
                    .resource(item.id)
                    .detail("filter", "pii_consent_required")
                    .detail("kinds", missing.join(",")),
            )
            .map_err(CoreError::from)?;
        Err(CoreError::PiiConsentRequired { kinds: missing })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PiiFlags, TopicId, SCHEMA_VERSION};
    use crate::store::backend::MemoryBackend;
    use chrono::Utc;
    use uuid::Uuid;

    fn engine() -> (Arc<dyn StoreBackend>, PolicyEngine) {
        let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
        let audit = Arc::new(AuditLogger::new(backend.clone()));
        (backend.clone(), PolicyEngine::new(backend, audit))
    }

    fn flagged_item() -> MemoryItem {
        let now = Utc::now();
        let mut pii_flags = PiiFlags::none();
        pii_flags.record(pii::kinds::EMAIL, 1);
        pii_flags.record(pii::kinds::GOVERNMENT_ID, 1);
        MemoryItem {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            topic: TopicId::new("work").unwrap(),
            content: vec![],
            vector: vec![],
            tier: Tier::Mid,
            score: 0.85,
            promoted_at_score: None,
            created_at: now,
            updated_at: now,
            last_used_at: now,
            access_count: 5,
            pii_flags,
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
        }
    }

    #[test]
    fn test_promotion_to_long_without_consent_denied() {
        let (_, engine) = engine();
        let item = flagged_item();
        let err = engine.gate_promotion(&item, Tier::Long).unwrap_err();
        match err {
            CoreError::PiiConsentRequired { kinds } => {
                assert_eq!(
                    kinds,
                    vec!["email".to_string(), "government_id".to_string()]
                );
            }
            other => panic!("expected consent error, got {other:?}"),
        }
    }

    #[test]
    fn test_denial_is_audited() {
        let (backend, engine) = engine();
        let item = flagged_item();
        let _ = engine.gate_promotion(&item, Tier::Long);
        let audit = AuditLogger::new(backend);
        let events = audit.events_for("u1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metadata["filter"], "pii_consent_required");
    }

    #[test]
    fn test_promotion_allowed_with_full_consent() {
        let (_, engine) = engine();
        let item = flagged_item();
        engine
            .consents()
            .grant(
                "u1",
                &item.topic,
                &["email".to_string(), "government_id".to_string()],
            )
            .unwrap();
        engine.gate_promotion(&item, Tier::Long).unwrap();
    }

    #[test]
    fn test_clean_items_and_lower_tiers_pass() {
        let (_, engine) = engine();
        let mut clean = flagged_item();
        clean.pii_flags = PiiFlags::none();
        engine.gate_promotion(&clean, Tier::Long).unwrap();

        // PII-flagged but only promoting to MID
        let flagged = flagged_item();
        engine.gate_promotion(&flagged, Tier::Mid).unwrap();
    }
}
