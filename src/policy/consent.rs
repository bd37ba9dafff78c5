//! Consent registry
//!
//! Promotion of PII-flagged items to LONG requires a recorded consent token
//! covering the `(user, topic, pii kinds)` triple. Consents are persisted
//! through the store backend and never expire on their own; erasure of a
//! user removes them with everything else.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::model::TopicId;
use crate::store::backend::{ConsentRecord, StoreBackend};
use crate::store::StoreResult;

/// Registry of recorded promotion consents
pub struct ConsentRegistry {
    backend: Arc<dyn StoreBackend>,
}

impl ConsentRegistry {
    /// Create a registry over the backend
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self { backend }
    }

    /// Record consent for promoting items with the given PII kinds in a
    /// topic
    pub fn grant(&self, user_id: &str, topic: &TopicId, pii_kinds: &[String]) -> StoreResult<()> {
        let record = ConsentRecord {
            user_id: user_id.to_string(),
            topic: topic.clone(),
            pii_kinds: pii_kinds.to_vec(),
            granted_at: Utc::now(),
        };
        self.backend.put_consent(&record)?;
        tracing::info!(user_id, topic = %topic, kinds = ?pii_kinds, "consent recorded");
        Ok(())
    }

    /// PII kinds from `required` that no recorded consent covers.
    /// Empty result means the promotion may proceed.
    pub fn missing_kinds(
        &self,
        user_id: &str,
        topic: &TopicId,
        required: &[String],
    ) -> StoreResult<Vec<String>> {
        let consents = self.backend.consents_for(user_id, topic)?;
        let covered: BTreeSet<&String> =
            consents.iter().flat_map(|c| c.pii_kinds.iter()).collect();
        Ok(required
            .iter()
            .filter(|kind| !covered.contains(kind))
            .cloned()
            .collect())
    }
}
