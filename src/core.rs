//! # Memory core
//!
//! [`MemoryCore`] owns every component — key manager, hybrid store, CRS
//! engine, policy engine, tier manager, rehydration pipeline, outcome
//! logger — and wires the write and read paths across them. There is no
//! global state: tests instantiate fresh cores.
//!
//! Per-user mutations (ingest, edit, tier transitions, consolidation,
//! erasure) serialize through a per-user async lock; reads never take it.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEventBuilder, AuditLogger};
use crate::config::CoreConfig;
use crate::crs::{CrsEngine, PlannedTransition, TransitionPlan};
use crate::crypto::{HardwareBackend, KeyManager};
use crate::deadline::{CancelToken, Deadline};
use crate::error::{CoreError, CoreResult};
use crate::llm::{Embedder, Summarizer};
use crate::model::{
    DecryptedItem, MemoryItem, OutcomeKind, Tier, TopicId, UserProfile, SCHEMA_VERSION,
};
use crate::outcome::OutcomeLogger;
use crate::policy::export::{ExportBundle, ExportedItem, ExportedProfile};
use crate::policy::PolicyEngine;
use crate::rehydrate::{ContextBundle, Intent, RehydrateRequest, Rehydrator};
use crate::sched::MaintenanceTarget;
use crate::store::backend::StoreBackend;
use crate::store::{HybridStore, ListFilter, ListOrder};
use crate::tier::{Consolidator, RetentionSweeper, TierManager};

/// Maximum ingest text length in characters
pub const MAX_INGEST_CHARS: usize = 50_000;

/// Maximum query text length in characters
pub const MAX_QUERY_CHARS: usize = 10_000;

/// Receipt for a newly ingested item
#[derive(Debug, Clone)]
pub struct IngestReceipt {
    /// Assigned item id
    pub item_id: Uuid,
    /// Initial tier (always SHORT)
    pub tier: Tier,
    /// Initial retention score
    pub score: f32,
    /// Detected PII kinds, surfaced so callers can prompt for consent
    pub pii_kinds: Vec<String>,
}

/// A produced export, sealed to the user's public key
pub struct ExportHandle {
    /// Export id (also inside the bundle metadata)
    pub export_id: Uuid,
    /// The sealed bundle bytes
    pub sealed: Vec<u8>,
    /// When the handle stops being served
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Result of an erasure request
#[derive(Debug, Clone)]
pub struct DeletionReport {
    /// Deletion handle for polling/audit cross-reference
    pub handle: Uuid,
    /// Items physically removed
    pub items_erased: usize,
    /// Topics whose keys were destroyed
    pub topics_destroyed: usize,
}

/// The assembled memory engine
pub struct MemoryCore {
    config: CoreConfig,
    backend: Arc<dyn StoreBackend>,
    keys: Arc<KeyManager>,
    store: Arc<HybridStore>,
    audit: Arc<AuditLogger>,
    policy: Arc<PolicyEngine>,
    embedder: Arc<dyn Embedder>,
    rehydrator: Arc<Rehydrator>,
    outcomes: Arc<OutcomeLogger>,
    tiers: TierManager,
    sweeper: RetentionSweeper,
    user_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Promotions queued by tier evaluation, consumed by consolidation
    pending_promotions: DashMap<String, Vec<PlannedTransition>>,
}

impl MemoryCore {
    /// Assemble a core from its pluggable backends
    pub fn new(
        config: CoreConfig,
        store_backend: Arc<dyn StoreBackend>,
        crypto_backend: Arc<dyn HardwareBackend>,
        embedder: Arc<dyn Embedder>,
        summarizer: Arc<dyn Summarizer>,
    ) -> CoreResult<Arc<Self>> {
        config.validate()?;
        if embedder.dimension() != config.embedding_dimension {
            return Err(CoreError::Validation(format!(
                "embedder dimension {} does not match configured {}",
                embedder.dimension(),
                config.embedding_dimension
            )));
        }

        let keys = Arc::new(KeyManager::new(crypto_backend));
        let audit = Arc::new(AuditLogger::new(store_backend.clone()));
        let store = Arc::new(HybridStore::open(
            store_backend.clone(),
            keys.clone(),
            audit.clone(),
        )?);
        let policy = Arc::new(PolicyEngine::new(store_backend.clone(), audit.clone()));
        let outcomes = Arc::new(OutcomeLogger::new(store.clone(), config.crs.outcome_log_cap));
        let rehydrator = Arc::new(Rehydrator::new(
            store.clone(),
            embedder.clone(),
            summarizer.clone(),
            policy.clone(),
            outcomes.clone(),
            config.retrieval.clone(),
            config.rehydration.clone(),
        ));
        let consolidator = Arc::new(Consolidator::new(
            store.clone(),
            keys.clone(),
            embedder.clone(),
            summarizer.clone(),
            audit.clone(),
        ));
        let tiers = TierManager::new(store.clone(), policy.clone(), consolidator);
        let sweeper = RetentionSweeper::new(store.clone(), config.retention);

        Ok(Arc::new(Self {
            config,
            backend: store_backend,
            keys,
            store,
            audit,
            policy,
            embedder,
            rehydrator,
            outcomes,
            tiers,
            sweeper,
            user_locks: DashMap::new(),
            pending_promotions: DashMap::new(),
        }))
    }

    /// The effective configuration
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// The audit trail
    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    /// The policy engine (consent grants come through here)
    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    /// The hybrid store (read-side inspection in tests and tools)
    pub fn store(&self) -> &Arc<HybridStore> {
        &self.store
    }

    /// The key manager (seeding and inspection in tests and tools)
    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    fn user_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.user_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn load_profile(&self, user_id: &str) -> CoreResult<UserProfile> {
        Ok(self
            .backend
            .get_profile(user_id)?
            .unwrap_or_else(|| UserProfile::new(user_id, self.config.crs.clone())))
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Ingest a text artifact: PII scan, embed, encrypt, index, score.
    pub async fn ingest(
        &self,
        user_id: &str,
        topic: &str,
        text: &str,
        deadline: Deadline,
    ) -> CoreResult<IngestReceipt> {
        let topic = TopicId::new(topic)?;
        if text.is_empty() || text.len() > MAX_INGEST_CHARS {
            return Err(CoreError::Validation(format!(
                "text must be 1-{MAX_INGEST_CHARS} characters"
            )));
        }

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let scan = self.policy.scan(text);
        let vector = deadline
            .bound("ingest embedding", self.embedder.embed(text, deadline))
            .await??;

        let (content_blob, key_id) = self.keys.encrypt(text.as_bytes(), user_id, &topic)?;
        let vector_plain = bincode::serialize(&vector).map_err(CoreError::internal)?;
        let (vector_blob, _) = self.keys.encrypt(&vector_plain, user_id, &topic)?;

        let now = Utc::now();
        let mut item = MemoryItem {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            topic: topic.clone(),
            content: content_blob,
            vector: vector_blob,
            tier: Tier::Short,
            score: 0.0,
            promoted_at_score: None,
            created_at: now,
            updated_at: now,
            last_used_at: now,
            access_count: 0,
            pii_flags: scan.flags.clone(),
            outcomes: Vec::new(),
            archived: false,
            archived_at: None,
            quarantined: false,
            pinned: false,
            source_items: None,
            key_id: key_id.encode(),
            embedding_backend: self.embedder.name().to_string(),
            schema_version: SCHEMA_VERSION,
            record_version: 1,
        };

        let mut profile = self.load_profile(user_id)?;
        let scored = DecryptedItem {
            item: item.clone(),
            text: text.to_string(),
            vector: vector.clone(),
        };
        item.score = CrsEngine::compute(&scored, &profile, &profile.crs, now);

        let item_id = self.store.insert(item, vector.clone())?;
        profile.observe_item(&topic, &vector);
        self.backend.put_profile(&profile)?;

        let mut builder = AuditEventBuilder::new(user_id, AuditAction::Write)
            .resource(item_id)
            .detail("operation", "ingest")
            .detail("topic", &topic);
        if !scan.is_clean() {
            builder = builder
                .detail("pii_kinds", scan.flags.kinds().join(","))
                .detail("pii_risk", format!("{:.2}", scan.risk_score));
        }
        self.audit.log(builder)?;

        let receipt = IngestReceipt {
            item_id,
            tier: Tier::Short,
            score: self.store.get_raw(user_id, item_id)?.map(|i| i.score).unwrap_or(0.0),
            pii_kinds: scan.flags.kinds(),
        };
        tracing::info!(user_id, item_id = %item_id, topic = %topic, "ingested");
        Ok(receipt)
    }

    /// Edit an item's text. Re-scans PII (flags merge; never cleared),
    /// re-embeds, and re-encrypts under the topic's current key version.
    pub async fn edit_memory(
        &self,
        user_id: &str,
        item_id: Uuid,
        new_text: &str,
        deadline: Deadline,
    ) -> CoreResult<DecryptedItem> {
        if new_text.is_empty() || new_text.len() > MAX_INGEST_CHARS {
            return Err(CoreError::Validation(format!(
                "text must be 1-{MAX_INGEST_CHARS} characters"
            )));
        }
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let existing = self.fetch_live(user_id, item_id)?;
        let topic = existing.item.topic.clone();

        let scan = self.policy.scan(new_text);
        let vector = deadline
            .bound("edit embedding", self.embedder.embed(new_text, deadline))
            .await??;

        let (content_blob, key_id) = self.keys.encrypt(new_text.as_bytes(), user_id, &topic)?;
        let vector_plain = bincode::serialize(&vector).map_err(CoreError::internal)?;
        let (vector_blob, _) = self.keys.encrypt(&vector_plain, user_id, &topic)?;

        self.store.update_content(
            user_id,
            item_id,
            content_blob,
            vector_blob,
            key_id.encode(),
            vector.clone(),
            &scan.flags,
        )?;

        let mut profile = self.load_profile(user_id)?;
        profile.forget_item(&topic, &existing.vector);
        profile.observe_item(&topic, &vector);
        self.backend.put_profile(&profile)?;

        self.rehydrator.invalidate_item(item_id);
        self.audit.log(
            AuditEventBuilder::new(user_id, AuditAction::Write)
                .resource(item_id)
                .detail("operation", "edit"),
        )?;
        self.fetch_live(user_id, item_id)
    }

    /// Pin or unpin an item (pinned items are exempt from demotion)
    pub async fn pin_memory(
        &self,
        user_id: &str,
        item_id: Uuid,
        pinned: bool,
    ) -> CoreResult<DecryptedItem> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        self.fetch_live(user_id, item_id)?;
        self.store.mutate(user_id, item_id, |item| {
            item.pinned = pinned;
        })?;
        self.rehydrator.invalidate_item(item_id);
        self.audit.log(
            AuditEventBuilder::new(user_id, AuditAction::Write)
                .resource(item_id)
                .detail("operation", "pin")
                .detail("pinned", pinned),
        )?;
        self.fetch_live(user_id, item_id)
    }

    /// Soft-delete an item (archived immediately, purged after the
    /// retention window)
    pub async fn delete_memory(&self, user_id: &str, item_id: Uuid) -> CoreResult<()> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        let existing = self.fetch_live(user_id, item_id)?;
        self.store.archive(user_id, &[item_id])?;

        let mut profile = self.load_profile(user_id)?;
        profile.forget_item(&existing.item.topic, &existing.vector);
        self.backend.put_profile(&profile)?;

        self.rehydrator.invalidate_item(item_id);
        self.audit.log(
            AuditEventBuilder::new(user_id, AuditAction::Delete)
                .resource(item_id)
                .detail("operation", "archive"),
        )?;
        Ok(())
    }

    // ========================================================================
    // Read path
    // ========================================================================

    fn fetch_live(&self, user_id: &str, item_id: Uuid) -> CoreResult<DecryptedItem> {
        let item = self
            .store
            .get(user_id, item_id)?
            .ok_or_else(|| CoreError::NotFound(format!("item {item_id}")))?;
        if item.item.archived {
            return Err(CoreError::NotFound(format!("item {item_id}")));
        }
        Ok(item)
    }

    /// Fetch one item (decrypted). Archived items are not served here.
    pub fn get_memory(&self, user_id: &str, item_id: Uuid) -> CoreResult<DecryptedItem> {
        let item = self.fetch_live(user_id, item_id)?;
        self.audit.log(
            AuditEventBuilder::new(user_id, AuditAction::Read).resource(item_id),
        )?;
        Ok(item)
    }

    /// Ordered page of a user's items
    pub fn list_memories(
        &self,
        user_id: &str,
        topic: Option<&str>,
        tier: Option<Tier>,
        offset: usize,
        limit: usize,
    ) -> CoreResult<(Vec<DecryptedItem>, usize)> {
        let filter = ListFilter {
            topic: topic.map(TopicId::new).transpose()?,
            tier,
            include_archived: false,
        };
        Ok(self
            .store
            .list(user_id, &filter, ListOrder::ScoreDesc, offset, limit)?)
    }

    /// Produce a context bundle for a query
    pub async fn query(
        &self,
        user_id: &str,
        query: &str,
        topic: &str,
        intent: Option<Intent>,
        token_budget: usize,
        compliance_mode: Option<bool>,
        deadline: Deadline,
        cancel: CancelToken,
    ) -> CoreResult<ContextBundle> {
        // The wire minimum (1 char) is the adapter's concern; the core
        // tolerates empty queries and answers them with an empty bundle.
        if query.len() > MAX_QUERY_CHARS {
            return Err(CoreError::Validation(format!(
                "query must be at most {MAX_QUERY_CHARS} characters"
            )));
        }
        let request = RehydrateRequest {
            user_id: user_id.to_string(),
            query: query.to_string(),
            topic: TopicId::new(topic)?,
            intent,
            token_budget,
            compliance_mode: compliance_mode.unwrap_or(self.config.compliance_mode_default),
            deadline,
            cancel,
        };
        self.rehydrator.rehydrate(request).await
    }

    /// Record an outcome for a past query and invalidate cached bundles
    /// containing the affected items
    pub fn record_outcome(
        &self,
        user_id: &str,
        query_id: Uuid,
        kind: OutcomeKind,
    ) -> CoreResult<usize> {
        let touched = self.outcomes.record(user_id, query_id, kind)?;
        if let Some(record) = self.backend.get_query_log(user_id, query_id)? {
            for item_id in record.item_ids {
                self.rehydrator.invalidate_item(item_id);
            }
        }
        Ok(touched)
    }

    // ========================================================================
    // Export / erasure
    // ========================================================================

    /// Produce an export bundle sealed to the user's registered public key
    pub async fn export_memory(
        &self,
        user_id: &str,
        topic: Option<&str>,
        public_key: &[u8; 32],
    ) -> CoreResult<ExportHandle> {
        let topic = topic.map(TopicId::new).transpose()?;
        let account_created = self
            .backend
            .get_user(user_id)?
            .map(|a| a.created_at)
            .unwrap_or_else(Utc::now);

        let mut items = Vec::new();
        for raw in self.store.scan_raw(user_id)? {
            if raw.quarantined {
                continue;
            }
            if let Some(topic) = &topic {
                if raw.topic != *topic {
                    continue;
                }
            }
            // Archived items remain export-visible until purged
            match self.store.get(user_id, raw.id) {
                Ok(Some(decrypted)) => items.push(ExportedItem {
                    id: decrypted.item.id,
                    topic: decrypted.item.topic.clone(),
                    text: decrypted.text.clone(),
                    vector: decrypted.vector.clone(),
                    tier: decrypted.item.tier,
                    score: decrypted.item.score,
                    created_at: decrypted.item.created_at,
                    updated_at: decrypted.item.updated_at,
                    last_used_at: decrypted.item.last_used_at,
                    access_count: decrypted.item.access_count,
                    pii_flags: decrypted.item.pii_flags.clone(),
                    outcomes: decrypted.item.outcomes.clone(),
                    pinned: decrypted.item.pinned,
                    archived: decrypted.item.archived,
                    source_items: decrypted.item.source_items.clone(),
                    embedding_backend: decrypted.item.embedding_backend.clone(),
                }),
                Ok(None) => {}
                Err(_) => continue,
            }
        }

        let profile = self.load_profile(user_id)?;
        let bundle = ExportBundle::new(
            user_id,
            ExportedProfile {
                user_id: user_id.to_string(),
                created_at: account_created,
                crs: profile.crs.clone(),
            },
            items,
            self.audit.events_for(user_id)?,
        );
        let sealed = bundle.seal(public_key)?;
        let export_id = bundle.metadata.export_id;

        self.audit.log(
            AuditEventBuilder::new(user_id, AuditAction::Export)
                .resource(export_id)
                .detail("items", bundle.items.len())
                .detail("topic", topic.as_ref().map(|t| t.as_str()).unwrap_or("*")),
        )?;

        Ok(ExportHandle {
            export_id,
            sealed,
            expires_at: Utc::now() + chrono::Duration::hours(24),
        })
    }

    /// Re-ingest an opened export bundle for a user. Items keep their ids,
    /// tiers, scores, timestamps, and logs; encryption is fresh under the
    /// importing user's keys.
    pub async fn import_bundle(&self, user_id: &str, bundle: &ExportBundle) -> CoreResult<usize> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut profile = self.load_profile(user_id)?;
        let mut imported = 0;
        for exported in &bundle.items {
            let (content_blob, key_id) =
                self.keys
                    .encrypt(exported.text.as_bytes(), user_id, &exported.topic)?;
            let vector_plain =
                bincode::serialize(&exported.vector).map_err(CoreError::internal)?;
            let (vector_blob, _) = self.keys.encrypt(&vector_plain, user_id, &exported.topic)?;

            let item = MemoryItem {
                id: exported.id,
                user_id: user_id.to_string(),
                topic: exported.topic.clone(),
                content: content_blob,
                vector: vector_blob,
                tier: exported.tier,
                score: exported.score,
                promoted_at_score: None,
                created_at: exported.created_at,
                updated_at: exported.updated_at,
                last_used_at: exported.last_used_at,
                access_count: exported.access_count,
                pii_flags: exported.pii_flags.clone(),
                outcomes: exported.outcomes.clone(),
                archived: exported.archived,
                archived_at: exported.archived.then(Utc::now),
                quarantined: false,
                pinned: exported.pinned,
                source_items: exported.source_items.clone(),
                key_id: key_id.encode(),
                embedding_backend: exported.embedding_backend.clone(),
                schema_version: SCHEMA_VERSION,
                record_version: 1,
            };
            self.store.insert(item, exported.vector.clone())?;
            if !exported.archived {
                profile.observe_item(&exported.topic, &exported.vector);
            }
            imported += 1;
        }
        self.backend.put_profile(&profile)?;
        tracing::info!(user_id, imported, "bundle imported");
        Ok(imported)
    }

    /// Irreversibly erase a user's memory, optionally scoped to one topic.
    /// Matching items are removed, their topics' keys destroyed, and a
    /// deletion event (with counts only) is left in the audit trail.
    pub async fn delete_all_memory(
        &self,
        user_id: &str,
        topic: Option<&str>,
    ) -> CoreResult<DeletionReport> {
        let topic = topic.map(TopicId::new).transpose()?;
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let all = self.store.scan_raw(user_id)?;
        let matching: Vec<&MemoryItem> = all
            .iter()
            .filter(|item| topic.as_ref().map(|t| item.topic == *t).unwrap_or(true))
            .collect();
        let ids: Vec<Uuid> = matching.iter().map(|i| i.id).collect();
        let mut topics: Vec<TopicId> = matching.iter().map(|i| i.topic.clone()).collect();
        topics.sort();
        topics.dedup();

        // Full erasure also destroys keys for topics that no longer have
        // any live items
        if topic.is_none() {
            for (user, keyed_topic) in self.keys.keyed_topics()? {
                if user == user_id && !topics.contains(&keyed_topic) {
                    topics.push(keyed_topic);
                }
            }
        }

        let items_erased = self.store.erase_items(user_id, &ids)?;
        for t in &topics {
            self.keys.destroy_topic_keys(user_id, t)?;
        }

        // Profile: forget the erased topics (full erasure drops the rest of
        // the user's records too)
        match &topic {
            Some(t) => {
                let mut profile = self.load_profile(user_id)?;
                profile.centroids.remove(t);
                profile.updated_at = Utc::now();
                self.backend.put_profile(&profile)?;
            }
            None => {
                self.store.erase_user(user_id)?;
            }
        }

        self.rehydrator.invalidate_all();
        let handle = Uuid::new_v4();
        self.audit.log(
            AuditEventBuilder::new(user_id, AuditAction::Delete)
                .resource(handle)
                .detail("operation", "erasure")
                .detail("items", items_erased)
                .detail("topics", topics.len()),
        )?;
        tracing::info!(user_id, items_erased, topics = topics.len(), "erasure complete");

        Ok(DeletionReport {
            handle,
            items_erased,
            topics_destroyed: topics.len(),
        })
    }

    // ========================================================================
    // Maintenance internals (driven by the scheduler)
    // ========================================================================

    fn decrypted_live_items(&self, user_id: &str) -> CoreResult<Vec<DecryptedItem>> {
        let mut items = Vec::new();
        for raw in self.store.scan_raw(user_id)? {
            if !raw.retrievable() {
                continue;
            }
            match self.store.get(user_id, raw.id) {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {}
                // Quarantine already handled inside get
                Err(_) => continue,
            }
        }
        Ok(items)
    }
}

#[async_trait::async_trait]
impl MaintenanceTarget for MemoryCore {
    fn user_ids(&self) -> CoreResult<Vec<String>> {
        Ok(self.backend.item_user_ids()?)
    }

    async fn recompute_user(&self, user_id: &str, cancel: &CancelToken) -> CoreResult<usize> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        cancel.check("crs recompute")?;

        let items = self.decrypted_live_items(user_id)?;
        if items.is_empty() {
            return Ok(0);
        }
        let profile = self.load_profile(user_id)?;
        let scores = CrsEngine::compute_batch(&items, &profile, &profile.crs, Utc::now());

        let mut updated = 0;
        for item in &items {
            cancel.check("crs recompute")?;
            let new_score = scores[&item.item.id];
            // Skip float-dust deltas so idempotent re-runs rewrite nothing
            if (new_score - item.item.score).abs() > 1e-4 {
                self.store.update_score(user_id, item.item.id, new_score)?;
                updated += 1;
            }
        }

        // One summary audit event per batch recomputation
        self.audit.log(
            AuditEventBuilder::new(user_id, AuditAction::Write)
                .detail("operation", "crs_batch_recompute")
                .detail("items", items.len())
                .detail("updated", updated),
        )?;
        Ok(updated)
    }

    async fn evaluate_user(&self, user_id: &str, cancel: &CancelToken) -> CoreResult<usize> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        cancel.check("tier evaluation")?;

        let items = self.store.scan_raw(user_id)?;
        let scores = items.iter().map(|i| (i.id, i.score)).collect();
        let plan =
            CrsEngine::evaluate_transitions(&items, &scores, &self.config.tiers, Utc::now());

        let mut applied = 0;
        for demotion in &plan.demotions {
            cancel.check("tier evaluation")?;
            self.store
                .transition_tier(user_id, demotion.item_id, demotion.to, demotion.reason)?;
            self.rehydrator.invalidate_item(demotion.item_id);
            applied += 1;
        }

        let planned = plan.promotions.len();
        if planned > 0 {
            self.pending_promotions
                .entry(user_id.to_string())
                .or_default()
                .extend(plan.promotions);
        }
        Ok(applied + planned)
    }

    async fn consolidate_user(
        &self,
        user_id: &str,
        deadline: Deadline,
        cancel: &CancelToken,
    ) -> CoreResult<usize> {
        let Some((_, promotions)) = self.pending_promotions.remove(user_id) else {
            return Ok(0);
        };
        if promotions.is_empty() {
            return Ok(0);
        }
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let item_ids: Vec<Uuid> = promotions.iter().map(|p| p.item_id).collect();
        let plan = TransitionPlan {
            promotions,
            demotions: Vec::new(),
        };
        let report = self.tiers.apply(user_id, plan, deadline, cancel).await?;
        for item_id in item_ids {
            self.rehydrator.invalidate_item(item_id);
        }
        Ok(report.consolidation.promoted_in_place
            + report.consolidation.sources_archived
            + report.demoted)
    }

    async fn rotate_keys(&self, cancel: &CancelToken) -> CoreResult<usize> {
        let mut rotated = 0;
        for (user_id, topic) in self.keys.keyed_topics()? {
            cancel.check("key rotation")?;
            let version = self.keys.rotate_topic(&user_id, &topic)?;
            self.audit.log(
                AuditEventBuilder::new(&user_id, AuditAction::Rotate)
                    .resource(&topic)
                    .detail("version", version),
            )?;
            rotated += 1;
        }
        Ok(rotated)
    }

    async fn purge_user(&self, user_id: &str, cancel: &CancelToken) -> CoreResult<usize> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        self.sweeper.purge_user(user_id, Utc::now(), cancel)
    }
}
