//! # Hybrid store
//!
//! Encrypted record storage with a keyed metadata index, a vector index
//! over decrypted embeddings, and append-only event logs. Semantically a
//! mapping from `(user_id, item_id)` to a memory item.
//!
//! Reads see a consistent snapshot of a single item; writes to a single
//! item are serialized by the owning core's per-user lock and stamped with a
//! monotonically increasing record version. Consolidations commit the
//! archived sources and the consolidated item together; the consolidated
//! item only becomes retrievable after its sources stop being so.

pub mod backend;
pub mod metadata;
pub mod vector;

pub use backend::{ConsentRecord, EventFamily, MemoryBackend, SledBackend, StoreBackend, UserAccount};
pub use metadata::{ListFilter, ListOrder, ListPage, MetadataIndex};
pub use vector::{SearchFilter, SearchHit, VectorIndex};

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEventBuilder, AuditLogger};
use crate::crypto::{CryptoError, KeyId, KeyManager};
use crate::error::CoreError;
use crate::model::{
    DecryptedItem, MemoryItem, Tier, TierTransitionEvent, TransitionReason, SCHEMA_VERSION,
};

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// An item with this id already exists for the user
    #[error("Duplicate item id {0}")]
    DuplicateId(Uuid),

    /// The item's schema version does not match the current one
    #[error("Schema mismatch: expected {expected}, got {actual}")]
    SchemaMismatch {
        /// Version this build writes
        expected: u16,
        /// Version found on the record
        actual: u16,
    },

    /// No such item in the user's scope
    #[error("Item {0} not found")]
    NotFound(Uuid),

    /// The user's vector shard has not finished building
    #[error("Vector index not ready for user {0}")]
    IndexNotReady(String),

    /// Optimistic version check failed
    #[error("Concurrent modification of item {0}")]
    VersionConflict(Uuid),

    /// Record (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The storage backend failed
    #[error("Store backend error: {0}")]
    Backend(String),

    /// Envelope or key failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateId(id) => {
                CoreError::Validation(format!("duplicate item id {id}"))
            }
            StoreError::SchemaMismatch { expected, actual } => CoreError::Validation(format!(
                "schema version {actual} does not match current {expected}"
            )),
            StoreError::NotFound(id) => CoreError::NotFound(format!("item {id}")),
            StoreError::IndexNotReady(user) => CoreError::IndexNotReady(user),
            StoreError::Crypto(crypto) => crypto.into(),
            StoreError::VersionConflict(_)
            | StoreError::Serialization(_)
            | StoreError::Backend(_) => CoreError::internal(err),
        }
    }
}

/// Hybrid store facade
pub struct HybridStore {
    backend: Arc<dyn StoreBackend>,
    keys: Arc<KeyManager>,
    audit: Arc<AuditLogger>,
    metadata: MetadataIndex,
    vectors: VectorIndex,
}

impl HybridStore {
    /// Open the store and build the in-memory indices from the backend.
    ///
    /// Items whose vector fails to decrypt during the build are quarantined
    /// rather than aborting the open.
    pub fn open(
        backend: Arc<dyn StoreBackend>,
        keys: Arc<KeyManager>,
        audit: Arc<AuditLogger>,
    ) -> StoreResult<Self> {
        let store = Self {
            backend,
            keys,
            audit,
            metadata: MetadataIndex::new(),
            vectors: VectorIndex::new(),
        };
        for user_id in store.backend.item_user_ids()? {
            store.rebuild_user(&user_id)?;
        }
        Ok(store)
    }

    /// The underlying backend (event log access for audit/export paths)
    pub fn backend(&self) -> &Arc<dyn StoreBackend> {
        &self.backend
    }

    /// The metadata index
    pub fn metadata(&self) -> &MetadataIndex {
        &self.metadata
    }

    fn decode_vector(&self, item: &MemoryItem) -> StoreResult<Vec<f32>> {
        let key_id = KeyId::decode(&item.key_id)?;
        let plain = self.keys.decrypt(&item.vector, &item.user_id, &key_id)?;
        bincode::deserialize(&plain).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode_content(&self, item: &MemoryItem) -> StoreResult<String> {
        let key_id = KeyId::decode(&item.key_id)?;
        let plain = self.keys.decrypt(&item.content, &item.user_id, &key_id)?;
        String::from_utf8(plain).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// (Re)build one user's indices from the backend, swapping the vector
    /// shard in atomically. Metadata stays servable throughout.
    pub fn rebuild_user(&self, user_id: &str) -> StoreResult<()> {
        let items = self.backend.scan_items(user_id)?;
        let mut shard = HashMap::new();
        for item in &items {
            self.metadata.upsert(item);
            if !item.retrievable() {
                continue;
            }
            match self.decode_vector(item) {
                Ok(vector) => {
                    shard.insert(
                        item.id,
                        vector::VectorEntry {
                            vector,
                            topic: item.topic.clone(),
                            tier: item.tier,
                            score: item.score,
                        },
                    );
                }
                Err(StoreError::Crypto(CryptoError::IntegrityFailure(_))) => {
                    tracing::warn!(user_id, item_id = %item.id, "quarantining item with corrupt vector");
                    let mut bad = item.clone();
                    bad.quarantined = true;
                    bad.updated_at = Utc::now();
                    bad.record_version += 1;
                    self.backend.put_item(&bad)?;
                    self.metadata.upsert(&bad);
                }
                Err(other) => return Err(other),
            }
        }
        self.vectors.install_shard(user_id, shard);
        Ok(())
    }

    /// Insert a fully encrypted item. The item becomes visible to lookups
    /// in its user's scope on return.
    pub fn insert(&self, item: MemoryItem, plain_vector: Vec<f32>) -> StoreResult<Uuid> {
        if item.schema_version != SCHEMA_VERSION {
            return Err(StoreError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                actual: item.schema_version,
            });
        }
        if self.backend.get_item(&item.user_id, item.id)?.is_some() {
            return Err(StoreError::DuplicateId(item.id));
        }
        self.backend.put_item(&item)?;
        self.metadata.upsert(&item);
        if !self.vectors.is_ready(&item.user_id) {
            self.vectors.install_shard(&item.user_id, HashMap::new());
        }
        if item.retrievable() {
            self.vectors.upsert(
                &item.user_id,
                item.id,
                vector::VectorEntry {
                    vector: plain_vector,
                    topic: item.topic.clone(),
                    tier: item.tier,
                    score: item.score,
                },
            );
        }
        Ok(item.id)
    }

    /// Fetch and decrypt one item. `None` if absent in the user's scope.
    ///
    /// A failed integrity check quarantines the item: it is excluded from
    /// all future retrieval and an audit event is recorded.
    pub fn get(&self, user_id: &str, item_id: Uuid) -> StoreResult<Option<DecryptedItem>> {
        let Some(item) = self.backend.get_item(user_id, item_id)? else {
            return Ok(None);
        };
        if item.quarantined {
            return Ok(None);
        }
        match (self.decode_content(&item), self.decode_vector(&item)) {
            (Ok(text), Ok(vector)) => Ok(Some(DecryptedItem { item, text, vector })),
            (Err(StoreError::Crypto(CryptoError::IntegrityFailure(reason))), _)
            | (_, Err(StoreError::Crypto(CryptoError::IntegrityFailure(reason)))) => {
                self.quarantine(item, &reason)?;
                Err(StoreError::Crypto(CryptoError::IntegrityFailure(reason)))
            }
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    }

    fn quarantine(&self, mut item: MemoryItem, reason: &str) -> StoreResult<()> {
        item.quarantined = true;
        item.updated_at = Utc::now();
        item.record_version += 1;
        self.backend.put_item(&item)?;
        self.metadata.upsert(&item);
        self.vectors.remove(&item.user_id, item.id);
        self.audit.log(
            AuditEventBuilder::new(&item.user_id, AuditAction::Write)
                .resource(item.id)
                .detail("quarantined", "true")
                .detail("reason", reason),
        )?;
        Ok(())
    }

    /// Raw (still encrypted) record fetch; export and lifecycle paths
    pub fn get_raw(&self, user_id: &str, item_id: Uuid) -> StoreResult<Option<MemoryItem>> {
        self.backend.get_item(user_id, item_id)
    }

    /// All raw records for a user, including archived and quarantined ones
    pub fn scan_raw(&self, user_id: &str) -> StoreResult<Vec<MemoryItem>> {
        self.backend.scan_items(user_id)
    }

    /// Vector search over non-archived items, decrypting the hits.
    ///
    /// Returns up to `k` items ordered by descending similarity. Items that
    /// fail decryption mid-flight are quarantined and skipped.
    pub fn search(
        &self,
        user_id: &str,
        query: &[f32],
        filter: &SearchFilter,
        k: usize,
    ) -> StoreResult<Vec<(DecryptedItem, f32)>> {
        // A user with no items has no shard; that is an empty result, not
        // an index still building.
        if !self.vectors.is_ready(user_id) && self.backend.scan_items(user_id)?.is_empty() {
            return Ok(Vec::new());
        }
        let hits = self.vectors.search(user_id, query, filter, k)?;
        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            match self.get(user_id, hit.item_id) {
                Ok(Some(decrypted)) => results.push((decrypted, hit.similarity)),
                Ok(None) => {}
                Err(StoreError::Crypto(CryptoError::IntegrityFailure(_))) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }

    /// Filtered, ordered, paged listing of decrypted items
    pub fn list(
        &self,
        user_id: &str,
        filter: &ListFilter,
        order: ListOrder,
        offset: usize,
        limit: usize,
    ) -> StoreResult<(Vec<DecryptedItem>, usize)> {
        let page = self.metadata.list(user_id, filter, order, offset, limit);
        let mut items = Vec::with_capacity(page.ids.len());
        for id in page.ids {
            match self.get(user_id, id) {
                Ok(Some(decrypted)) => items.push(decrypted),
                Ok(None) => {}
                Err(StoreError::Crypto(CryptoError::IntegrityFailure(_))) => {}
                Err(e) => return Err(e),
            }
        }
        Ok((items, page.total))
    }

    /// Apply a mutation to one item, bumping the record version and
    /// `updated_at`. Optimistic: the write only lands if the record is
    /// unchanged since the read, retrying on interleaved writers.
    pub fn mutate(
        &self,
        user_id: &str,
        item_id: Uuid,
        mutator: impl Fn(&mut MemoryItem),
    ) -> StoreResult<MemoryItem> {
        const MAX_ATTEMPTS: usize = 8;
        for _ in 0..MAX_ATTEMPTS {
            let mut item = self
                .backend
                .get_item(user_id, item_id)?
                .ok_or(StoreError::NotFound(item_id))?;
            let expected_version = item.record_version;
            mutator(&mut item);
            item.updated_at = Utc::now();
            item.record_version = expected_version + 1;
            if !self.backend.swap_item(&item, expected_version)? {
                continue;
            }
            self.metadata.upsert(&item);
            if item.retrievable() {
                self.vectors.update_attrs(user_id, item_id, item.tier, item.score);
            } else {
                self.vectors.remove(user_id, item_id);
            }
            return Ok(item);
        }
        Err(StoreError::VersionConflict(item_id))
    }

    /// Replace an item's encrypted content and vector (user edits). The
    /// caller passes freshly encrypted blobs under the topic's current key,
    /// which is also how stale key versions get re-encrypted. PII flags
    /// from the new text merge in; existing flags are never cleared here.
    #[allow(clippy::too_many_arguments)]
    pub fn update_content(
        &self,
        user_id: &str,
        item_id: Uuid,
        content: Vec<u8>,
        vector_blob: Vec<u8>,
        key_id: String,
        plain_vector: Vec<f32>,
        new_flags: &crate::model::PiiFlags,
    ) -> StoreResult<MemoryItem> {
        let item = self.mutate(user_id, item_id, |item| {
            item.content = content.clone();
            item.vector = vector_blob.clone();
            item.key_id = key_id.clone();
            item.pii_flags.merge(new_flags);
        })?;
        if item.retrievable() {
            self.vectors.upsert(
                user_id,
                item_id,
                vector::VectorEntry {
                    vector: plain_vector,
                    topic: item.topic.clone(),
                    tier: item.tier,
                    score: item.score,
                },
            );
        }
        Ok(item)
    }

    /// Update an item's retention score
    pub fn update_score(&self, user_id: &str, item_id: Uuid, new_score: f32) -> StoreResult<()> {
        self.mutate(user_id, item_id, |item| {
            item.score = new_score.clamp(0.0, 1.0);
        })?;
        Ok(())
    }

    /// Move an item to a new tier, atomically writing the transition event.
    pub fn transition_tier(
        &self,
        user_id: &str,
        item_id: Uuid,
        new_tier: Tier,
        reason: TransitionReason,
    ) -> StoreResult<MemoryItem> {
        let mut item = self
            .backend
            .get_item(user_id, item_id)?
            .ok_or(StoreError::NotFound(item_id))?;
        let from_tier = item.tier;
        let promoted = new_tier > from_tier;
        item.tier = new_tier;
        if promoted {
            item.promoted_at_score = Some(item.score);
        }
        item.updated_at = Utc::now();
        item.record_version += 1;

        let event = TierTransitionEvent {
            item_id,
            user_id: user_id.to_string(),
            from_tier,
            to_tier: new_tier,
            score: item.score,
            reason,
            timestamp: Utc::now(),
        };
        let payload =
            bincode::serialize(&event).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.backend
            .put_item_with_event(&item, EventFamily::TierTransition, &payload)?;
        self.metadata.upsert(&item);
        self.vectors.update_attrs(user_id, item_id, item.tier, item.score);
        tracing::debug!(
            user_id,
            item_id = %item_id,
            from = from_tier.as_str(),
            to = new_tier.as_str(),
            reason = reason.code(),
            "tier transition"
        );
        Ok(item)
    }

    /// Soft-delete: set the archived flag. Items disappear from search but
    /// remain for the retention window.
    pub fn archive(&self, user_id: &str, item_ids: &[Uuid]) -> StoreResult<Vec<MemoryItem>> {
        let now = Utc::now();
        let mut archived = Vec::with_capacity(item_ids.len());
        for &item_id in item_ids {
            let item = self.mutate(user_id, item_id, |item| {
                item.archived = true;
                item.archived_at = Some(now);
            })?;
            archived.push(item);
        }
        Ok(archived)
    }

    /// Atomically commit a consolidation: insert the consolidated item and
    /// archive all sources, then expose the consolidated item to search
    /// only after the sources are gone from it.
    pub fn commit_consolidation(
        &self,
        consolidated: MemoryItem,
        consolidated_vector: Vec<f32>,
        source_ids: &[Uuid],
    ) -> StoreResult<()> {
        let user_id = consolidated.user_id.clone();
        let now = Utc::now();
        let mut sources = Vec::with_capacity(source_ids.len());
        for &id in source_ids {
            let mut source = self
                .backend
                .get_item(&user_id, id)?
                .ok_or(StoreError::NotFound(id))?;
            source.archived = true;
            source.archived_at = Some(now);
            source.updated_at = now;
            source.record_version += 1;
            sources.push(source);
        }

        self.backend.apply_consolidation(&consolidated, &sources)?;

        // Index updates: sources become unretrievable before the
        // consolidated item becomes retrievable.
        for source in &sources {
            self.metadata.upsert(source);
            self.vectors.remove(&user_id, source.id);
        }
        self.metadata.upsert(&consolidated);
        self.vectors.upsert(
            &user_id,
            consolidated.id,
            vector::VectorEntry {
                vector: consolidated_vector,
                topic: consolidated.topic.clone(),
                tier: consolidated.tier,
                score: consolidated.score,
            },
        );
        Ok(())
    }

    /// Physically remove items. Key destruction is the caller's
    /// responsibility (erasure destroys whole topics).
    pub fn erase_items(&self, user_id: &str, item_ids: &[Uuid]) -> StoreResult<usize> {
        let mut removed = 0;
        for &item_id in item_ids {
            if self.backend.delete_item(user_id, item_id)? {
                removed += 1;
            }
            self.metadata.remove(user_id, item_id);
            self.vectors.remove(user_id, item_id);
        }
        Ok(removed)
    }

    /// Drop every record and index entry for a user (account destruction)
    pub fn erase_user(&self, user_id: &str) -> StoreResult<()> {
        let items = self.backend.scan_items(user_id)?;
        for item in items {
            self.backend.delete_item(user_id, item.id)?;
        }
        self.backend.delete_profile(user_id)?;
        self.backend.delete_user_query_logs(user_id)?;
        for family in EventFamily::all() {
            if family != EventFamily::Audit {
                self.backend.delete_user_events(family, user_id)?;
            }
        }
        self.metadata.remove_user(user_id);
        self.vectors.remove_user(user_id);
        Ok(())
    }
}
