//! In-memory vector index
//!
//! Per-user shards of decrypted embedding vectors for non-archived,
//! non-quarantined items. Search is an exact cosine scan over the shard
//! under the `(topic, tier, min_score)` predicate, which trivially meets the
//! recall target against exhaustive search. Shards are read-shared
//! process-wide; rebuilds construct a fresh shard off to the side and swap
//! it in atomically, the old snapshot serving reads until the swap. A user
//! with no shard yet yields `IndexNotReady`.
//!
//! Vectors are rest-encrypted in the backend; this index is the only place
//! plaintext vectors live, inside the serving process.

use dashmap::DashMap;
use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{StoreError, StoreResult};
use crate::llm::cosine_similarity;
use crate::model::{Tier, TopicId};

/// One indexed item
#[derive(Debug, Clone)]
pub struct VectorEntry {
    /// Decrypted embedding
    pub vector: Vec<f32>,
    /// Topic, for compliance-constrained search
    pub topic: TopicId,
    /// Current tier
    pub tier: Tier,
    /// Current retention score
    pub score: f32,
}

/// Search predicate
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Restrict to one topic (compliance mode)
    pub topic: Option<TopicId>,
    /// Restrict to one tier
    pub tier: Option<Tier>,
    /// Minimum retention score
    pub min_score: f32,
    /// Minimum cosine similarity for a hit
    pub min_similarity: f32,
}

/// A scored search hit
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// Item id
    pub item_id: Uuid,
    /// Cosine similarity to the query vector
    pub similarity: f32,
}

#[derive(Default)]
struct Shard {
    entries: HashMap<Uuid, VectorEntry>,
}

/// Per-user vector index with atomic shard swap
#[derive(Default)]
pub struct VectorIndex {
    shards: DashMap<String, Arc<RwLock<Shard>>>,
}

impl VectorIndex {
    /// Empty index; every user is unready until a shard is installed
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly built shard for a user, atomically replacing any
    /// previous one.
    pub fn install_shard(&self, user_id: &str, entries: HashMap<Uuid, VectorEntry>) {
        self.shards
            .insert(user_id.to_string(), Arc::new(RwLock::new(Shard { entries })));
    }

    /// Whether the user's shard has finished its initial build
    pub fn is_ready(&self, user_id: &str) -> bool {
        self.shards.contains_key(user_id)
    }

    /// Add or refresh one entry. No-op (by design) when the shard is still
    /// building; the rebuild sees the backend's state.
    pub fn upsert(&self, user_id: &str, item_id: Uuid, entry: VectorEntry) {
        if let Some(shard) = self.shards.get(user_id) {
            shard.write().entries.insert(item_id, entry);
        }
    }

    /// Refresh the predicate attributes of an entry without touching the
    /// vector (score updates, tier transitions)
    pub fn update_attrs(&self, user_id: &str, item_id: Uuid, tier: Tier, score: f32) {
        if let Some(shard) = self.shards.get(user_id) {
            if let Some(entry) = shard.write().entries.get_mut(&item_id) {
                entry.tier = tier;
                entry.score = score;
            }
        }
    }

    /// Evict an entry (archive, quarantine, erasure)
    pub fn remove(&self, user_id: &str, item_id: Uuid) {
        if let Some(shard) = self.shards.get(user_id) {
            shard.write().entries.remove(&item_id);
        }
    }

    /// Drop a user's entire shard
    pub fn remove_user(&self, user_id: &str) {
        self.shards.remove(user_id);
    }

    /// Top-k cosine search under the filter
    pub fn search(
        &self,
        user_id: &str,
        query: &[f32],
        filter: &SearchFilter,
        k: usize,
    ) -> StoreResult<Vec<SearchHit>> {
        let shard = self
            .shards
            .get(user_id)
            .ok_or_else(|| StoreError::IndexNotReady(user_id.to_string()))?;
        let shard = shard.read();

        let mut hits: Vec<SearchHit> = shard
            .entries
            .iter()
            .filter(|(_, e)| {
                if e.score < filter.min_score {
                    return false;
                }
                if let Some(topic) = &filter.topic {
                    if e.topic != *topic {
                        return false;
                    }
                }
                if let Some(tier) = filter.tier {
                    if e.tier != tier {
                        return false;
                    }
                }
                true
            })
            .map(|(id, e)| SearchHit {
                item_id: *id,
                similarity: cosine_similarity(query, &e.vector),
            })
            .filter(|h| h.similarity >= filter.min_similarity)
            .collect();

        hits.sort_by_key(|h| (std::cmp::Reverse(OrderedFloat(h.similarity)), h.item_id));
        hits.truncate(k);
        Ok(hits)
    }

    /// Number of indexed entries for a user (0 when unready)
    pub fn len(&self, user_id: &str) -> usize {
        self.shards
            .get(user_id)
            .map(|s| s.read().entries.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(name: &str) -> TopicId {
        TopicId::new(name).unwrap()
    }

    fn entry(vector: Vec<f32>, topic_name: &str, tier: Tier, score: f32) -> VectorEntry {
        VectorEntry {
            vector,
            topic: topic(topic_name),
            tier,
            score,
        }
    }

    fn ready_index(user: &str) -> VectorIndex {
        let index = VectorIndex::new();
        index.install_shard(user, HashMap::new());
        index
    }

    #[test]
    fn test_search_before_install_is_not_ready() {
        let index = VectorIndex::new();
        let err = index
            .search("u1", &[1.0, 0.0], &SearchFilter::default(), 10)
            .unwrap_err();
        assert!(matches!(err, StoreError::IndexNotReady(_)));
    }

    #[test]
    fn test_search_orders_by_similarity() {
        let index = ready_index("u1");
        let close = Uuid::new_v4();
        let far = Uuid::new_v4();
        index.upsert("u1", close, entry(vec![1.0, 0.0], "work", Tier::Short, 0.5));
        index.upsert("u1", far, entry(vec![0.0, 1.0], "work", Tier::Short, 0.5));

        let hits = index
            .search("u1", &[1.0, 0.1], &SearchFilter::default(), 10)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].item_id, close);
        assert!(hits[0].similarity > hits[1].similarity);
    }

    #[test]
    fn test_filters_apply() {
        let index = ready_index("u1");
        index.upsert(
            "u1",
            Uuid::new_v4(),
            entry(vec![1.0, 0.0], "work", Tier::Short, 0.5),
        );
        index.upsert(
            "u1",
            Uuid::new_v4(),
            entry(vec![1.0, 0.0], "personal", Tier::Short, 0.5),
        );
        index.upsert(
            "u1",
            Uuid::new_v4(),
            entry(vec![1.0, 0.0], "work", Tier::Long, 0.1),
        );

        let filter = SearchFilter {
            topic: Some(topic("work")),
            tier: None,
            min_score: 0.25,
            min_similarity: 0.0,
        };
        let hits = index.search("u1", &[1.0, 0.0], &filter, 10).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_k_truncation() {
        let index = ready_index("u1");
        for _ in 0..10 {
            index.upsert(
                "u1",
                Uuid::new_v4(),
                entry(vec![1.0, 0.0], "work", Tier::Short, 0.5),
            );
        }
        let hits = index
            .search("u1", &[1.0, 0.0], &SearchFilter::default(), 3)
            .unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn test_shard_swap_replaces_contents() {
        let index = ready_index("u1");
        let old_id = Uuid::new_v4();
        index.upsert("u1", old_id, entry(vec![1.0], "work", Tier::Short, 0.5));

        let new_id = Uuid::new_v4();
        let mut fresh = HashMap::new();
        fresh.insert(new_id, entry(vec![1.0], "work", Tier::Short, 0.5));
        index.install_shard("u1", fresh);

        let hits = index.search("u1", &[1.0], &SearchFilter::default(), 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].item_id, new_id);
    }

    #[test]
    fn test_remove_user_makes_unready() {
        let index = ready_index("u1");
        index.remove_user("u1");
        assert!(!index.is_ready("u1"));
    }
}
