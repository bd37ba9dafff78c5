//! Bundle cache
//!
//! TTL cache for assembled bundles, keyed by a hash of the full request
//! identity: user, query text, topic, intent, and compliance mode (the
//! last two are always part of the key so modes never cross-contaminate).
//! Population is single-writer per key through a build lock, so identical
//! concurrent queries build once. Mutations to any item present in a cached
//! bundle invalidate the affected entries through a reverse index.

use dashmap::DashMap;
use moka::sync::Cache;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::model::TopicId;
use crate::rehydrate::bundle::ContextBundle;
use crate::rehydrate::intent::Intent;

/// Cache key: blake3 over the request identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build the key for a request
    pub fn new(
        user_id: &str,
        query: &str,
        topic: &TopicId,
        intent: &Intent,
        compliance_mode: bool,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(user_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(query.as_bytes());
        hasher.update(&[0]);
        hasher.update(topic.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(intent.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(&[compliance_mode as u8]);
        Self(hasher.finalize().to_hex().to_string())
    }
}

/// TTL bundle cache with per-key build locks and item-based invalidation
pub struct BundleCache {
    bundles: Cache<CacheKey, Arc<ContextBundle>>,
    /// item id → cache keys whose bundle used that item
    item_keys: DashMap<Uuid, HashSet<CacheKey>>,
    /// per-key build locks (thundering-herd protection)
    locks: DashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>,
}

impl BundleCache {
    /// Create a cache with the given TTL and capacity
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        Self {
            bundles: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(capacity)
                .build(),
            item_keys: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Cached bundle for a key, if present and fresh
    pub fn get(&self, key: &CacheKey) -> Option<Arc<ContextBundle>> {
        self.bundles.get(key)
    }

    /// The build lock for a key. Callers hold it across the
    /// check-build-insert sequence.
    pub fn build_lock(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Store a completed bundle. Callers must not store partial or
    /// cancelled results.
    pub fn insert(&self, key: CacheKey, bundle: Arc<ContextBundle>) {
        for item_id in bundle.item_ids() {
            self.item_keys.entry(item_id).or_default().insert(key.clone());
        }
        self.bundles.insert(key, bundle);
    }

    /// Invalidate every cached bundle that used the given item
    pub fn invalidate_item(&self, item_id: Uuid) {
        if let Some((_, keys)) = self.item_keys.remove(&item_id) {
            for key in keys {
                self.bundles.invalidate(&key);
            }
        }
    }

    /// Invalidate everything for a user-destroying operation
    pub fn invalidate_all(&self) {
        self.bundles.invalidate_all();
        self.item_keys.clear();
        self.locks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(query: &str, intent: &Intent, compliance: bool) -> CacheKey {
        CacheKey::new(
            "u1",
            query,
            &TopicId::new("work").unwrap(),
            intent,
            compliance,
        )
    }

    fn bundle_with_items(items: Vec<Uuid>) -> Arc<ContextBundle> {
        let mut bundle = ContextBundle::empty(Uuid::new_v4(), &Intent::General, 0);
        bundle.items = items
            .into_iter()
            .map(|id| crate::rehydrate::bundle::BundleItem {
                id,
                tier: crate::model::Tier::Short,
                score: 0.5,
                excerpt: String::new(),
                relevance: 0.5,
                outcome_rate: 0.5,
            })
            .collect();
        Arc::new(bundle)
    }

    #[test]
    fn test_key_includes_intent_and_compliance() {
        let base = key("q", &Intent::General, false);
        assert_ne!(base, key("q", &Intent::CodeAssist, false));
        assert_ne!(base, key("q", &Intent::General, true));
        assert_ne!(base, key("other", &Intent::General, false));
        assert_eq!(base, key("q", &Intent::General, false));
    }

    #[test]
    fn test_round_trip_within_ttl() {
        let cache = BundleCache::new(Duration::from_secs(300), 16);
        let k = key("q", &Intent::General, false);
        let bundle = bundle_with_items(vec![]);
        cache.insert(k.clone(), bundle.clone());
        assert_eq!(cache.get(&k).unwrap(), bundle);
    }

    #[test]
    fn test_item_mutation_invalidates_entry() {
        let cache = BundleCache::new(Duration::from_secs(300), 16);
        let item_id = Uuid::new_v4();
        let k = key("q", &Intent::General, false);
        cache.insert(k.clone(), bundle_with_items(vec![item_id]));
        assert!(cache.get(&k).is_some());

        cache.invalidate_item(item_id);
        assert!(cache.get(&k).is_none());
    }

    #[test]
    fn test_unrelated_item_does_not_invalidate() {
        let cache = BundleCache::new(Duration::from_secs(300), 16);
        let k = key("q", &Intent::General, false);
        cache.insert(k.clone(), bundle_with_items(vec![Uuid::new_v4()]));
        cache.invalidate_item(Uuid::new_v4());
        assert!(cache.get(&k).is_some());
    }

    #[tokio::test]
    async fn test_build_lock_is_shared_per_key() {
        let cache = BundleCache::new(Duration::from_secs(300), 16);
        let k = key("q", &Intent::General, false);
        let lock_a = cache.build_lock(&k);
        let lock_b = cache.build_lock(&k);
        assert!(Arc::ptr_eq(&lock_a, &lock_b));

        let _held = lock_a.lock().await;
        assert!(lock_b.try_lock().is_err());
    }
}
