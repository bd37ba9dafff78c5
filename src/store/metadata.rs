//! In-memory metadata index
//!
//! Keyed lookups over the non-content attributes of every item, per user:
//! filter by topic / tier / archived, order by retention score or last-used
//! time. Rebuilt from the backend at open and kept in sync by the store's
//! write paths.

use dashmap::DashMap;
use ordered_float::OrderedFloat;
use std::collections::HashMap;
use uuid::Uuid;

use crate::model::{MemoryItem, Tier, TopicId};

/// The indexed, non-content attributes of one item
#[derive(Debug, Clone)]
pub struct MetaEntry {
    /// Topic
    pub topic: TopicId,
    /// Current tier
    pub tier: Tier,
    /// Archived flag
    pub archived: bool,
    /// Quarantined flag
    pub quarantined: bool,
    /// Pinned flag
    pub pinned: bool,
    /// Retention score
    pub score: f32,
    /// Creation time
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Last-used time
    pub last_used_at: chrono::DateTime<chrono::Utc>,
}

impl MetaEntry {
    /// Extract the indexed attributes from an item
    pub fn from_item(item: &MemoryItem) -> Self {
        Self {
            topic: item.topic.clone(),
            tier: item.tier,
            archived: item.archived,
            quarantined: item.quarantined,
            pinned: item.pinned,
            score: item.score,
            created_at: item.created_at,
            last_used_at: item.last_used_at,
        }
    }
}

/// Listing filter
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Restrict to one topic
    pub topic: Option<TopicId>,
    /// Restrict to one tier
    pub tier: Option<Tier>,
    /// Include archived items (export/audit paths only)
    pub include_archived: bool,
}

/// Listing order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOrder {
    /// Retention score, highest first
    ScoreDesc,
    /// Last-used time, most recent first
    LastUsedDesc,
}

/// A page of ids plus the total match count
#[derive(Debug, Clone)]
pub struct ListPage {
    /// Item ids in requested order
    pub ids: Vec<Uuid>,
    /// Total matches before paging
    pub total: usize,
}

/// Per-user metadata index
#[derive(Default)]
pub struct MetadataIndex {
    users: DashMap<String, HashMap<Uuid, MetaEntry>>,
}

impl MetadataIndex {
    /// Empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh an item's entry
    pub fn upsert(&self, item: &MemoryItem) {
        self.users
            .entry(item.user_id.clone())
            .or_default()
            .insert(item.id, MetaEntry::from_item(item));
    }

    /// Drop an item's entry
    pub fn remove(&self, user_id: &str, item_id: Uuid) {
        if let Some(mut entries) = self.users.get_mut(user_id) {
            entries.remove(&item_id);
        }
    }

    /// Drop every entry for a user
    pub fn remove_user(&self, user_id: &str) {
        self.users.remove(user_id);
    }

    /// Look up one entry
    pub fn get(&self, user_id: &str, item_id: Uuid) -> Option<MetaEntry> {
        self.users.get(user_id)?.get(&item_id).cloned()
    }

    /// Filtered, ordered, paged listing
    pub fn list(
        &self,
        user_id: &str,
        filter: &ListFilter,
        order: ListOrder,
        offset: usize,
        limit: usize,
    ) -> ListPage {
        let Some(entries) = self.users.get(user_id) else {
            return ListPage { ids: Vec::new(), total: 0 };
        };

        let mut matches: Vec<(&Uuid, &MetaEntry)> = entries
            .iter()
            .filter(|(_, e)| {
                if !filter.include_archived && e.archived {
                    return false;
                }
                if e.quarantined {
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
            .collect();

        match order {
            ListOrder::ScoreDesc => {
                matches.sort_by_key(|(id, e)| (std::cmp::Reverse(OrderedFloat(e.score)), **id));
            }
            ListOrder::LastUsedDesc => {
                matches.sort_by_key(|(id, e)| (std::cmp::Reverse(e.last_used_at), **id));
            }
        }

        let total = matches.len();
        let ids = matches
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(id, _)| *id)
            .collect();
        ListPage { ids, total }
    }

    /// Non-archived item count per topic for a user
    pub fn topic_counts(&self, user_id: &str) -> HashMap<TopicId, usize> {
        let mut counts = HashMap::new();
        if let Some(entries) = self.users.get(user_id) {
            for entry in entries.values() {
                if !entry.archived && !entry.quarantined {
                    *counts.entry(entry.topic.clone()).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    /// Ids of archived items for a user, with their archive-eligible tier
    pub fn archived_ids(&self, user_id: &str) -> Vec<Uuid> {
        self.users
            .get(user_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, e)| e.archived)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }
}
