//! Memory item record
//!
//! The atomic unit of storage. Content and embedding vector are kept
//! encrypted at rest ([`MemoryItem`]); reads decrypt into a
//! [`DecryptedItem`] view. Mutations bump the optimistic `version` stamp and
//! set `updated_at` explicitly on every write path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::events::OutcomeEvent;

/// Current schema version for persisted items
pub const SCHEMA_VERSION: u16 = 2;

/// Maximum topic identifier length
pub const MAX_TOPIC_LEN: usize = 64;

/// Retention tier of a memory item
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Freshly ingested, cheap to evict
    Short,
    /// Demonstrated some retention value
    Mid,
    /// Long-term knowledge, consolidation target
    Long,
}

impl Tier {
    /// The next tier up, if any
    pub fn promoted(&self) -> Option<Tier> {
        match self {
            Tier::Short => Some(Tier::Mid),
            Tier::Mid => Some(Tier::Long),
            Tier::Long => None,
        }
    }

    /// The next tier down, if any
    pub fn demoted(&self) -> Option<Tier> {
        match self {
            Tier::Short => None,
            Tier::Mid => Some(Tier::Short),
            Tier::Long => Some(Tier::Mid),
        }
    }

    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Short => "short",
            Tier::Mid => "mid",
            Tier::Long => "long",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated topic identifier: `[a-z0-9_-]+`, at most 64 characters,
/// immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(String);

impl TopicId {
    /// Parse and validate a topic identifier
    pub fn new(raw: &str) -> CoreResult<Self> {
        if raw.is_empty() || raw.len() > MAX_TOPIC_LEN {
            return Err(CoreError::Validation(format!(
                "topic id must be 1-{MAX_TOPIC_LEN} characters"
            )));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(CoreError::Validation(format!(
                "topic id '{raw}' must match [a-z0-9_-]+"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// The underlying string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TopicId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Detected PII kinds with per-kind occurrence counts.
///
/// Once set, flags are only cleared by erasure of the item, never by edits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PiiFlags {
    kinds: BTreeMap<String, u32>,
}

impl PiiFlags {
    /// Empty flag set
    pub fn none() -> Self {
        Self::default()
    }

    /// Record `count` occurrences of a PII kind
    pub fn record(&mut self, kind: &str, count: u32) {
        if count > 0 {
            *self.kinds.entry(kind.to_string()).or_insert(0) += count;
        }
    }

    /// Merge another flag set in (used by consolidation: union of sources)
    pub fn merge(&mut self, other: &PiiFlags) {
        for (kind, count) in &other.kinds {
            *self.kinds.entry(kind.clone()).or_insert(0) += count;
        }
    }

    /// Whether any PII was detected
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// The detected kinds, sorted
    pub fn kinds(&self) -> Vec<String> {
        self.kinds.keys().cloned().collect()
    }

    /// Occurrences of a specific kind
    pub fn count(&self, kind: &str) -> u32 {
        self.kinds.get(kind).copied().unwrap_or(0)
    }

    /// Iterate over (kind, count) pairs
    pub fn iter(&self) -> impl Iterator<Item = (&String, &u32)> {
        self.kinds.iter()
    }
}

/// A memory item as persisted: content and vector are ciphertext blobs in
/// the envelope format, decryptable only through the key manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Opaque identifier
    pub id: Uuid,
    /// Owning user; items cannot be re-owned
    pub user_id: String,
    /// Topic, immutable after creation
    pub topic: TopicId,
    /// Encrypted content blob
    pub content: Vec<u8>,
    /// Encrypted embedding vector blob
    pub vector: Vec<u8>,
    /// Current retention tier
    pub tier: Tier,
    /// Context retention score in [0, 1]
    pub score: f32,
    /// Score the item carried when last promoted, if ever promoted
    pub promoted_at_score: Option<f32>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time, maintained explicitly by every write path
    pub updated_at: DateTime<Utc>,
    /// Last time the item was used in a query bundle
    pub last_used_at: DateTime<Utc>,
    /// Monotonic access counter
    pub access_count: u64,
    /// Detected PII kinds
    pub pii_flags: PiiFlags,
    /// Append-only outcome log, capped with oldest-eviction
    pub outcomes: Vec<OutcomeEvent>,
    /// Soft-delete flag
    pub archived: bool,
    /// When the item was archived, if it is
    pub archived_at: Option<DateTime<Utc>>,
    /// Set when decryption failed an integrity check; excluded from retrieval
    pub quarantined: bool,
    /// User pin, exempts the item from demotion
    pub pinned: bool,
    /// Source item ids, present only for items created by consolidation
    pub source_items: Option<Vec<Uuid>>,
    /// Identifier of the key that encrypted this record ("topic/vN")
    pub key_id: String,
    /// Which embedding backend produced the vector
    pub embedding_backend: String,
    /// Schema version at write time
    pub schema_version: u16,
    /// Optimistic concurrency stamp, bumped on every write
    pub record_version: u64,
}

impl MemoryItem {
    /// Whether this item may appear in retrieval results
    pub fn retrievable(&self) -> bool {
        !self.archived && !self.quarantined
    }

    /// Whether this item was produced by consolidation
    pub fn is_consolidated(&self) -> bool {
        self.source_items.is_some()
    }

    /// Age in whole days at `now`
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days()
    }

    /// Days since the item was last used, at `now`
    pub fn idle_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_used_at).num_days()
    }

    /// Append an outcome event, evicting the oldest past `cap`
    pub fn push_outcome(&mut self, event: OutcomeEvent, cap: usize) {
        self.outcomes.push(event);
        while self.outcomes.len() > cap {
            self.outcomes.remove(0);
        }
    }

    /// Debug-time invariant check; used by tests
    pub fn check_invariants(&self) -> CoreResult<()> {
        if !(0.0..=1.0).contains(&self.score) {
            return Err(CoreError::Validation(format!(
                "item {} score {} out of [0,1]",
                self.id, self.score
            )));
        }
        if self.last_used_at < self.created_at {
            return Err(CoreError::Validation(format!(
                "item {} last_used_at precedes created_at",
                self.id
            )));
        }
        if let Some(sources) = &self.source_items {
            if sources.len() < 2 {
                return Err(CoreError::Validation(format!(
                    "consolidated item {} has fewer than 2 sources",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

/// A memory item together with its decrypted content and vector.
///
/// This view only exists in memory on the read path; it is never persisted.
#[derive(Debug, Clone)]
pub struct DecryptedItem {
    /// The underlying record (content/vector fields remain ciphertext)
    pub item: MemoryItem,
    /// Decrypted text content
    pub text: String,
    /// Decrypted embedding vector
    pub vector: Vec<f32>,
}

impl DecryptedItem {
    /// Aggregated outcome success rate for this item, 0.5 if no events
    pub fn outcome_rate(&self) -> f32 {
        crate::model::events::aggregate_outcomes(&self.item.outcomes)
    }

    /// A short excerpt of the text for bundle item records
    pub fn excerpt(&self, max_chars: usize) -> String {
        if self.text.len() <= max_chars {
            return self.text.clone();
        }
        let mut end = max_chars;
        while !self.text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &self.text[..end])
    }
}
