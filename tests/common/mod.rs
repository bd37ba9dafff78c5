//! Shared integration-test harness: a fresh in-memory core with a
//! deterministic embedder, plus seeding helpers for items with crafted
//! lifecycle state.

// Each test binary uses a different subset of the harness
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use acms::boundary::{AuthManager, BoundaryAdapter};
use acms::config::CoreConfig;
use acms::crypto::SoftwareBackend;
use acms::deadline::Deadline;
use acms::llm::{Embedder, ExtractiveSummarizer, HashEmbedder, LlmResult, Summarizer};
use acms::model::{MemoryItem, OutcomeEvent, OutcomeKind, PiiFlags, Tier, TopicId, SCHEMA_VERSION};
use acms::store::backend::{MemoryBackend, StoreBackend};
use acms::MemoryCore;

/// Embedding dimension used across integration tests. High enough that
/// hash-collision noise between unrelated texts stays far below the
/// retrieval similarity floor.
pub const DIM: usize = 1024;

/// A fresh core over in-memory storage and a temp key directory
pub struct TestHarness {
    pub core: Arc<MemoryCore>,
    pub backend: Arc<dyn StoreBackend>,
    _keys_dir: tempfile::TempDir,
}

/// Build a harness with the default local backends
pub fn harness() -> TestHarness {
    harness_with_summarizer(Arc::new(ExtractiveSummarizer))
}

/// Build a harness with a custom summarizer (deadline tests)
pub fn harness_with_summarizer(summarizer: Arc<dyn Summarizer>) -> TestHarness {
    let keys_dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
    let crypto = Arc::new(SoftwareBackend::open(keys_dir.path()).unwrap());
    let embedder = Arc::new(HashEmbedder::new(DIM));
    let core = MemoryCore::new(
        CoreConfig::with_dimension(DIM),
        backend.clone(),
        crypto,
        embedder,
        summarizer,
    )
    .unwrap();
    TestHarness {
        core,
        backend,
        _keys_dir: keys_dir,
    }
}

/// A boundary adapter over the harness core
pub fn adapter(h: &TestHarness) -> BoundaryAdapter {
    let auth = AuthManager::new(h.backend.clone(), h.core.audit().clone());
    BoundaryAdapter::new(h.core.clone(), auth)
}

/// Lifecycle state for a seeded item
pub struct SeedSpec<'a> {
    pub user: &'a str,
    pub topic: &'a str,
    pub text: &'a str,
    pub tier: Tier,
    pub score: f32,
    pub age_days: i64,
    pub access_count: u64,
    pub thumbs_up: usize,
    pub pii: PiiFlags,
}

impl<'a> SeedSpec<'a> {
    pub fn new(user: &'a str, topic: &'a str, text: &'a str) -> Self {
        Self {
            user,
            topic,
            text,
            tier: Tier::Short,
            score: 0.5,
            age_days: 0,
            access_count: 0,
            thumbs_up: 0,
            pii: PiiFlags::none(),
        }
    }
}

/// Insert an item directly through the store with crafted lifecycle state,
/// bypassing the ingest path. Used to manufacture aged/promoted items.
pub async fn seed_item(h: &TestHarness, spec: SeedSpec<'_>) -> Uuid {
    let topic = TopicId::new(spec.topic).unwrap();
    let embedder = HashEmbedder::new(DIM);
    let vector = embedder.embed(spec.text, Deadline::none()).await.unwrap();

    let keys = h.core.keys();
    let (content, key_id) = keys
        .encrypt(spec.text.as_bytes(), spec.user, &topic)
        .unwrap();
    let (vector_blob, _) = keys
        .encrypt(&bincode::serialize(&vector).unwrap(), spec.user, &topic)
        .unwrap();

    let created = Utc::now() - Duration::days(spec.age_days);
    let outcomes = (0..spec.thumbs_up)
        .map(|_| OutcomeEvent::new(Uuid::new_v4(), OutcomeKind::ThumbsUp))
        .collect();
    let item = MemoryItem {
        id: Uuid::new_v4(),
        user_id: spec.user.to_string(),
        topic,
        content,
        vector: vector_blob,
        tier: spec.tier,
        score: spec.score,
        promoted_at_score: None,
        created_at: created,
        updated_at: created,
        last_used_at: Utc::now(),
        access_count: spec.access_count,
        pii_flags: spec.pii,
        outcomes,
        archived: false,
        archived_at: None,
        quarantined: false,
        pinned: false,
        source_items: None,
        key_id: key_id.encode(),
        embedding_backend: "test-seed".to_string(),
        schema_version: SCHEMA_VERSION,
        record_version: 1,
    };
    h.core.store().insert(item, vector).unwrap()
}

/// Summarizer that stalls unless the group contains the marker token
/// `fast`; drives deadline-partial scenarios.
pub struct StallingSummarizer {
    pub stall: std::time::Duration,
}

#[async_trait]
impl Summarizer for StallingSummarizer {
    fn name(&self) -> &str {
        "stalling-summarizer"
    }

    async fn summarize(
        &self,
        texts: &[String],
        intent: &str,
        target_tokens: usize,
        deadline: Deadline,
    ) -> LlmResult<String> {
        if !texts.iter().any(|t| t.contains("fast")) {
            tokio::time::sleep(self.stall).await;
        }
        ExtractiveSummarizer
            .summarize(texts, intent, target_tokens, deadline)
            .await
    }
}

/// Wait for the rehydrator's spawned side effects to land
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
}
