//! End-to-end query-path tests: ingest → rehydrate, compliance filtering,
//! cache coherence, budget bounds, and deadline behavior.

mod common;

use std::sync::Arc;
use std::time::Duration;

use acms::audit::AuditAction;
use acms::deadline::{CancelToken, Deadline};
use acms::error::CoreError;
use acms::model::Tier;
use common::{adapter, harness, harness_with_summarizer, seed_item, settle, SeedSpec};

const BUDGET: usize = 400;

#[tokio::test(flavor = "multi_thread")]
async fn test_ingest_then_query_returns_matching_item_only() {
    let h = harness();
    let i1 = h
        .core
        .ingest(
            "u1",
            "work",
            "Security audit Q3 2024 recommended enabling HSTS.",
            Deadline::none(),
        )
        .await
        .unwrap();
    let i2 = h
        .core
        .ingest(
            "u1",
            "work",
            "Team standup 2024-10-07: rollout on track.",
            Deadline::none(),
        )
        .await
        .unwrap();

    let bundle = h
        .core
        .query(
            "u1",
            "What did the Q3 security audit recommend?",
            "work",
            None,
            BUDGET,
            Some(true),
            Deadline::none(),
            CancelToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(bundle.item_ids(), vec![i1.item_id]);
    assert!(!bundle.item_ids().contains(&i2.item_id));
    assert!(bundle.summary.to_lowercase().contains("audit"));
    assert!(bundle.total_tokens <= BUDGET);
    assert!(!bundle.partial);
    assert!(!bundle.cache_hit);

    // Side effects: usage counters and query log
    settle().await;
    let item = h.core.store().get_raw("u1", i1.item_id).unwrap().unwrap();
    assert_eq!(item.access_count, 1);
    let record = h
        .backend
        .get_query_log("u1", bundle.query_id)
        .unwrap()
        .unwrap();
    assert_eq!(record.item_ids, vec![i1.item_id]);
    // Hashes only, never text
    assert_eq!(record.query_hash.len(), 64);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_compliance_mode_blocks_cross_topic() {
    let h = harness();
    let personal = h
        .core
        .ingest(
            "u1",
            "personal",
            "Dentist appointment Oct 15 at 10:00.",
            Deadline::none(),
        )
        .await
        .unwrap();

    let bundle = h
        .core
        .query(
            "u1",
            "dentist appointment schedule",
            "work",
            None,
            BUDGET,
            Some(true),
            Deadline::none(),
            CancelToken::new(),
        )
        .await
        .unwrap();

    // The personal item never reaches the bundle
    assert!(bundle.item_ids().is_empty());
    assert!(!bundle.item_ids().contains(&personal.item_id));

    // The filtering decision is audited with original/surviving counts
    let events = h.core.audit().events_for("u1").unwrap();
    let filter_event = events
        .iter()
        .find(|e| {
            e.action == AuditAction::PolicyFilter
                && e.metadata.get("filter").map(String::as_str) == Some("compliance_topic")
        })
        .expect("compliance filter event");
    assert_eq!(filter_event.metadata["original"], "1");
    assert_eq!(filter_event.metadata["filtered"], "0");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cache_coherence_within_ttl_and_invalidation() {
    let h = harness();
    let receipt = h
        .core
        .ingest(
            "u1",
            "work",
            "Security audit Q3 2024 recommended enabling HSTS.",
            Deadline::none(),
        )
        .await
        .unwrap();

    let query = |h: &common::TestHarness| {
        let core = h.core.clone();
        async move {
            core.query(
                "u1",
                "security audit recommendation",
                "work",
                None,
                BUDGET,
                Some(false),
                Deadline::none(),
                CancelToken::new(),
            )
            .await
            .unwrap()
        }
    };

    let first = query(&h).await;
    assert!(!first.cache_hit);
    let second = query(&h).await;
    assert!(second.cache_hit);
    // Identical inputs within TTL: equal bundles
    assert_eq!(second.query_id, first.query_id);
    assert_eq!(second.summary, first.summary);
    assert_eq!(second.items, first.items);

    // A mutation affecting a bundled item invalidates the entry
    h.core
        .pin_memory("u1", receipt.item_id, true)
        .await
        .unwrap();
    let third = query(&h).await;
    assert!(!third.cache_hit);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_intent_changes_cache_key() {
    let h = harness();
    h.core
        .ingest("u1", "work", "Security audit recommended HSTS.", Deadline::none())
        .await
        .unwrap();

    let run = |intent: Option<acms::Intent>| {
        let core = h.core.clone();
        async move {
            core.query(
                "u1",
                "security audit",
                "work",
                intent,
                BUDGET,
                Some(false),
                Deadline::none(),
                CancelToken::new(),
            )
            .await
            .unwrap()
        }
    };
    let general = run(Some(acms::Intent::General)).await;
    let research = run(Some(acms::Intent::Research)).await;
    // Different intent, different cache identity: not served from cache
    assert!(!general.cache_hit);
    assert!(!research.cache_hit);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_candidate_set_returns_well_formed_bundle() {
    let h = harness();
    // User exists but has nothing relevant
    h.core
        .ingest("u1", "work", "completely unrelated content", Deadline::none())
        .await
        .unwrap();
    let bundle = h
        .core
        .query(
            "u1",
            "quantum chromodynamics lattice",
            "work",
            None,
            BUDGET,
            Some(false),
            Deadline::none(),
            CancelToken::new(),
        )
        .await
        .unwrap();
    assert!(bundle.items.is_empty());
    assert!(bundle.summary.is_empty());
    assert_eq!(bundle.total_tokens, 0);

    // A user with no items at all also gets a well-formed empty bundle
    let bundle = h
        .core
        .query(
            "nobody",
            "anything",
            "work",
            None,
            BUDGET,
            Some(false),
            Deadline::none(),
            CancelToken::new(),
        )
        .await
        .unwrap();
    assert!(bundle.items.is_empty());

    // An empty query and a zero budget are both answered, not rejected
    let bundle = h
        .core
        .query(
            "u1",
            "",
            "work",
            None,
            0,
            Some(false),
            Deadline::none(),
            CancelToken::new(),
        )
        .await
        .unwrap();
    assert!(bundle.items.is_empty());
    assert_eq!(bundle.total_tokens, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deadline_shorter_than_classification_has_no_side_effects() {
    let h = harness();
    h.core
        .ingest("u1", "work", "Security audit recommended HSTS.", Deadline::none())
        .await
        .unwrap();

    let err = h
        .core
        .query(
            "u1",
            "security audit",
            "work",
            None,
            BUDGET,
            Some(false),
            Deadline::after(Duration::ZERO),
            CancelToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::DeadlineExceeded(_)));

    settle().await;
    // No usage bump happened
    let (items, _) = h.core.list_memories("u1", None, None, 0, 10).unwrap();
    assert_eq!(items[0].item.access_count, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deadline_mid_summarization_yields_partial_bundle() {
    let h = harness_with_summarizer(Arc::new(common::StallingSummarizer {
        stall: Duration::from_millis(1500),
    }));

    // Three groups: different topics. Only the `fast` group's summarizer
    // call completes inside the deadline.
    let fast = seed_item(
        &h,
        SeedSpec {
            score: 0.9,
            ..SeedSpec::new("u1", "alpha", "fast summary of the planning notes")
        },
    )
    .await;
    let slow_a = seed_item(
        &h,
        SeedSpec {
            score: 0.9,
            ..SeedSpec::new("u1", "beta", "planning notes about the beta workstream")
        },
    )
    .await;
    let slow_b = seed_item(
        &h,
        SeedSpec {
            score: 0.9,
            ..SeedSpec::new("u1", "gamma", "planning notes about the gamma workstream")
        },
    )
    .await;

    let bundle = h
        .core
        .query(
            "u1",
            "planning notes",
            "alpha",
            None,
            1000,
            Some(false),
            Deadline::after(Duration::from_millis(300)),
            CancelToken::new(),
        )
        .await
        .unwrap();

    assert!(bundle.partial);
    assert!(bundle.item_ids().contains(&fast));
    assert!(!bundle.item_ids().contains(&slow_a));
    assert!(!bundle.item_ids().contains(&slow_b));
    // Total tokens reflect only the returned content
    assert!(bundle.total_tokens <= 1000);
    assert!(bundle.summary.contains("fast"));

    // Partial results must not populate the cache
    let again = h
        .core
        .query(
            "u1",
            "planning notes",
            "alpha",
            None,
            1000,
            Some(false),
            Deadline::after(Duration::from_secs(30)),
            CancelToken::new(),
        )
        .await
        .unwrap();
    assert!(!again.cache_hit);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_boundary_validation_via_adapter() {
    let h = harness();
    let adapter = adapter(&h);
    let registered = adapter.register_user("alice@example.com", "s3cret-pass").unwrap();
    let session = adapter
        .authenticate("alice@example.com", "s3cret-pass", None)
        .unwrap();
    assert_eq!(session.user_id, registered.user_id);

    // Content exactly at the limit succeeds; one byte over fails
    let at_limit = "x".repeat(50_000);
    adapter
        .ingest_memory(&session.token, "work", &at_limit)
        .await
        .unwrap();
    let over = "x".repeat(50_001);
    let err = adapter
        .ingest_memory(&session.token, "work", &over)
        .await
        .unwrap_err();
    assert_eq!(err.code, "validation_error");

    // Topic charset and budget bounds
    let err = adapter
        .ingest_memory(&session.token, "Not A Topic", "text")
        .await
        .unwrap_err();
    assert_eq!(err.code, "validation_error");
    let err = adapter
        .query(&session.token, "q", "work", None, 50, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code, "validation_error");

    // Unknown session
    let err = adapter.get_memory("bogus-token", uuid::Uuid::new_v4()).unwrap_err();
    assert_eq!(err.code, "authentication_failed");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rate_limit_reports_retry_after() {
    let h = harness();
    let adapter = adapter(&h);
    adapter.register_user("alice@example.com", "s3cret-pass").unwrap();
    let session = adapter
        .authenticate("alice@example.com", "s3cret-pass", None)
        .unwrap();

    // Default budget: 100 ingests per minute
    for i in 0..100 {
        adapter
            .ingest_memory(&session.token, "work", &format!("note number {i}"))
            .await
            .unwrap();
    }
    let err = adapter
        .ingest_memory(&session.token, "work", "one too many")
        .await
        .unwrap_err();
    assert_eq!(err.code, "rate_limited");
    assert!(err.retry_after_secs.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_demoted_tier_item_still_searchable_but_ranked_by_hybrid() {
    let h = harness();
    // Two items about the same subject; the higher-score one should rank
    // first all else equal
    let strong = seed_item(
        &h,
        SeedSpec {
            score: 0.9,
            tier: Tier::Mid,
            ..SeedSpec::new("u1", "work", "release checklist for the deploy pipeline")
        },
    )
    .await;
    let weak = seed_item(
        &h,
        SeedSpec {
            score: 0.3,
            ..SeedSpec::new("u1", "work", "release checklist for the deploy pipeline v2")
        },
    )
    .await;

    let bundle = h
        .core
        .query(
            "u1",
            "release checklist deploy",
            "work",
            None,
            2000,
            Some(false),
            Deadline::none(),
            CancelToken::new(),
        )
        .await
        .unwrap();
    let ids = bundle.item_ids();
    assert!(ids.contains(&strong));
    assert!(ids.contains(&weak));
    let strong_item = bundle.items.iter().find(|i| i.id == strong).unwrap();
    let weak_item = bundle.items.iter().find(|i| i.id == weak).unwrap();
    assert!(strong_item.relevance >= weak_item.relevance);
}
