//! Lifecycle tests: batch recomputation, tier evaluation, promotion
//! consolidation, PII consent gating, and archive retention — driven
//! through the same maintenance entry points the scheduler uses.

mod common;

use chrono::Utc;

use acms::audit::AuditAction;
use acms::deadline::{CancelToken, Deadline};
use acms::model::{PiiFlags, Tier};
use acms::sched::MaintenanceTarget;
use common::{harness, seed_item, SeedSpec};

fn work_note(i: usize) -> String {
    format!("Work log entry {i}: the migration made steady progress today.")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_promotion_with_consolidation() {
    let h = harness();
    let cancel = CancelToken::new();

    // Five high-value MID items in the same topic, created the same day,
    // old enough and with strong outcomes
    let mut source_ids = Vec::new();
    for i in 0..5 {
        let text = work_note(i);
        let id = seed_item(
            &h,
            SeedSpec {
                tier: Tier::Mid,
                score: 0.85,
                age_days: 8,
                access_count: 4,
                thumbs_up: 4,
                ..SeedSpec::new("u1", "work", &text)
            },
        )
        .await;
        source_ids.push(id);
    }

    // Evaluation queues five MID→LONG promotions
    let planned = h.core.evaluate_user("u1", &cancel).await.unwrap();
    assert_eq!(planned, 5);

    // Consolidation groups all five into one summarized item
    let moved = h
        .core
        .consolidate_user("u1", Deadline::none(), &cancel)
        .await
        .unwrap();
    assert_eq!(moved, 5);

    // All sources archived; exactly one consolidated item remains live
    for id in &source_ids {
        let source = h.core.store().get_raw("u1", *id).unwrap().unwrap();
        assert!(source.archived);
    }
    let (live, total) = h.core.list_memories("u1", Some("work"), None, 0, 50).unwrap();
    assert_eq!(total, 1);
    let consolidated = &live[0].item;
    assert_eq!(consolidated.tier, Tier::Long);
    let mut sources = consolidated.source_items.clone().unwrap();
    sources.sort();
    let mut expected = source_ids.clone();
    expected.sort();
    assert_eq!(sources, expected);
    // Promotion invariant: LONG items record the score they carried
    assert!(consolidated.promoted_at_score.unwrap() > 0.80);

    // A consolidation event was committed
    let events = h
        .backend
        .read_events(acms::store::backend::EventFamily::Consolidation, "u1")
        .unwrap();
    assert_eq!(events.len(), 1);

    // Querying the topic now surfaces the consolidated item
    let bundle = h
        .core
        .query(
            "u1",
            "work migration progress",
            "work",
            None,
            800,
            Some(false),
            Deadline::none(),
            CancelToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(bundle.item_ids(), vec![consolidated.id]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_item_promotes_in_place_without_summary() {
    let h = harness();
    let cancel = CancelToken::new();
    let id = seed_item(
        &h,
        SeedSpec {
            tier: Tier::Short,
            score: 0.7,
            access_count: 3,
            ..SeedSpec::new("u1", "work", "standalone valuable note")
        },
    )
    .await;

    h.core.evaluate_user("u1", &cancel).await.unwrap();
    h.core
        .consolidate_user("u1", Deadline::none(), &cancel)
        .await
        .unwrap();

    let item = h.core.store().get_raw("u1", id).unwrap().unwrap();
    assert_eq!(item.tier, Tier::Mid);
    assert!(!item.archived);
    assert!(item.source_items.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pii_gates_promotion_to_long() {
    let h = harness();
    let cancel = CancelToken::new();

    let mut pii = PiiFlags::none();
    pii.record("email", 1);
    pii.record("government_id", 1);
    let id = seed_item(
        &h,
        SeedSpec {
            tier: Tier::Mid,
            score: 0.88,
            age_days: 10,
            access_count: 6,
            thumbs_up: 5,
            pii,
            ..SeedSpec::new("u1", "work", "Contact sheet for the onboarding case")
        },
    )
    .await;

    h.core.evaluate_user("u1", &cancel).await.unwrap();
    h.core
        .consolidate_user("u1", Deadline::none(), &cancel)
        .await
        .unwrap();

    // Without consent the item stays in MID and the denial is audited
    let item = h.core.store().get_raw("u1", id).unwrap().unwrap();
    assert_eq!(item.tier, Tier::Mid);
    assert!(!item.archived);

    let events = h.core.audit().events_for("u1").unwrap();
    let denial = events
        .iter()
        .find(|e| e.metadata.get("filter").map(String::as_str) == Some("pii_consent_required"))
        .expect("consent denial audit event");
    assert_eq!(denial.action, AuditAction::PolicyFilter);
    assert!(denial.metadata["kinds"].contains("email"));
    assert!(denial.metadata["kinds"].contains("government_id"));

    // After consent for both kinds the promotion goes through
    h.core
        .policy()
        .consents()
        .grant(
            "u1",
            &acms::TopicId::new("work").unwrap(),
            &["email".to_string(), "government_id".to_string()],
        )
        .unwrap();
    h.core.evaluate_user("u1", &cancel).await.unwrap();
    h.core
        .consolidate_user("u1", Deadline::none(), &cancel)
        .await
        .unwrap();
    let item = h.core.store().get_raw("u1", id).unwrap().unwrap();
    assert_eq!(item.tier, Tier::Long);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_demotion_on_low_score_and_pin_exemption() {
    let h = harness();
    let cancel = CancelToken::new();

    let weak = seed_item(
        &h,
        SeedSpec {
            tier: Tier::Mid,
            score: 0.2,
            ..SeedSpec::new("u1", "work", "stale low-value note")
        },
    )
    .await;
    let pinned = seed_item(
        &h,
        SeedSpec {
            tier: Tier::Mid,
            score: 0.2,
            ..SeedSpec::new("u1", "work", "pinned low-value note")
        },
    )
    .await;
    h.core.pin_memory("u1", pinned, true).await.unwrap();

    h.core.evaluate_user("u1", &cancel).await.unwrap();

    let weak_item = h.core.store().get_raw("u1", weak).unwrap().unwrap();
    assert_eq!(weak_item.tier, Tier::Short);
    let pinned_item = h.core.store().get_raw("u1", pinned).unwrap().unwrap();
    assert_eq!(pinned_item.tier, Tier::Mid);

    // The demotion wrote a transition event with its reason code
    let events = h
        .backend
        .read_events(acms::store::backend::EventFamily::TierTransition, "u1")
        .unwrap();
    let transition: acms::model::TierTransitionEvent =
        bincode::deserialize(&events.last().unwrap().1).unwrap();
    assert_eq!(transition.item_id, weak);
    assert_eq!(transition.to_tier, Tier::Short);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_recompute_updates_scores_and_audits_once() {
    let h = harness();
    let cancel = CancelToken::new();
    for i in 0..4 {
        let text = work_note(i);
        seed_item(
            &h,
            SeedSpec {
                score: 0.99,
                age_days: 30,
                ..SeedSpec::new("u1", "work", &text)
            },
        )
        .await;
    }

    let updated = h.core.recompute_user("u1", &cancel).await.unwrap();
    assert_eq!(updated, 4);

    // Scores decayed off their seeded values and stay in bounds
    let (items, _) = h.core.list_memories("u1", None, None, 0, 10).unwrap();
    for item in &items {
        assert!(item.item.score < 0.99);
        assert!((0.0..=1.0).contains(&item.item.score));
    }

    // Exactly one summary audit event for the batch
    let events = h.core.audit().events_for("u1").unwrap();
    let summaries: Vec<_> = events
        .iter()
        .filter(|e| {
            e.metadata.get("operation").map(String::as_str) == Some("crs_batch_recompute")
        })
        .collect();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].metadata["items"], "4");

    // Recomputing twice over the same inputs is idempotent
    let updated_again = h.core.recompute_user("u1", &cancel).await.unwrap();
    assert_eq!(updated_again, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_archive_purge_respects_retention_window() {
    let h = harness();
    let cancel = CancelToken::new();
    let id = seed_item(
        &h,
        SeedSpec {
            score: 0.5,
            ..SeedSpec::new("u1", "work", "soon to be archived")
        },
    )
    .await;

    h.core.delete_memory("u1", id).await.unwrap();
    // Archived, not yet purged: invisible to get/list, still in the store
    assert!(h.core.get_memory("u1", id).is_err());
    assert!(h.core.store().get_raw("u1", id).unwrap().is_some());

    // Fresh archive survives the purge (SHORT window is 7 days)
    let erased = h.core.purge_user("u1", &cancel).await.unwrap();
    assert_eq!(erased, 0);

    // Age the archive stamp past the window, then purge erases it
    h.core
        .store()
        .mutate("u1", id, |item| {
            item.archived_at = Some(Utc::now() - chrono::Duration::days(8));
        })
        .unwrap();
    let erased = h.core.purge_user("u1", &cancel).await.unwrap();
    assert_eq!(erased, 1);
    assert!(h.core.store().get_raw("u1", id).unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_scheduler_drives_nightly_sequence_over_core() {
    use acms::config::SchedulerConfig;
    use acms::sched::{JobKind, JobOutcome, Scheduler};

    let h = harness();
    for i in 0..3 {
        let text = work_note(i);
        seed_item(
            &h,
            SeedSpec {
                tier: Tier::Mid,
                score: 0.85,
                age_days: 8,
                access_count: 4,
                thumbs_up: 4,
                ..SeedSpec::new("u1", "work", &text)
            },
        )
        .await;
    }

    let scheduler = Scheduler::new(h.core.clone(), &SchedulerConfig::default()).unwrap();
    for kind in [
        JobKind::CrsRecompute,
        JobKind::TierEvaluation,
        JobKind::Consolidation,
        JobKind::KeyRotation,
        JobKind::ArchivePurge,
    ] {
        let run = scheduler.run_job(kind).await;
        assert_eq!(run.outcome, JobOutcome::Completed, "{kind:?}");
    }
    assert_eq!(scheduler.history().len(), 5);

    // Recompute lowered the crafted scores, so evaluation planned no
    // promotions and the three items are still live MID items
    let (items, total) = h.core.list_memories("u1", Some("work"), None, 0, 10).unwrap();
    assert_eq!(total, 3);
    for item in &items {
        assert!((0.0..=1.0).contains(&item.item.score));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_key_rotation_keeps_existing_items_readable() {
    let h = harness();
    let cancel = CancelToken::new();
    let receipt = h
        .core
        .ingest("u1", "work", "pre-rotation content", Deadline::none())
        .await
        .unwrap();

    let rotated = h.core.rotate_keys(&cancel).await.unwrap();
    assert_eq!(rotated, 1);

    // Old item still decrypts under its recorded key id
    let item = h.core.get_memory("u1", receipt.item_id).unwrap();
    assert_eq!(item.text, "pre-rotation content");

    // An edit re-encrypts under the new version
    let before = h.core.store().get_raw("u1", receipt.item_id).unwrap().unwrap();
    h.core
        .edit_memory("u1", receipt.item_id, "post-rotation content", Deadline::none())
        .await
        .unwrap();
    let after = h.core.store().get_raw("u1", receipt.item_id).unwrap().unwrap();
    assert_ne!(before.key_id, after.key_id);
    assert!(after.key_id.ends_with("/v2"));
}
