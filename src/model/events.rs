//! Lifecycle event records
//!
//! Immutable records appended alongside item mutations: tier transitions,
//! consolidations, query logs, and outcome events. Per user, these form a
//! total order reflecting commit sequence (the store assigns sequence
//! numbers on append).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::item::{Tier, TopicId};

/// Reason a tier transition happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    /// CRS thresholds were met (promotion) or undercut (demotion)
    CrsThreshold,
    /// The item went unused past the inactivity window
    Inactivity,
    /// A PII consent gate blocked a promotion
    PiiBlock,
    /// The user pinned the item, exempting it from a pending demotion
    UserPin,
    /// The item moved as part of a consolidation
    Consolidation,
}

impl TransitionReason {
    /// Stable snake_case code used in events and audit records
    pub fn code(&self) -> &'static str {
        match self {
            TransitionReason::CrsThreshold => "crs_threshold",
            TransitionReason::Inactivity => "inactivity",
            TransitionReason::PiiBlock => "pii_block",
            TransitionReason::UserPin => "user_pin",
            TransitionReason::Consolidation => "consolidation",
        }
    }
}

/// Immutable record of one tier transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierTransitionEvent {
    /// The item that moved
    pub item_id: Uuid,
    /// Owning user
    pub user_id: String,
    /// Tier before the transition
    pub from_tier: Tier,
    /// Tier after the transition
    pub to_tier: Tier,
    /// Retention score at the moment of transition
    pub score: f32,
    /// Why the transition happened
    pub reason: TransitionReason,
    /// When the transition committed
    pub timestamp: DateTime<Utc>,
}

/// Immutable record of one consolidation run for a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationEvent {
    /// Owning user
    pub user_id: String,
    /// Topic the consolidated group shared
    pub topic: TopicId,
    /// Tier the sources were promoted from
    pub source_tier: Tier,
    /// Tier the consolidated item landed in
    pub target_tier: Tier,
    /// Number of source items merged
    pub source_count: usize,
    /// Ids of the produced consolidated items
    pub produced: Vec<Uuid>,
    /// Wall-clock duration of the consolidation, in milliseconds
    pub duration_ms: u64,
    /// When the consolidation committed
    pub timestamp: DateTime<Utc>,
}

/// Query log record. Stores content hashes only, never query text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLogRecord {
    /// Query identifier, returned to the caller inside the bundle
    pub query_id: Uuid,
    /// Owning user
    pub user_id: String,
    /// blake3 hash of the query text, hex-encoded
    pub query_hash: String,
    /// Items used in the returned bundle
    pub item_ids: Vec<Uuid>,
    /// blake3 hash of the bundle summary, hex-encoded
    pub response_hash: String,
    /// When the bundle was returned
    pub timestamp: DateTime<Utc>,
}

/// Kind of a recorded outcome signal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Positive feedback
    ThumbsUp,
    /// Negative feedback
    ThumbsDown,
    /// Star rating, 1-5
    Rating(u8),
    /// Normalized edit distance of the user's revision, in [0, 1]
    EditDistance(f32),
    /// Whether the assisted task completed
    Completed(bool),
    /// Seconds to completion; informational, not a success signal
    CompletionTimeSeconds(f32),
}

impl OutcomeKind {
    /// Derive the success score in [0, 1] this event contributes, if any.
    ///
    /// Completion time carries no success semantics and is excluded from the
    /// aggregate.
    pub fn success_score(&self) -> Option<f32> {
        match self {
            OutcomeKind::ThumbsUp => Some(1.0),
            OutcomeKind::ThumbsDown => Some(0.0),
            OutcomeKind::Rating(r) => Some(if *r >= 4 { 1.0 } else { 0.0 }),
            OutcomeKind::EditDistance(x) => Some(1.0 - (x / 0.5).min(1.0)),
            OutcomeKind::Completed(done) => Some(if *done { 1.0 } else { 0.0 }),
            OutcomeKind::CompletionTimeSeconds(_) => None,
        }
    }

    /// Validate caller-supplied values
    pub fn validate(&self) -> Result<(), String> {
        match self {
            OutcomeKind::Rating(r) if !(1..=5).contains(r) => {
                Err(format!("rating {r} out of 1-5"))
            }
            OutcomeKind::EditDistance(x) if !(0.0..=1.0).contains(x) => {
                Err(format!("edit distance {x} out of [0,1]"))
            }
            OutcomeKind::CompletionTimeSeconds(s) if *s < 0.0 => {
                Err(format!("negative completion time {s}"))
            }
            _ => Ok(()),
        }
    }
}

/// One recorded outcome event, linked to the query it came from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeEvent {
    /// The query this outcome refers to
    pub query_id: Uuid,
    /// What was observed
    pub kind: OutcomeKind,
    /// When the event arrived
    pub timestamp: DateTime<Utc>,
}

impl OutcomeEvent {
    /// Create an event stamped now
    pub fn new(query_id: Uuid, kind: OutcomeKind) -> Self {
        Self {
            query_id,
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Aggregate outcome events into a success rate in [0, 1].
///
/// Arithmetic mean of the derived success scores; 0.5 (neutral) when no
/// event carries a success signal. Application order does not matter.
pub fn aggregate_outcomes(events: &[OutcomeEvent]) -> f32 {
    let scores: Vec<f32> = events.iter().filter_map(|e| e.kind.success_score()).collect();
    if scores.is_empty() {
        return 0.5;
    }
    scores.iter().sum::<f32>() / scores.len() as f32
}

/// Derive the corrections signal in [-1, 1] from edit-distance events.
///
/// Near-verbatim acceptance (small edit distance) validates the item and
/// pushes the signal positive; heavy rewrites repudiate it. Items with no
/// edit-distance events sit at 0.
pub fn corrections_signal(events: &[OutcomeEvent]) -> f32 {
    let edits: Vec<f32> = events
        .iter()
        .filter_map(|e| match e.kind {
            OutcomeKind::EditDistance(x) => Some(1.0 - 2.0 * (x / 0.5).min(1.0)),
            _ => None,
        })
        .collect();
    if edits.is_empty() {
        return 0.0;
    }
    (edits.iter().sum::<f32>() / edits.len() as f32).clamp(-1.0, 1.0)
}
