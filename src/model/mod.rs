//! Core data model
//!
//! The memory item and its satellite records: tier lifecycle events,
//! consolidation events, query logs, outcome events, and the per-user
//! profile. All cross-record references are by opaque id; no record holds a
//! pointer to another.

pub mod events;
pub mod item;
pub mod profile;

pub use events::{
    ConsolidationEvent, OutcomeEvent, OutcomeKind, QueryLogRecord, TierTransitionEvent,
    TransitionReason,
};
pub use item::{DecryptedItem, MemoryItem, PiiFlags, Tier, TopicId, SCHEMA_VERSION};
pub use profile::{TopicCentroid, UserProfile};
