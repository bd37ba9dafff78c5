//! # ACMS - Adaptive Context Memory System
//!
//! A local-first, per-user memory engine for AI assistants. Text artifacts
//! are encrypted and indexed on ingest, continuously scored for long-term
//! value, moved through a three-tier retention hierarchy with consolidation,
//! and assembled into token-bounded context bundles at query time.
//!
//! ## Architecture
//!
//! - `crypto`: envelope encryption, per-topic key partitioning, hardware
//!   custody backends
//! - `llm`: pluggable embedder/summarizer backends
//! - `store`: encrypted hybrid store (metadata index + vector index +
//!   event logs)
//! - `crs`: Context Retention Score engine and tier-transition evaluation
//! - `policy`: PII detection, compliance filtering, consent gating,
//!   export/erasure
//! - `tier`: tier lifecycle, promotion consolidation, archive retention
//! - `rehydrate`: query → context-bundle pipeline with caching
//! - `outcome`: feedback capture linked to past queries
//! - `audit`: chain-hashed per-user audit trail
//! - `sched`: cron-driven maintenance jobs
//! - `boundary`: typed external surface (sessions, rate limits, wire
//!   errors)
//! - `core`: component wiring and the per-user write paths

#![warn(missing_docs)]
#![warn(clippy::all)]

// Shared foundations
pub mod config;
pub mod deadline;
pub mod error;
pub mod model;

// Crypto and key custody
pub mod crypto;

// Embedder / summarizer backends
pub mod llm;

// Storage and indices
pub mod store;

// Audit trail
pub mod audit;

// Scoring and lifecycle
pub mod crs;
pub mod policy;
pub mod tier;

// Query path
pub mod outcome;
pub mod rehydrate;

// Maintenance
pub mod sched;

// External surface and wiring
pub mod boundary;
pub mod core;

// Re-export commonly used types
pub use crate::core::{DeletionReport, ExportHandle, IngestReceipt, MemoryCore};
pub use boundary::{BoundaryAdapter, WireError};
pub use config::CoreConfig;
pub use deadline::{CancelToken, Deadline};
pub use error::{CoreError, CoreResult};
pub use model::{DecryptedItem, MemoryItem, Tier, TopicId};
pub use rehydrate::{ContextBundle, Intent};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize the tracing subscriber from `RUST_LOG`. Call once at process
/// start; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
