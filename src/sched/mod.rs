//! # Scheduler
//!
//! Drives the periodic maintenance jobs — CRS batch recompute, tier
//! evaluation, consolidation, key rotation, archive purge — on cron
//! cadences with per-user isolation, cooperative cancellation, and bounded
//! exponential-backoff retries. Job runs are recorded in a queryable
//! history ring.

pub mod scheduler;

pub use scheduler::{JobKind, JobOutcome, JobRun, MaintenanceTarget, Scheduler};
