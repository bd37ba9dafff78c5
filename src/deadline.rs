//! Deadlines and cooperative cancellation
//!
//! Every suspending operation in the core accepts a [`Deadline`] and a
//! [`CancelToken`]. Deadlines bound individual awaits via
//! `tokio::time::timeout`; cancellation is cooperative, checked between
//! items by batch jobs and between stages by the rehydration pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{CoreError, CoreResult};

/// An absolute point in time an operation must finish by.
///
/// `Deadline::none()` never expires; requests without an explicit deadline
/// use it.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// A deadline `timeout` from now
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Some(Instant::now() + timeout),
        }
    }

    /// A deadline that never expires
    pub fn none() -> Self {
        Self { at: None }
    }

    /// Time remaining, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has already passed
    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }

    /// Bound a future by this deadline.
    ///
    /// Returns `DeadlineExceeded(stage)` if the deadline passes before the
    /// future completes.
    pub async fn bound<F, T>(&self, stage: &str, fut: F) -> CoreResult<T>
    where
        F: std::future::Future<Output = T>,
    {
        match self.remaining() {
            None => Ok(fut.await),
            Some(d) if d.is_zero() => Err(CoreError::DeadlineExceeded(stage.to_string())),
            Some(d) => tokio::time::timeout(d, fut)
                .await
                .map_err(|_| CoreError::DeadlineExceeded(stage.to_string())),
        }
    }

    /// Fail fast if the deadline already expired
    pub fn check(&self, stage: &str) -> CoreResult<()> {
        if self.expired() {
            return Err(CoreError::DeadlineExceeded(stage.to_string()));
        }
        Ok(())
    }
}

/// Cooperative cancellation handle.
///
/// Cloning shares the underlying flag; jobs check it between items, the
/// rehydration pipeline between stages. Cancellation rolls back nothing that
/// already committed.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// A fresh, uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to all clones
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been signalled
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Error out if cancelled, for use at suspension points
    pub fn check(&self, stage: &str) -> CoreResult<()> {
        if self.is_cancelled() {
            return Err(CoreError::DeadlineExceeded(format!("{stage} (cancelled)")));
        }
        Ok(())
    }
}
