//! Per-user rate limiting
//!
//! Token buckets per `(user, operation class)`: ingests and queries refill
//! per minute, exports per day. Denials carry a retry-after hint for the
//! wire response.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Instant;

use crate::config::RateLimitConfig;
use crate::error::{CoreError, CoreResult};

/// Operation classes with independent budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    /// Memory ingestion
    Ingest,
    /// Rehydration queries
    Query,
    /// Export bundle production
    Export,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: u64, refill_per_sec: f64) -> Self {
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> Result<(), u64> {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = Instant::now();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err((deficit / self.refill_per_sec).ceil() as u64)
        }
    }
}

/// Per-user token-bucket rate limiter
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<(String, OpClass), Mutex<Bucket>>,
}

impl RateLimiter {
    /// Create a limiter with the configured budgets
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    fn bucket_params(&self, op: OpClass) -> (u64, f64) {
        match op {
            OpClass::Ingest => (
                self.config.ingests_per_minute,
                self.config.ingests_per_minute as f64 / 60.0,
            ),
            OpClass::Query => (
                self.config.queries_per_minute,
                self.config.queries_per_minute as f64 / 60.0,
            ),
            OpClass::Export => (
                self.config.exports_per_day,
                self.config.exports_per_day as f64 / 86_400.0,
            ),
        }
    }

    /// Admit one operation or fail with `RateLimited` and a retry-after
    /// hint
    pub fn check(&self, user_id: &str, op: OpClass) -> CoreResult<()> {
        let (capacity, refill) = self.bucket_params(op);
        let key = (user_id.to_string(), op);
        let bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| Mutex::new(Bucket::new(capacity, refill)));
        let result = bucket.lock().try_take();
        match result {
            Ok(()) => Ok(()),
            Err(retry_after_secs) => {
                tracing::debug!(user_id, op = ?op, retry_after_secs, "rate limited");
                Err(CoreError::RateLimited { retry_after_secs })
            }
        }
    }

    /// Drop a user's buckets (account destruction)
    pub fn forget_user(&self, user_id: &str) {
        self.buckets.retain(|(user, _), _| user != user_id);
    }
}
