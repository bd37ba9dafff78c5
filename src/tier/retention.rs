//! Archive retention
//!
//! Archived items stay queryable only through export/audit until their
//! retention window expires, after which they are physically erased. Each
//! record's data key dies with the record (the wrapped DEK exists only
//! inside the deleted blob); topic keys are destroyed separately when a
//! whole topic is erased.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::RetentionWindows;
use crate::deadline::CancelToken;
use crate::error::CoreResult;
use crate::model::Tier;
use crate::store::HybridStore;

/// Erases archived items whose retention window has lapsed
pub struct RetentionSweeper {
    store: Arc<HybridStore>,
    windows: RetentionWindows,
}

impl RetentionSweeper {
    /// Create a sweeper with the configured windows
    pub fn new(store: Arc<HybridStore>, windows: RetentionWindows) -> Self {
        Self { store, windows }
    }

    fn window_days(&self, tier: Tier) -> i64 {
        match tier {
            Tier::Short => self.windows.short_days,
            Tier::Mid => self.windows.mid_days,
            Tier::Long => self.windows.long_days,
        }
    }

    /// Purge one user's expired archived items; returns how many were
    /// erased.
    pub fn purge_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        cancel: &CancelToken,
    ) -> CoreResult<usize> {
        let mut expired = Vec::new();
        for item in self.store.scan_raw(user_id)? {
            cancel.check("archive purge")?;
            if !item.archived {
                continue;
            }
            let Some(archived_at) = item.archived_at else {
                continue;
            };
            if (now - archived_at).num_days() >= self.window_days(item.tier) {
                expired.push(item.id);
            }
        }
        if expired.is_empty() {
            return Ok(0);
        }
        let erased = self.store.erase_items(user_id, &expired)?;
        tracing::info!(user_id, erased, "purged expired archived items");
        Ok(erased)
    }
}
