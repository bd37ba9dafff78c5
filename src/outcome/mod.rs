//! # Outcome logger
//!
//! Records feedback, edit-distance, and completion events, links them to
//! the items used in the originating query's bundle, and feeds the CRS
//! engine's outcome and corrections inputs. Events may arrive out of order
//! relative to their query; they are applied in arrival order and are
//! commutative in effect on the score components.

use std::sync::Arc;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::{OutcomeEvent, OutcomeKind, QueryLogRecord};
use crate::store::backend::EventFamily;
use crate::store::HybridStore;

/// Records outcomes against the items of past queries
pub struct OutcomeLogger {
    store: Arc<HybridStore>,
    /// Per-item outcome log cap, oldest evicted
    log_cap: usize,
}

impl OutcomeLogger {
    /// Create a logger over the store
    pub fn new(store: Arc<HybridStore>, log_cap: usize) -> Self {
        Self { store, log_cap }
    }

    /// Persist a query-log record (called by the rehydration side-effect
    /// path; stores content hashes only, never the text)
    pub fn log_query(&self, record: &QueryLogRecord) -> CoreResult<()> {
        self.store.backend().put_query_log(record)?;
        Ok(())
    }

    /// Record one outcome event for a past query.
    ///
    /// The event is appended to every item that was used in that query's
    /// bundle and to the user's outcome event trail. Unknown query ids are
    /// rejected: there is nothing to link the outcome to.
    pub fn record(&self, user_id: &str, query_id: Uuid, kind: OutcomeKind) -> CoreResult<usize> {
        kind.validate().map_err(CoreError::Validation)?;

        let record = self
            .store
            .backend()
            .get_query_log(user_id, query_id)?
            .ok_or_else(|| CoreError::NotFound(format!("query {query_id}")))?;

        let event = OutcomeEvent::new(query_id, kind);
        let payload = bincode::serialize(&event).map_err(CoreError::internal)?;
        self.store
            .backend()
            .append_event(EventFamily::Outcome, user_id, &payload)?;

        let mut touched = 0;
        for item_id in &record.item_ids {
            // Items may have been erased or consolidated since the query;
            // skip silently rather than failing the whole event.
            match self.store.get_raw(user_id, *item_id)? {
                Some(_) => {
                    let cap = self.log_cap;
                    let event = event.clone();
                    self.store.mutate(user_id, *item_id, move |item| {
                        item.push_outcome(event.clone(), cap);
                    })?;
                    touched += 1;
                }
                None => continue,
            }
        }

        tracing::debug!(
            user_id,
            query_id = %query_id,
            items = touched,
            "outcome recorded"
        );
        Ok(touched)
    }
}
