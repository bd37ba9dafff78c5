//! Tier transition application
//!
//! Takes a [`TransitionPlan`] from the CRS engine and applies it: demotions
//! move immediately, promotions pass the policy gate first and then flow
//! through consolidation grouping. Consent-blocked promotions are skipped
//! and counted; the policy engine audits each denial.

use std::sync::Arc;

use crate::crs::{PlannedTransition, TransitionPlan};
use crate::deadline::{CancelToken, Deadline};
use crate::error::{CoreError, CoreResult};
use crate::policy::PolicyEngine;
use crate::store::HybridStore;
use crate::tier::consolidation::{ConsolidationReport, Consolidator};

/// Summary of one applied plan
#[derive(Debug, Default)]
pub struct TierReport {
    /// Demotions applied
    pub demoted: usize,
    /// Promotions blocked by the PII consent gate
    pub consent_blocked: usize,
    /// Consolidation outcome for the surviving promotions
    pub consolidation: ConsolidationReport,
}

/// Applies evaluated tier transitions for one user at a time
pub struct TierManager {
    store: Arc<HybridStore>,
    policy: Arc<PolicyEngine>,
    consolidator: Arc<Consolidator>,
}

impl TierManager {
    /// Wire a manager over the store, policy engine, and consolidator
    pub fn new(
        store: Arc<HybridStore>,
        policy: Arc<PolicyEngine>,
        consolidator: Arc<Consolidator>,
    ) -> Self {
        Self {
            store,
            policy,
            consolidator,
        }
    }

    /// Apply a transition plan for one user
    pub async fn apply(
        &self,
        user_id: &str,
        plan: TransitionPlan,
        deadline: Deadline,
        cancel: &CancelToken,
    ) -> CoreResult<TierReport> {
        let mut report = TierReport::default();

        for demotion in &plan.demotions {
            cancel.check("tier demotion")?;
            self.store
                .transition_tier(user_id, demotion.item_id, demotion.to, demotion.reason)?;
            report.demoted += 1;
        }

        // Promotions pass the consent gate before any grouping; a blocked
        // item stays exactly where it is.
        let mut admitted: Vec<PlannedTransition> = Vec::with_capacity(plan.promotions.len());
        for promotion in plan.promotions {
            cancel.check("tier promotion")?;
            let Some(item) = self.store.get_raw(user_id, promotion.item_id)? else {
                continue;
            };
            match self.policy.gate_promotion(&item, promotion.to) {
                Ok(()) => admitted.push(promotion),
                Err(CoreError::PiiConsentRequired { .. }) => {
                    report.consent_blocked += 1;
                }
                Err(other) => return Err(other),
            }
        }

        report.consolidation = self
            .consolidator
            .run(user_id, &admitted, deadline, cancel)
            .await?;
        Ok(report)
    }
}
