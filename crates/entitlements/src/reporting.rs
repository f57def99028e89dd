//! Read-only trial reporting for the admin dashboard

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::addons::BillingCollaborator;
use crate::error::EntitlementResult;
use crate::store::{EntitlementStore, FeatureTrialCounts};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialStats {
    pub active: i64,
    pub expired: i64,
    pub converted: i64,
    pub cancelled: i64,
    /// `converted / (converted + expired + cancelled)`, 0 with no closed trials
    pub conversion_rate: f64,
    /// Feature with the most trials ever started (ties broken by key)
    pub top_feature: Option<String>,
    pub addon_mrr_cents: i64,
    pub by_feature: Vec<FeatureTrialCounts>,
}

impl TrialStats {
    pub fn from_counts(mut by_feature: Vec<FeatureTrialCounts>, addon_mrr_cents: i64) -> Self {
        by_feature.sort_by(|a, b| a.feature_key.cmp(&b.feature_key));

        let mut totals = FeatureTrialCounts::default();
        for row in &by_feature {
            totals.active += row.active;
            totals.expired += row.expired;
            totals.converted += row.converted;
            totals.cancelled += row.cancelled;
        }

        let closed = totals.converted + totals.expired + totals.cancelled;
        let conversion_rate = if closed == 0 {
            0.0
        } else {
            totals.converted as f64 / closed as f64
        };

        let top_feature = by_feature
            .iter()
            .filter(|row| row.total() > 0)
            // max_by_key keeps the last maximum; iterate in reverse so the smallest key wins ties
            .rev()
            .max_by_key(|row| row.total())
            .map(|row| row.feature_key.clone());

        Self {
            active: totals.active,
            expired: totals.expired,
            converted: totals.converted,
            cancelled: totals.cancelled,
            conversion_rate,
            top_feature,
            addon_mrr_cents,
            by_feature,
        }
    }
}

pub struct TrialReporting {
    store: Arc<dyn EntitlementStore>,
    billing: Arc<dyn BillingCollaborator>,
}

impl TrialReporting {
    pub fn new(store: Arc<dyn EntitlementStore>, billing: Arc<dyn BillingCollaborator>) -> Self {
        Self { store, billing }
    }

    pub async fn stats(&self) -> EntitlementResult<TrialStats> {
        let (counts, mrr) = tokio::try_join!(
            self.store.trial_counts_by_feature(),
            self.billing.monthly_addon_revenue(),
        )?;
        Ok(TrialStats::from_counts(counts, mrr))
    }
}
