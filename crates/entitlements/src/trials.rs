//! Feature trial lifecycle: start, cancel, list
//!
//! A dojo may trial each feature at most once in its lifetime. The
//! uniqueness is enforced by storage (`UNIQUE (dojo_id, feature_key)`), so
//! two concurrent starts resolve to one `Ok` and one `Conflict` no matter
//! which instance handles them.

use dojogate_shared::{FeatureTrial, TrialStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{fact_type, record_best_effort, AuditFact, AuditSink};
use crate::catalog::CatalogCache;
use crate::entitlement::{trial_eligibility, Decision, EntitlementService};
use crate::error::{EntitlementError, EntitlementResult};
use crate::store::EntitlementStore;

/// Longest cancel reason kept in the ledger
pub const MAX_CANCEL_REASON_LEN: usize = 500;

/// Result of a successful StartTrial
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedTrial {
    pub trial: FeatureTrial,
    /// Access decision right after the trial was recorded
    pub decision: Decision,
}

pub struct TrialManager {
    store: Arc<dyn EntitlementStore>,
    catalog: Arc<CatalogCache>,
    audit: Arc<dyn AuditSink>,
    entitlements: Arc<EntitlementService>,
}

impl TrialManager {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        catalog: Arc<CatalogCache>,
        audit: Arc<dyn AuditSink>,
        entitlements: Arc<EntitlementService>,
    ) -> Self {
        Self {
            store,
            catalog,
            audit,
            entitlements,
        }
    }

    /// Start a trial of `feature_key` for a dojo.
    ///
    /// Errors:
    /// - `NotFound`: unknown dojo or feature
    /// - `InvalidState`: feature not trialable, or the dojo already has it
    /// - `Conflict`: the dojo has trialed this feature before
    pub async fn start_trial(
        &self,
        tenant_id: Uuid,
        feature_key: &str,
        now: OffsetDateTime,
    ) -> EntitlementResult<StartedTrial> {
        let subscription = self
            .store
            .subscription(tenant_id)
            .await?
            .ok_or_else(|| EntitlementError::NotFound(format!("Dojo {} not found", tenant_id)))?;

        let (feature, plan) = self
            .catalog
            .lookup(feature_key, &subscription.plan_name)
            .await?;
        let feature = feature
            .ok_or_else(|| EntitlementError::NotFound(format!("Unknown feature '{}'", feature_key)))?;

        let existing = self.store.trial_for(tenant_id, feature_key).await?;
        trial_eligibility(&feature, &subscription, plan.as_ref(), existing.as_ref())?;

        let trial = FeatureTrial::begin(tenant_id, &feature, now);
        // A concurrent start for the same pair loses here with Conflict
        self.store.insert_trial(&trial).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            feature_key = %feature_key,
            trial_id = %trial.id,
            expires_at = %trial.expires_at,
            "Feature trial started"
        );

        record_best_effort(
            self.audit.as_ref(),
            AuditFact::new(
                Some(tenant_id),
                fact_type::TRIAL_STARTED,
                json!({
                    "trial_id": trial.id,
                    "feature_key": feature_key,
                    "trial_days": feature.trial_days,
                    "expires_at": trial.expires_at.unix_timestamp(),
                }),
                now,
            ),
        )
        .await;

        let decision = self.entitlements.resolve(tenant_id, feature_key, now).await?;
        Ok(StartedTrial { trial, decision })
    }

    /// Cancel an active trial. `NotFound` when the trial does not exist;
    /// `Conflict` when it already ended.
    pub async fn cancel_trial(
        &self,
        trial_id: Uuid,
        reason: Option<&str>,
        now: OffsetDateTime,
    ) -> EntitlementResult<FeatureTrial> {
        let trial = self
            .store
            .trial(trial_id)
            .await?
            .ok_or_else(|| EntitlementError::NotFound(format!("Trial {} not found", trial_id)))?;
        self.close_cancelled(trial, reason, now).await
    }

    /// Cancel a trial on behalf of a dojo. A trial owned by another dojo is reported as `NotFound`.
    pub async fn cancel_trial_for_tenant(
        &self,
        tenant_id: Uuid,
        trial_id: Uuid,
        reason: Option<&str>,
        now: OffsetDateTime,
    ) -> EntitlementResult<FeatureTrial> {
        let trial = self
            .store
            .trial(trial_id)
            .await?
            .filter(|t| t.tenant_id == tenant_id)
            .ok_or_else(|| EntitlementError::NotFound(format!("Trial {} not found", trial_id)))?;
        self.close_cancelled(trial, reason, now).await
    }

    async fn close_cancelled(
        &self,
        trial: FeatureTrial,
        reason: Option<&str>,
        now: OffsetDateTime,
    ) -> EntitlementResult<FeatureTrial> {
        if trial.status != TrialStatus::Active {
            return Err(not_active(&trial));
        }

        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(|r| truncate(r, MAX_CANCEL_REASON_LEN));

        let closed = self
            .store
            .close_trial(trial.id, TrialStatus::Cancelled, now, reason.as_deref())
            .await?;
        let closed = match closed {
            Some(closed) => closed,
            // Lost a race with the sweep or another cancel
            None => {
                let current = self.store.trial(trial.id).await?.unwrap_or(trial);
                return Err(not_active(&current));
            }
        };

        tracing::info!(
            tenant_id = %closed.tenant_id,
            feature_key = %closed.feature_key,
            trial_id = %closed.id,
            "Feature trial cancelled"
        );

        record_best_effort(
            self.audit.as_ref(),
            AuditFact::new(
                Some(closed.tenant_id),
                fact_type::TRIAL_CANCELLED,
                json!({
                    "trial_id": closed.id,
                    "feature_key": closed.feature_key,
                    "reason": closed.cancel_reason,
                }),
                now,
            ),
        )
        .await;

        Ok(closed)
    }

    /// Every trial a dojo has ever had, newest first
    pub async fn list_trials(&self, tenant_id: Uuid) -> EntitlementResult<Vec<FeatureTrial>> {
        let mut trials = self.store.trials_for_tenant(tenant_id).await?;
        trials.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(trials)
    }
}

fn not_active(trial: &FeatureTrial) -> EntitlementError {
    EntitlementError::Conflict(format!(
        "Trial {} is {}, not active",
        trial.id, trial.status
    ))
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
