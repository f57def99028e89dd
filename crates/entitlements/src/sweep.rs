//! Trial expiry sweep
//!
//! Advances every due trial (`status = active`, `expires_at <= now`) to a
//! terminal state. Runs from the worker on a timer and from the operator
//! endpoint. Each trial is closed by its own conditional update, so a failure
//! on one trial leaves earlier ones committed and the failed one is picked
//! up again on the next tick.
//!
//! A run executes on its own task. Dropping the caller's future (a timed-out
//! request, a cancelled job) leaves the run going to completion, and the
//! completed run always releases the sweep lock.

use dojogate_shared::{FeatureTrial, TrialStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use time::OffsetDateTime;

use crate::addons::BillingCollaborator;
use crate::audit::{fact_type, record_best_effort, AuditFact, AuditSink};
use crate::error::{EntitlementError, EntitlementResult};
use crate::store::EntitlementStore;

/// Default number of due trials handled per tick
pub const DEFAULT_SWEEP_BATCH_SIZE: i64 = 500;

/// Outcome of one sweep run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Due trials fetched in this batch
    pub examined: usize,
    pub expired: usize,
    pub converted: usize,
    /// Closed by someone else (usually a cancel) between fetch and update
    pub skipped: usize,
    pub failed: usize,
    /// Another sweep held the lock; nothing was processed
    pub lock_held: bool,
}

impl SweepReport {
    /// Trials this run moved to a terminal state
    pub fn processed(&self) -> usize {
        self.expired + self.converted
    }
}

#[derive(Clone)]
pub struct TrialSweeper {
    store: Arc<dyn EntitlementStore>,
    billing: Arc<dyn BillingCollaborator>,
    audit: Arc<dyn AuditSink>,
    batch_size: i64,
}

impl TrialSweeper {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        billing: Arc<dyn BillingCollaborator>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            billing,
            audit,
            batch_size: DEFAULT_SWEEP_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn batch_size(&self) -> i64 {
        self.batch_size
    }

    /// Run one sweep at `now`.
    ///
    /// Errors only when the lock or the batch query cannot be read; failures
    /// on individual trials are counted in the report instead.
    pub async fn run(&self, now: OffsetDateTime) -> EntitlementResult<SweepReport> {
        let sweeper = self.clone();
        tokio::spawn(async move { sweeper.run_locked(now).await })
            .await
            .map_err(|e| EntitlementError::Unavailable(format!("trial sweep task failed: {e}")))?
    }

    async fn run_locked(&self, now: OffsetDateTime) -> EntitlementResult<SweepReport> {
        if !self.store.try_lock_sweep().await? {
            tracing::info!("Trial sweep already running elsewhere, skipping");
            return Ok(SweepReport {
                lock_held: true,
                ..SweepReport::default()
            });
        }

        let result = self.sweep_batch(now).await;

        if let Err(e) = self.store.unlock_sweep().await {
            tracing::warn!(error = %e, error_code = e.code(), "Failed to release trial sweep lock");
        }

        let report = result?;
        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                expired = report.expired,
                converted = report.converted,
                skipped = report.skipped,
                failed = report.failed,
                "Trial sweep finished"
            );
        }
        Ok(report)
    }

    async fn sweep_batch(&self, now: OffsetDateTime) -> EntitlementResult<SweepReport> {
        let due = self.store.due_trials(now, self.batch_size).await?;
        let mut report = SweepReport {
            examined: due.len(),
            ..SweepReport::default()
        };

        for trial in due {
            match self.close_one(&trial, now).await {
                Ok(Some(TrialStatus::Converted)) => report.converted += 1,
                Ok(Some(_)) => report.expired += 1,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        trial_id = %trial.id,
                        tenant_id = %trial.tenant_id,
                        feature_key = %trial.feature_key,
                        error = %e,
                        error_code = e.code(),
                        "Failed to close due trial, will retry next tick"
                    );
                }
            }
        }

        Ok(report)
    }

    /// Close one due trial. `None` when it was no longer active.
    async fn close_one(
        &self,
        trial: &FeatureTrial,
        now: OffsetDateTime,
    ) -> EntitlementResult<Option<TrialStatus>> {
        let outcome = if self.is_owned(trial).await? {
            TrialStatus::Converted
        } else {
            TrialStatus::Expired
        };

        let Some(closed) = self.store.close_trial(trial.id, outcome, now, None).await? else {
            tracing::debug!(trial_id = %trial.id, "Trial already closed, skipping");
            return Ok(None);
        };

        let fact = match outcome {
            TrialStatus::Converted => fact_type::TRIAL_CONVERTED,
            _ => fact_type::TRIAL_EXPIRED,
        };
        record_best_effort(
            self.audit.as_ref(),
            AuditFact::new(
                Some(closed.tenant_id),
                fact,
                json!({
                    "trial_id": closed.id,
                    "feature_key": closed.feature_key,
                    "expires_at": closed.expires_at.unix_timestamp(),
                }),
                now,
            ),
        )
        .await;

        Ok(Some(outcome))
    }

    /// Whether a paid source already grants the feature: an active add-on or
    /// the current plan. Overrides are admin grants, not purchases.
    ///
    /// Plan membership is read from storage, not the catalog cache, so an
    /// upgrade committed by any process counts.
    async fn is_owned(&self, trial: &FeatureTrial) -> EntitlementResult<bool> {
        if self
            .billing
            .is_addon_active(trial.tenant_id, &trial.feature_key)
            .await?
        {
            return Ok(true);
        }

        let subscription = self
            .store
            .subscription(trial.tenant_id)
            .await?
            .ok_or_else(|| {
                EntitlementError::NotFound(format!("Dojo {} not found", trial.tenant_id))
            })?;
        if !subscription.status.grants_plan_features() {
            return Ok(false);
        }
        self.store
            .plan_includes(&subscription.plan_name, &trial.feature_key)
            .await
    }
}
