//! Entitlement Resolver
//!
//! Answers "may this dojo use this feature right now, and why?".
//!
//! ## Design Principles
//!
//! 1. **Single Source of Truth**: [`resolve`] is THE function that decides access
//! 2. **Deterministic**: same inputs and the same `now` always give the same decision
//! 3. **Debuggable**: every decision carries its source and a human-readable reason
//! 4. **Read-only**: resolving never writes; stale trial rows are handled by
//!    re-checking `expires_at`, not by repairing them
//!
//! ## Precedence (first match wins)
//!
//! 1. per-dojo override
//! 2. active paid add-on
//! 3. running trial (`status = active` and `now < expires_at`)
//! 4. plan membership, only while the subscription is `trial` or `active`
//! 5. nothing: denied

use dojogate_shared::{
    AccessSource, Feature, FeatureTrial, Plan, TenantSubscription,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::addons::BillingCollaborator;
use crate::catalog::CatalogCache;
use crate::error::{EntitlementError, EntitlementResult};
use crate::store::EntitlementStore;

/// The access decision for one (dojo, feature) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub granted: bool,
    pub source: AccessSource,
    /// Human-readable justification
    pub reason: String,
    /// Whole days left on a running trial (only for `source = trial`)
    pub days_remaining: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_expires_at: Option<OffsetDateTime>,
}

impl Decision {
    fn new(granted: bool, source: AccessSource, reason: impl Into<String>) -> Self {
        Self {
            granted,
            source,
            reason: reason.into(),
            days_remaining: None,
            trial_expires_at: None,
        }
    }

    /// Fail-closed decision used when the state could not be read
    pub fn denied(reason: impl Into<String>) -> Self {
        Self::new(false, AccessSource::None, reason)
    }
}

/// Everything the resolver looks at for one query
#[derive(Debug, Clone, Copy)]
pub struct EntitlementInputs<'a> {
    pub subscription: &'a TenantSubscription,
    /// The dojo's current plan as the catalog knows it right now
    pub plan: Option<&'a Plan>,
    pub addon_active: bool,
    pub trial: Option<&'a FeatureTrial>,
}

/// Whether the current plan grants the feature (membership plus a subscription in good standing)
pub fn plan_grants(feature_key: &str, subscription: &TenantSubscription, plan: Option<&Plan>) -> bool {
    subscription.status.grants_plan_features()
        && plan.map(|p| p.includes(feature_key)).unwrap_or(false)
}

/// Pure decision function. Never reads a clock: `now` is an input.
pub fn resolve(feature_key: &str, inputs: &EntitlementInputs<'_>, now: OffsetDateTime) -> Decision {
    let subscription = inputs.subscription;

    if let Some(allowed) = subscription.override_for(feature_key) {
        let reason = if allowed {
            "Enabled for this dojo by an administrator"
        } else {
            "Disabled for this dojo by an administrator"
        };
        return Decision::new(allowed, AccessSource::Override, reason);
    }

    if inputs.addon_active {
        return Decision::new(true, AccessSource::Addon, "Unlocked by a paid add-on");
    }

    if let Some(trial) = inputs.trial.filter(|t| t.is_running(now)) {
        let days = trial.days_remaining(now);
        return Decision {
            days_remaining: Some(days),
            trial_expires_at: Some(trial.expires_at),
            ..Decision::new(
                true,
                AccessSource::Trial,
                format!("Trial active, {} day(s) remaining", days),
            )
        };
    }

    let in_plan = inputs.plan.map(|p| p.includes(feature_key)).unwrap_or(false);
    if in_plan {
        if subscription.status.grants_plan_features() {
            return Decision::new(
                true,
                AccessSource::Plan,
                format!("Included in plan '{}'", subscription.plan_name),
            );
        }
        return Decision::denied(format!(
            "Included in plan '{}' but the subscription is {}",
            subscription.plan_name, subscription.status
        ));
    }

    Decision::denied(format!(
        "Not included in plan '{}'",
        subscription.plan_name
    ))
}

/// Check the StartTrial preconditions that do not need storage writes
pub fn trial_eligibility(
    feature: &Feature,
    subscription: &TenantSubscription,
    plan: Option<&Plan>,
    existing_trial: Option<&FeatureTrial>,
) -> EntitlementResult<()> {
    if !feature.trialable {
        return Err(EntitlementError::InvalidState(format!(
            "Feature '{}' cannot be trialed",
            feature.key
        )));
    }
    if let Some(trial) = existing_trial {
        return Err(EntitlementError::Conflict(format!(
            "A trial of '{}' already exists for this dojo (status: {})",
            feature.key, trial.status
        )));
    }
    if subscription.override_for(&feature.key) == Some(true) {
        return Err(EntitlementError::InvalidState(format!(
            "Feature '{}' is already enabled for this dojo",
            feature.key
        )));
    }
    if plan_grants(&feature.key, subscription, plan) {
        return Err(EntitlementError::InvalidState(format!(
            "Feature '{}' is already included in plan '{}'",
            feature.key, subscription.plan_name
        )));
    }
    Ok(())
}

/// Decision plus the context a locked-feature screen needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureAccess {
    pub feature_key: String,
    pub decision: Decision,
    pub current_plan: String,
    pub can_start_trial: bool,
    pub had_trial_before: bool,
    /// Monthly price in cents, when the feature is sold as an add-on
    pub addon_price_cents: Option<i64>,
}

/// Loads resolver inputs and applies [`resolve`]
pub struct EntitlementService {
    store: Arc<dyn EntitlementStore>,
    catalog: Arc<CatalogCache>,
    billing: Arc<dyn BillingCollaborator>,
}

/// Inputs loaded for one query, owned
struct LoadedState {
    feature: Feature,
    subscription: TenantSubscription,
    plan: Option<Plan>,
    addon_active: bool,
    trial: Option<FeatureTrial>,
}

impl LoadedState {
    fn inputs(&self) -> EntitlementInputs<'_> {
        EntitlementInputs {
            subscription: &self.subscription,
            plan: self.plan.as_ref(),
            addon_active: self.addon_active,
            trial: self.trial.as_ref(),
        }
    }
}

impl EntitlementService {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        catalog: Arc<CatalogCache>,
        billing: Arc<dyn BillingCollaborator>,
    ) -> Self {
        Self {
            store,
            catalog,
            billing,
        }
    }

    async fn subscription(&self, tenant_id: Uuid) -> EntitlementResult<TenantSubscription> {
        self.store
            .subscription(tenant_id)
            .await?
            .ok_or_else(|| EntitlementError::NotFound(format!("Dojo {} not found", tenant_id)))
    }

    async fn load(
        &self,
        subscription: TenantSubscription,
        feature_key: &str,
    ) -> EntitlementResult<LoadedState> {
        let (feature, plan) = self
            .catalog
            .lookup(feature_key, &subscription.plan_name)
            .await?;
        let feature = feature
            .ok_or_else(|| EntitlementError::NotFound(format!("Unknown feature '{}'", feature_key)))?;
        if plan.is_none() {
            tracing::warn!(
                tenant_id = %subscription.tenant_id,
                plan = %subscription.plan_name,
                "Dojo is on a plan missing from the catalog"
            );
        }

        let tenant_id = subscription.tenant_id;
        let (trial, addon_active) = tokio::try_join!(
            self.store.trial_for(tenant_id, feature_key),
            self.billing.is_addon_active(tenant_id, feature_key),
        )?;

        Ok(LoadedState {
            feature,
            subscription,
            plan,
            addon_active,
            trial,
        })
    }

    /// Resolve access for one dojo and feature at `now`
    pub async fn resolve(
        &self,
        tenant_id: Uuid,
        feature_key: &str,
        now: OffsetDateTime,
    ) -> EntitlementResult<Decision> {
        let subscription = self.subscription(tenant_id).await?;
        let state = self.load(subscription, feature_key).await?;
        Ok(resolve(feature_key, &state.inputs(), now))
    }

    /// Resolve access and gather the details for a locked-state screen
    pub async fn check_access(
        &self,
        tenant_id: Uuid,
        feature_key: &str,
        now: OffsetDateTime,
    ) -> EntitlementResult<FeatureAccess> {
        let subscription = self.subscription(tenant_id).await?;
        self.access_for(subscription, feature_key, now).await
    }

    /// Access view for every registered feature
    pub async fn list_access(
        &self,
        tenant_id: Uuid,
        now: OffsetDateTime,
    ) -> EntitlementResult<Vec<FeatureAccess>> {
        let subscription = self.subscription(tenant_id).await?;
        let features = self.catalog.features().await?;
        let mut result = Vec::with_capacity(features.len());
        for feature in features {
            result.push(
                self.access_for(subscription.clone(), &feature.key, now)
                    .await?,
            );
        }
        Ok(result)
    }

    async fn access_for(
        &self,
        subscription: TenantSubscription,
        feature_key: &str,
        now: OffsetDateTime,
    ) -> EntitlementResult<FeatureAccess> {
        let state = self.load(subscription, feature_key).await?;
        let decision = resolve(feature_key, &state.inputs(), now);

        let can_start_trial = trial_eligibility(
            &state.feature,
            &state.subscription,
            state.plan.as_ref(),
            state.trial.as_ref(),
        )
        .is_ok();

        let addon_price_cents = if state.feature.addon_sellable {
            self.billing.addon_price(feature_key).await?
        } else {
            None
        };

        tracing::debug!(
            tenant_id = %state.subscription.tenant_id,
            feature_key = %feature_key,
            granted = decision.granted,
            source = %decision.source,
            "Feature access resolved"
        );

        Ok(FeatureAccess {
            feature_key: feature_key.to_string(),
            current_plan: state.subscription.plan_name.clone(),
            had_trial_before: state.trial.is_some(),
            can_start_trial,
            addon_price_cents,
            decision,
        })
    }
}
