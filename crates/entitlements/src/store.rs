//! Persistence contract for the entitlement engine
//!
//! Two implementations ship with the crate: [`crate::postgres::PgEntitlementStore`]
//! for deployments and [`crate::memory::InMemoryEntitlementStore`] for tests and
//! local development. Both enforce the same rules:
//!
//! - at most one trial row per (dojo, feature), ever; a second insert is a `Conflict`
//! - trial closes are conditional on `status = 'active'`
//! - only one sweep holds the sweep lock at a time

use async_trait::async_trait;
use dojogate_shared::{Feature, FeatureTrial, Plan, TenantSubscription, TrialStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::EntitlementResult;

/// Everything the catalog cache holds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogSnapshot {
    /// Catalog version at or before the moment the rows were read
    pub version: i64,
    pub features: Vec<Feature>,
    pub plans: Vec<Plan>,
}

/// Trial counts for one feature, grouped by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureTrialCounts {
    pub feature_key: String,
    pub active: i64,
    pub expired: i64,
    pub converted: i64,
    pub cancelled: i64,
}

impl FeatureTrialCounts {
    pub fn total(&self) -> i64 {
        self.active + self.expired + self.converted + self.cancelled
    }

    pub fn bump(&mut self, status: TrialStatus) {
        match status {
            TrialStatus::Active => self.active += 1,
            TrialStatus::Expired => self.expired += 1,
            TrialStatus::Converted => self.converted += 1,
            TrialStatus::Cancelled => self.cancelled += 1,
        }
    }
}

#[async_trait]
pub trait EntitlementStore: Send + Sync {
    // --- catalog ---

    async fn load_catalog(&self) -> EntitlementResult<CatalogSnapshot>;

    /// Current catalog version. Grows with every committed catalog write, from any process.
    async fn catalog_version(&self) -> EntitlementResult<i64>;

    /// Whether `plan_name` includes `feature_key` right now, read from storage
    async fn plan_includes(&self, plan_name: &str, feature_key: &str) -> EntitlementResult<bool>;

    /// Insert a new feature. An existing key is a `Conflict`; features are never renamed.
    async fn insert_feature(&self, feature: &Feature) -> EntitlementResult<()>;

    /// Create or update a plan's metadata and feature set
    async fn upsert_plan(&self, plan: &Plan) -> EntitlementResult<Plan>;

    /// Replace the feature set of an existing plan (`NotFound` when the plan is unknown)
    async fn set_plan_features(
        &self,
        plan_name: &str,
        features: &BTreeSet<String>,
    ) -> EntitlementResult<Plan>;

    // --- tenant subscriptions ---

    async fn subscription(&self, tenant_id: Uuid) -> EntitlementResult<Option<TenantSubscription>>;

    /// Upsert (`Some`) or delete (`None`) a batch of overrides, all or nothing.
    /// `NotFound` for unknown dojos.
    async fn set_overrides(
        &self,
        tenant_id: Uuid,
        changes: &BTreeMap<String, Option<bool>>,
    ) -> EntitlementResult<TenantSubscription>;

    // --- trial ledger ---

    async fn trial(&self, trial_id: Uuid) -> EntitlementResult<Option<FeatureTrial>>;

    async fn trial_for(
        &self,
        tenant_id: Uuid,
        feature_key: &str,
    ) -> EntitlementResult<Option<FeatureTrial>>;

    async fn trials_for_tenant(&self, tenant_id: Uuid) -> EntitlementResult<Vec<FeatureTrial>>;

    /// Insert a trial; losing a race on (dojo, feature) yields `Conflict`
    async fn insert_trial(&self, trial: &FeatureTrial) -> EntitlementResult<()>;

    /// Move an `active` trial to a terminal status.
    /// Returns `None` without writing when the trial is not active any more.
    async fn close_trial(
        &self,
        trial_id: Uuid,
        status: TrialStatus,
        ended_at: OffsetDateTime,
        cancel_reason: Option<&str>,
    ) -> EntitlementResult<Option<FeatureTrial>>;

    /// Active trials with `expires_at <= now`, oldest expiry first
    async fn due_trials(&self, now: OffsetDateTime, limit: i64)
        -> EntitlementResult<Vec<FeatureTrial>>;

    async fn trial_counts_by_feature(&self) -> EntitlementResult<Vec<FeatureTrialCounts>>;

    // --- sweep exclusivity ---

    /// Try to become the only running sweep. `false` when another sweep holds it.
    async fn try_lock_sweep(&self) -> EntitlementResult<bool>;

    async fn unlock_sweep(&self) -> EntitlementResult<()>;
}
