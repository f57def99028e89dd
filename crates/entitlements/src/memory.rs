//! In-memory [`EntitlementStore`] for tests and local development
//!
//! All state sits behind one `RwLock`, so every trait method is atomic with
//! respect to every other one, including the trial uniqueness check.

use async_trait::async_trait;
use dojogate_shared::{
    Feature, FeatureTrial, Plan, SubscriptionStatus, TenantSubscription, TrialStatus,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{EntitlementError, EntitlementResult};
use crate::store::{CatalogSnapshot, EntitlementStore, FeatureTrialCounts};

#[derive(Default)]
struct State {
    /// Bumped by every catalog write, like the `catalog_version` row
    catalog_version: i64,
    features: BTreeMap<String, Feature>,
    plans: BTreeMap<String, Plan>,
    subscriptions: HashMap<Uuid, TenantSubscription>,
    trials: HashMap<Uuid, FeatureTrial>,
    /// (dojo, feature) -> trial id; the lifetime uniqueness index
    trial_index: HashMap<(Uuid, String), Uuid>,
}

#[derive(Default)]
pub struct InMemoryEntitlementStore {
    state: RwLock<State>,
    sweep_locked: AtomicBool,
    unavailable: AtomicBool,
    failing_trials: RwLock<HashSet<Uuid>>,
    failing_override_keys: RwLock<HashSet<String>>,
}

impl InMemoryEntitlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> EntitlementResult<RwLockReadGuard<'_, State>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EntitlementError::Unavailable("store offline".to_string()));
        }
        self.state
            .read()
            .map_err(|_| EntitlementError::Unavailable("store lock poisoned".to_string()))
    }

    fn write(&self) -> EntitlementResult<RwLockWriteGuard<'_, State>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EntitlementError::Unavailable("store offline".to_string()));
        }
        self.state
            .write()
            .map_err(|_| EntitlementError::Unavailable("store lock poisoned".to_string()))
    }

    /// Onboard a dojo or replace its subscription record
    pub fn put_subscription(&self, subscription: TenantSubscription) -> EntitlementResult<()> {
        self.write()?
            .subscriptions
            .insert(subscription.tenant_id, subscription);
        Ok(())
    }

    /// Move a dojo to another plan (plan upgrades are owned by billing)
    pub fn change_plan(&self, tenant_id: Uuid, plan_name: &str) -> EntitlementResult<()> {
        let mut state = self.write()?;
        let sub = state
            .subscriptions
            .get_mut(&tenant_id)
            .ok_or_else(|| EntitlementError::NotFound(format!("Dojo {} not found", tenant_id)))?;
        sub.plan_name = plan_name.to_string();
        Ok(())
    }

    pub fn set_status(&self, tenant_id: Uuid, status: SubscriptionStatus) -> EntitlementResult<()> {
        let mut state = self.write()?;
        let sub = state
            .subscriptions
            .get_mut(&tenant_id)
            .ok_or_else(|| EntitlementError::NotFound(format!("Dojo {} not found", tenant_id)))?;
        sub.status = status;
        Ok(())
    }

    /// Simulate a storage outage for every call
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make any `set_overrides` batch touching `feature_key` fail with `Unavailable`
    /// once it reaches that key
    pub fn fail_override_writes_for(&self, feature_key: &str, failing: bool) {
        if let Ok(mut set) = self.failing_override_keys.write() {
            if failing {
                set.insert(feature_key.to_string());
            } else {
                set.remove(feature_key);
            }
        }
    }

    /// Make `close_trial` fail with `Unavailable` for one trial
    pub fn fail_closes_for(&self, trial_id: Uuid, failing: bool) {
        if let Ok(mut set) = self.failing_trials.write() {
            if failing {
                set.insert(trial_id);
            } else {
                set.remove(&trial_id);
            }
        }
    }
}

#[async_trait]
impl EntitlementStore for InMemoryEntitlementStore {
    async fn load_catalog(&self) -> EntitlementResult<CatalogSnapshot> {
        let state = self.read()?;
        Ok(CatalogSnapshot {
            version: state.catalog_version,
            features: state.features.values().cloned().collect(),
            plans: state.plans.values().cloned().collect(),
        })
    }

    async fn catalog_version(&self) -> EntitlementResult<i64> {
        Ok(self.read()?.catalog_version)
    }

    async fn plan_includes(&self, plan_name: &str, feature_key: &str) -> EntitlementResult<bool> {
        Ok(self
            .read()?
            .plans
            .get(plan_name)
            .map(|p| p.includes(feature_key))
            .unwrap_or(false))
    }

    async fn insert_feature(&self, feature: &Feature) -> EntitlementResult<()> {
        let mut state = self.write()?;
        if state.features.contains_key(&feature.key) {
            return Err(EntitlementError::Conflict(format!(
                "Feature '{}' already exists",
                feature.key
            )));
        }
        state.features.insert(feature.key.clone(), feature.clone());
        state.catalog_version += 1;
        Ok(())
    }

    async fn upsert_plan(&self, plan: &Plan) -> EntitlementResult<Plan> {
        let mut state = self.write()?;
        state.plans.insert(plan.name.clone(), plan.clone());
        state.catalog_version += 1;
        Ok(plan.clone())
    }

    async fn set_plan_features(
        &self,
        plan_name: &str,
        features: &BTreeSet<String>,
    ) -> EntitlementResult<Plan> {
        let mut state = self.write()?;
        let plan = state
            .plans
            .get_mut(plan_name)
            .ok_or_else(|| EntitlementError::NotFound(format!("Plan '{}' not found", plan_name)))?;
        plan.included_features = features.clone();
        let saved = plan.clone();
        state.catalog_version += 1;
        Ok(saved)
    }

    async fn subscription(&self, tenant_id: Uuid) -> EntitlementResult<Option<TenantSubscription>> {
        Ok(self.read()?.subscriptions.get(&tenant_id).cloned())
    }

    async fn set_overrides(
        &self,
        tenant_id: Uuid,
        changes: &BTreeMap<String, Option<bool>>,
    ) -> EntitlementResult<TenantSubscription> {
        let failing = self
            .failing_override_keys
            .read()
            .map(|set| set.clone())
            .unwrap_or_default();

        let mut state = self.write()?;
        let sub = state
            .subscriptions
            .get_mut(&tenant_id)
            .ok_or_else(|| EntitlementError::NotFound(format!("Dojo {} not found", tenant_id)))?;

        // Staged on a copy and swapped in only when every key applied
        let mut overrides = sub.feature_overrides.clone();
        for (feature_key, allow) in changes {
            if failing.contains(feature_key) {
                return Err(EntitlementError::Unavailable(format!(
                    "override write for '{}' failed",
                    feature_key
                )));
            }
            match allow {
                Some(allowed) => {
                    overrides.insert(feature_key.clone(), *allowed);
                }
                None => {
                    overrides.remove(feature_key);
                }
            }
        }
        sub.feature_overrides = overrides;
        Ok(sub.clone())
    }

    async fn trial(&self, trial_id: Uuid) -> EntitlementResult<Option<FeatureTrial>> {
        Ok(self.read()?.trials.get(&trial_id).cloned())
    }

    async fn trial_for(
        &self,
        tenant_id: Uuid,
        feature_key: &str,
    ) -> EntitlementResult<Option<FeatureTrial>> {
        let state = self.read()?;
        Ok(state
            .trial_index
            .get(&(tenant_id, feature_key.to_string()))
            .and_then(|id| state.trials.get(id))
            .cloned())
    }

    async fn trials_for_tenant(&self, tenant_id: Uuid) -> EntitlementResult<Vec<FeatureTrial>> {
        let state = self.read()?;
        let mut trials: Vec<FeatureTrial> = state
            .trials
            .values()
            .filter(|t| t.tenant_id == tenant_id)
            .cloned()
            .collect();
        trials.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(trials)
    }

    async fn insert_trial(&self, trial: &FeatureTrial) -> EntitlementResult<()> {
        let mut state = self.write()?;
        let index_key = (trial.tenant_id, trial.feature_key.clone());
        if state.trial_index.contains_key(&index_key) {
            return Err(EntitlementError::Conflict(format!(
                "Dojo {} already had a trial of '{}'",
                trial.tenant_id, trial.feature_key
            )));
        }
        state.trial_index.insert(index_key, trial.id);
        state.trials.insert(trial.id, trial.clone());
        Ok(())
    }

    async fn close_trial(
        &self,
        trial_id: Uuid,
        status: TrialStatus,
        ended_at: OffsetDateTime,
        cancel_reason: Option<&str>,
    ) -> EntitlementResult<Option<FeatureTrial>> {
        let failing = self
            .failing_trials
            .read()
            .map(|set| set.contains(&trial_id))
            .unwrap_or(false);
        if failing {
            return Err(EntitlementError::Unavailable(format!(
                "write to trial {} failed",
                trial_id
            )));
        }

        let mut state = self.write()?;
        match state.trials.get_mut(&trial_id) {
            Some(trial) if trial.status == TrialStatus::Active => {
                trial.status = status;
                trial.ended_at = Some(ended_at);
                trial.cancel_reason = cancel_reason.map(str::to_string);
                Ok(Some(trial.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn due_trials(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> EntitlementResult<Vec<FeatureTrial>> {
        let state = self.read()?;
        let mut due: Vec<FeatureTrial> = state
            .trials
            .values()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        due.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(due)
    }

    async fn trial_counts_by_feature(&self) -> EntitlementResult<Vec<FeatureTrialCounts>> {
        let state = self.read()?;
        let mut counts: BTreeMap<String, FeatureTrialCounts> = BTreeMap::new();
        for trial in state.trials.values() {
            counts
                .entry(trial.feature_key.clone())
                .or_insert_with(|| FeatureTrialCounts {
                    feature_key: trial.feature_key.clone(),
                    ..Default::default()
                })
                .bump(trial.status);
        }
        Ok(counts.into_values().collect())
    }

    async fn try_lock_sweep(&self) -> EntitlementResult<bool> {
        Ok(self
            .sweep_locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok())
    }

    async fn unlock_sweep(&self) -> EntitlementResult<()> {
        self.sweep_locked.store(false, Ordering::SeqCst);
        Ok(())
    }
}
