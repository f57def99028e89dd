//! Plan / feature catalog cache
//!
//! Read-through cache of the feature registry and the plan catalog. It is
//! populated at startup and refreshed inside every admin edit: the write lock
//! is taken before the store write and released only after the cached entry
//! has been replaced, so once an edit returns no reader can see the feature
//! set it replaced.
//!
//! Edits made by other processes are caught by the catalog version: every
//! read compares the cached version with the store's and reloads when it is
//! behind.

use dojogate_shared::{validate_feature_key, validate_plan_name, Feature, Plan};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::audit::{fact_type, record_best_effort, AuditFact, AuditSink};
use crate::error::{EntitlementError, EntitlementResult};
use crate::store::{CatalogSnapshot, EntitlementStore};

/// Longest trial a feature may offer
pub const MAX_TRIAL_DAYS: i32 = 365;

#[derive(Default)]
struct CatalogIndex {
    version: i64,
    features: HashMap<String, Feature>,
    plans: HashMap<String, Plan>,
    /// `false` before `load` and after `shutdown`
    live: bool,
}

impl CatalogIndex {
    fn from_snapshot(snapshot: CatalogSnapshot) -> Self {
        Self {
            version: snapshot.version,
            features: snapshot
                .features
                .into_iter()
                .map(|f| (f.key.clone(), f))
                .collect(),
            plans: snapshot
                .plans
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect(),
            live: true,
        }
    }

    fn ensure_live(&self) -> EntitlementResult<()> {
        if self.live {
            Ok(())
        } else {
            Err(EntitlementError::Unavailable(
                "feature catalog is not loaded".to_string(),
            ))
        }
    }

    fn check_known_features(&self, keys: &BTreeSet<String>) -> EntitlementResult<()> {
        let unknown: Vec<&str> = keys
            .iter()
            .filter(|k| !self.features.contains_key(k.as_str()))
            .map(String::as_str)
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(EntitlementError::NotFound(format!(
                "Unknown feature keys: {}",
                unknown.join(", ")
            )))
        }
    }
}

fn sorted_features(index: &CatalogIndex) -> Vec<Feature> {
    let mut features: Vec<Feature> = index.features.values().cloned().collect();
    features.sort_by(|a, b| a.key.cmp(&b.key));
    features
}

/// Owned, injected catalog cache (many readers, one writer)
pub struct CatalogCache {
    store: Arc<dyn EntitlementStore>,
    audit: Arc<dyn AuditSink>,
    index: RwLock<CatalogIndex>,
}

impl CatalogCache {
    /// Build the cache and populate it from storage
    pub async fn load(
        store: Arc<dyn EntitlementStore>,
        audit: Arc<dyn AuditSink>,
    ) -> EntitlementResult<Self> {
        let snapshot = store.load_catalog().await?;
        tracing::info!(
            features = snapshot.features.len(),
            plans = snapshot.plans.len(),
            "Feature catalog loaded"
        );
        Ok(Self {
            store,
            audit,
            index: RwLock::new(CatalogIndex::from_snapshot(snapshot)),
        })
    }

    /// Cached index, reloaded first when storage holds a newer catalog version
    async fn current(&self) -> EntitlementResult<RwLockReadGuard<'_, CatalogIndex>> {
        let version = self.store.catalog_version().await?;
        {
            let index = self.index.read().await;
            index.ensure_live()?;
            if index.version >= version {
                return Ok(index);
            }
        }

        let mut index = self.index.write().await;
        self.catch_up(&mut index, version).await?;
        Ok(index.downgrade())
    }

    /// Reload `index` if it is older than `version`
    async fn catch_up(&self, index: &mut CatalogIndex, version: i64) -> EntitlementResult<()> {
        index.ensure_live()?;
        if index.version >= version {
            return Ok(());
        }
        let stale = index.version;
        *index = CatalogIndex::from_snapshot(self.store.load_catalog().await?);
        tracing::info!(
            from_version = stale,
            to_version = index.version,
            "Feature catalog changed in storage, reloaded"
        );
        Ok(())
    }

    /// Write access to an index that is at least as new as storage
    async fn current_mut(&self) -> EntitlementResult<RwLockWriteGuard<'_, CatalogIndex>> {
        let version = self.store.catalog_version().await?;
        let mut index = self.index.write().await;
        self.catch_up(&mut index, version).await?;
        Ok(index)
    }

    pub async fn feature(&self, key: &str) -> EntitlementResult<Option<Feature>> {
        let index = self.current().await?;
        Ok(index.features.get(key).cloned())
    }

    pub async fn plan(&self, name: &str) -> EntitlementResult<Option<Plan>> {
        let index = self.current().await?;
        Ok(index.plans.get(name).cloned())
    }

    /// Feature and plan read under one lock acquisition, so both come from the same catalog version
    pub async fn lookup(
        &self,
        feature_key: &str,
        plan_name: &str,
    ) -> EntitlementResult<(Option<Feature>, Option<Plan>)> {
        let index = self.current().await?;
        Ok((
            index.features.get(feature_key).cloned(),
            index.plans.get(plan_name).cloned(),
        ))
    }

    /// All registered features, sorted by key
    pub async fn features(&self) -> EntitlementResult<Vec<Feature>> {
        let index = self.current().await?;
        Ok(sorted_features(&index))
    }

    /// Features as last loaded, without asking storage for a newer version.
    /// Only for rendering denied entries while storage is down.
    pub async fn cached_features(&self) -> Vec<Feature> {
        let index = self.index.read().await;
        sorted_features(&index)
    }

    /// All plans, cheapest first
    pub async fn plans(&self) -> EntitlementResult<Vec<Plan>> {
        let index = self.current().await?;
        let mut plans: Vec<Plan> = index.plans.values().cloned().collect();
        plans.sort_by(|a, b| {
            a.price_monthly_cents
                .cmp(&b.price_monthly_cents)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(plans)
    }

    /// Add a feature to the registry. Existing keys are never redefined.
    pub async fn register_feature(
        &self,
        feature: Feature,
        now: OffsetDateTime,
    ) -> EntitlementResult<Feature> {
        validate_feature_key(&feature.key)?;
        if feature.display_name.trim().is_empty() {
            return Err(EntitlementError::InvalidState(
                "Feature display name must not be empty".to_string(),
            ));
        }
        if feature.trialable && !(1..=MAX_TRIAL_DAYS).contains(&feature.trial_days) {
            return Err(EntitlementError::InvalidState(format!(
                "Trial length must be between 1 and {} days",
                MAX_TRIAL_DAYS
            )));
        }

        let mut index = self.current_mut().await?;
        if index.features.contains_key(&feature.key) {
            return Err(EntitlementError::Conflict(format!(
                "Feature '{}' already exists",
                feature.key
            )));
        }
        self.store.insert_feature(&feature).await?;
        index.features.insert(feature.key.clone(), feature.clone());
        drop(index);

        tracing::info!(feature_key = %feature.key, trialable = feature.trialable, "Feature registered");
        record_best_effort(
            self.audit.as_ref(),
            AuditFact::new(
                None,
                fact_type::FEATURE_REGISTERED,
                json!({
                    "feature_key": feature.key,
                    "trialable": feature.trialable,
                    "addon_sellable": feature.addon_sellable,
                    "trial_days": feature.trial_days,
                }),
                now,
            ),
        )
        .await;

        Ok(feature)
    }

    /// Create or update a plan, including its feature set
    pub async fn upsert_plan(&self, plan: Plan, now: OffsetDateTime) -> EntitlementResult<Plan> {
        validate_plan_name(&plan.name)?;
        if plan.price_monthly_cents < 0 || plan.price_yearly_cents < 0 {
            return Err(EntitlementError::InvalidState(
                "Plan prices must not be negative".to_string(),
            ));
        }

        let mut index = self.current_mut().await?;
        index.check_known_features(&plan.included_features)?;
        let previous = index.plans.get(&plan.name).map(|p| p.included_features.clone());
        let saved = self.store.upsert_plan(&plan).await?;
        index.plans.insert(saved.name.clone(), saved.clone());
        drop(index);

        self.audit_plan_change(&saved, previous, now).await;
        Ok(saved)
    }

    /// Redefine which features a plan includes. Tenants on the plan see the
    /// new set on their next access check.
    pub async fn set_plan_features(
        &self,
        plan_name: &str,
        features: BTreeSet<String>,
        now: OffsetDateTime,
    ) -> EntitlementResult<Plan> {
        let mut index = self.current_mut().await?;
        let previous = index
            .plans
            .get(plan_name)
            .map(|p| p.included_features.clone())
            .ok_or_else(|| EntitlementError::NotFound(format!("Plan '{}' not found", plan_name)))?;
        index.check_known_features(&features)?;
        let saved = self.store.set_plan_features(plan_name, &features).await?;
        index.plans.insert(saved.name.clone(), saved.clone());
        drop(index);

        self.audit_plan_change(&saved, Some(previous), now).await;
        Ok(saved)
    }

    async fn audit_plan_change(
        &self,
        plan: &Plan,
        previous: Option<BTreeSet<String>>,
        now: OffsetDateTime,
    ) {
        let previous = previous.unwrap_or_default();
        let added: Vec<&String> = plan.included_features.difference(&previous).collect();
        let removed: Vec<&String> = previous.difference(&plan.included_features).collect();

        tracing::info!(
            plan = %plan.name,
            added = ?added,
            removed = ?removed,
            "Plan feature set changed"
        );
        record_best_effort(
            self.audit.as_ref(),
            AuditFact::new(
                None,
                fact_type::PLAN_FEATURES_CHANGED,
                json!({
                    "plan": plan.name,
                    "features": plan.included_features,
                    "added": added,
                    "removed": removed,
                }),
                now,
            ),
        )
        .await;
    }

    /// Re-read the whole catalog from storage (operator-triggered)
    pub async fn reload(&self) -> EntitlementResult<()> {
        let mut index = self.index.write().await;
        let snapshot = self.store.load_catalog().await?;
        *index = CatalogIndex::from_snapshot(snapshot);
        tracing::info!(
            features = index.features.len(),
            plans = index.plans.len(),
            "Feature catalog reloaded"
        );
        Ok(())
    }

    /// Drop all cached entries; later reads fail with `Unavailable`
    pub async fn shutdown(&self) {
        let mut index = self.index.write().await;
        *index = CatalogIndex::default();
        tracing::info!("Feature catalog cache torn down");
    }
}
