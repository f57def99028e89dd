//! Manual per-dojo feature overrides (admin)

use dojogate_shared::TenantSubscription;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{fact_type, record_best_effort, AuditFact, AuditSink};
use crate::catalog::CatalogCache;
use crate::error::{EntitlementError, EntitlementResult};
use crate::store::EntitlementStore;

pub struct OverrideService {
    store: Arc<dyn EntitlementStore>,
    catalog: Arc<CatalogCache>,
    audit: Arc<dyn AuditSink>,
}

impl OverrideService {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        catalog: Arc<CatalogCache>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            catalog,
            audit,
        }
    }

    /// Set (`Some`) or remove (`None`) one override. Trials are left alone.
    pub async fn set_override(
        &self,
        tenant_id: Uuid,
        feature_key: &str,
        allow: Option<bool>,
        now: OffsetDateTime,
    ) -> EntitlementResult<TenantSubscription> {
        let changes = BTreeMap::from([(feature_key.to_string(), allow)]);
        self.set_overrides(tenant_id, &changes, now).await
    }

    /// Apply a batch of overrides as one write. Every key is checked before
    /// anything is written, and a failed write leaves no key applied.
    pub async fn set_overrides(
        &self,
        tenant_id: Uuid,
        changes: &BTreeMap<String, Option<bool>>,
        now: OffsetDateTime,
    ) -> EntitlementResult<TenantSubscription> {
        let mut unknown = Vec::new();
        for key in changes.keys() {
            if self.catalog.feature(key).await?.is_none() {
                unknown.push(key.as_str());
            }
        }
        if !unknown.is_empty() {
            return Err(EntitlementError::NotFound(format!(
                "Unknown feature keys: {}",
                unknown.join(", ")
            )));
        }

        let subscription = self.store.set_overrides(tenant_id, changes).await?;
        for (key, allow) in changes {
            self.audit_change(tenant_id, key, *allow, now).await;
        }
        Ok(subscription)
    }

    async fn audit_change(
        &self,
        tenant_id: Uuid,
        feature_key: &str,
        allow: Option<bool>,
        now: OffsetDateTime,
    ) {
        let fact = match allow {
            Some(allowed) => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    feature_key = %feature_key,
                    allowed,
                    "Feature override set"
                );
                AuditFact::new(
                    Some(tenant_id),
                    fact_type::OVERRIDE_SET,
                    json!({ "feature_key": feature_key, "allowed": allowed }),
                    now,
                )
            }
            None => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    feature_key = %feature_key,
                    "Feature override cleared"
                );
                AuditFact::new(
                    Some(tenant_id),
                    fact_type::OVERRIDE_CLEARED,
                    json!({ "feature_key": feature_key }),
                    now,
                )
            }
        };
        record_best_effort(self.audit.as_ref(), fact).await;
    }
}
