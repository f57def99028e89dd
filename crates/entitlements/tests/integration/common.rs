use dojogate_entitlements::{
    EntitlementEngine, EntitlementStore, InMemoryAddonLedger, InMemoryAuditSink,
    InMemoryEntitlementStore,
};
use dojogate_shared::{Feature, Plan, SubscriptionStatus, TenantSubscription};
use std::sync::Arc;
use time::macros::datetime;
use time::OffsetDateTime;
use uuid::Uuid;

pub const T0: OffsetDateTime = datetime!(2024-05-01 09:00 UTC);

pub fn feature(key: &str, trialable: bool, addon_sellable: bool) -> Feature {
    Feature {
        key: key.to_string(),
        display_name: key.to_uppercase(),
        description: None,
        trialable,
        addon_sellable,
        trial_days: 14,
    }
}

pub fn plan(name: &str, price: i64, features: &[&str]) -> Plan {
    Plan {
        name: name.to_string(),
        display_name: name.to_string(),
        included_features: features.iter().map(|k| k.to_string()).collect(),
        price_monthly_cents: price,
        price_yearly_cents: price * 10,
        visible: true,
    }
}

pub struct Harness {
    pub store: Arc<InMemoryEntitlementStore>,
    pub billing: Arc<InMemoryAddonLedger>,
    pub audit: Arc<InMemoryAuditSink>,
    pub engine: EntitlementEngine,
}

impl Harness {
    /// Catalog: `calendar` (not trialable), `sepa` and `exams` (trialable, sellable).
    /// Plans: `starter` (calendar), `professional` (calendar, sepa).
    pub async fn new() -> Self {
        Self::with_batch_size(500).await
    }

    pub async fn with_batch_size(batch_size: i64) -> Self {
        let store = Arc::new(InMemoryEntitlementStore::new());
        for f in [
            feature("calendar", false, false),
            feature("sepa", true, true),
            feature("exams", true, true),
        ] {
            store.insert_feature(&f).await.unwrap();
        }
        store.upsert_plan(&plan("starter", 1900, &["calendar"])).await.unwrap();
        store
            .upsert_plan(&plan("professional", 4900, &["calendar", "sepa"]))
            .await
            .unwrap();

        let billing = Arc::new(InMemoryAddonLedger::new());
        billing.set_price("sepa", 900);
        let audit = Arc::new(InMemoryAuditSink::new());

        let engine = EntitlementEngine::new(store.clone(), billing.clone(), audit.clone(), batch_size)
            .await
            .unwrap();

        Self {
            store,
            billing,
            audit,
            engine,
        }
    }

    /// Another engine on the same store, as a second process (worker or API replica) would have
    pub async fn second_engine(&self) -> EntitlementEngine {
        EntitlementEngine::new(self.store.clone(), self.billing.clone(), self.audit.clone(), 500)
            .await
            .unwrap()
    }

    pub fn onboard(&self, plan_name: &str, status: SubscriptionStatus) -> Uuid {
        let tenant_id = Uuid::new_v4();
        self.store
            .put_subscription(TenantSubscription::new(tenant_id, plan_name, status))
            .unwrap();
        tenant_id
    }
}
