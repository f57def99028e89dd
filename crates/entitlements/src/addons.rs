//! Feature add-ons (billing collaborator)
//!
//! Add-on subscriptions are created and removed by the billing system. The
//! entitlement engine only reads them: whether a dojo has a paid unlock for a
//! feature, what an add-on costs, and how much recurring revenue active
//! add-ons represent.

use async_trait::async_trait;
use dojogate_shared::AddonSubscription;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::{EntitlementError, EntitlementResult};

/// Read-only view of the billing system's add-on state
#[async_trait]
pub trait BillingCollaborator: Send + Sync {
    /// Whether the dojo currently pays for an add-on unlocking `feature_key`
    async fn is_addon_active(&self, tenant_id: Uuid, feature_key: &str) -> EntitlementResult<bool>;

    /// Monthly add-on price in cents, if the feature is sold as an add-on
    async fn addon_price(&self, feature_key: &str) -> EntitlementResult<Option<i64>>;

    /// Sum of monthly prices of all active add-ons, in cents
    async fn monthly_addon_revenue(&self) -> EntitlementResult<i64>;
}

/// Postgres-backed add-on ledger
pub struct PgAddonLedger {
    pool: PgPool,
}

impl PgAddonLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillingCollaborator for PgAddonLedger {
    async fn is_addon_active(&self, tenant_id: Uuid, feature_key: &str) -> EntitlementResult<bool> {
        let (active,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(
                SELECT 1 FROM feature_addons
                WHERE dojo_id = $1 AND feature_key = $2 AND active = true
             )",
        )
        .bind(tenant_id)
        .bind(feature_key)
        .fetch_one(&self.pool)
        .await?;

        Ok(active)
    }

    async fn addon_price(&self, feature_key: &str) -> EntitlementResult<Option<i64>> {
        let price: Option<(i64,)> =
            sqlx::query_as("SELECT monthly_price_cents FROM addon_prices WHERE feature_key = $1")
                .bind(feature_key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(price.map(|(cents,)| cents))
    }

    async fn monthly_addon_revenue(&self) -> EntitlementResult<i64> {
        let (total,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(monthly_price_cents), 0)::BIGINT FROM feature_addons WHERE active = true",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }
}

/// In-process add-on ledger for tests and local development
#[derive(Default)]
pub struct InMemoryAddonLedger {
    addons: RwLock<HashMap<(Uuid, String), AddonSubscription>>,
    prices: RwLock<HashMap<String, i64>>,
    unavailable: AtomicBool,
}

impl InMemoryAddonLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, feature_key: &str, monthly_price_cents: i64) {
        if let Ok(mut prices) = self.prices.write() {
            prices.insert(feature_key.to_string(), monthly_price_cents);
        }
    }

    /// Activate (or replace) an add-on, priced from the price list when known
    pub fn activate(&self, tenant_id: Uuid, feature_key: &str) {
        let price = self
            .prices
            .read()
            .ok()
            .and_then(|p| p.get(feature_key).copied())
            .unwrap_or(0);
        if let Ok(mut addons) = self.addons.write() {
            addons.insert(
                (tenant_id, feature_key.to_string()),
                AddonSubscription {
                    tenant_id,
                    feature_key: feature_key.to_string(),
                    active: true,
                    monthly_price_cents: price,
                },
            );
        }
    }

    pub fn deactivate(&self, tenant_id: Uuid, feature_key: &str) {
        if let Ok(mut addons) = self.addons.write() {
            if let Some(addon) = addons.get_mut(&(tenant_id, feature_key.to_string())) {
                addon.active = false;
            }
        }
    }

    /// Make every call fail with `Unavailable` (simulates billing outage)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> EntitlementResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(EntitlementError::Unavailable("add-on ledger offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BillingCollaborator for InMemoryAddonLedger {
    async fn is_addon_active(&self, tenant_id: Uuid, feature_key: &str) -> EntitlementResult<bool> {
        self.check_available()?;
        let addons = self
            .addons
            .read()
            .map_err(|_| EntitlementError::Unavailable("add-on ledger lock poisoned".to_string()))?;
        Ok(addons
            .get(&(tenant_id, feature_key.to_string()))
            .map(|a| a.active)
            .unwrap_or(false))
    }

    async fn addon_price(&self, feature_key: &str) -> EntitlementResult<Option<i64>> {
        self.check_available()?;
        let prices = self
            .prices
            .read()
            .map_err(|_| EntitlementError::Unavailable("add-on ledger lock poisoned".to_string()))?;
        Ok(prices.get(feature_key).copied())
    }

    async fn monthly_addon_revenue(&self) -> EntitlementResult<i64> {
        self.check_available()?;
        let addons = self
            .addons
            .read()
            .map_err(|_| EntitlementError::Unavailable("add-on ledger lock poisoned".to_string()))?;
        Ok(addons
            .values()
            .filter(|a| a.active)
            .map(|a| a.monthly_price_cents)
            .sum())
    }
}
