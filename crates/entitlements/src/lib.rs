//! DojoGate entitlement engine
//!
//! Decides whether a dojo may use a feature (override > add-on > trial >
//! plan > none) and owns the lifecycle of feature trials.

pub mod addons;
pub mod audit;
pub mod catalog;
pub mod entitlement;
pub mod error;
pub mod memory;
pub mod overrides;
pub mod postgres;
pub mod reporting;
pub mod store;
pub mod sweep;
pub mod trials;

use sqlx::PgPool;
use std::sync::Arc;

pub use addons::{BillingCollaborator, InMemoryAddonLedger, PgAddonLedger};
pub use audit::{AuditFact, AuditSink, InMemoryAuditSink, PgAuditSink};
pub use catalog::CatalogCache;
pub use entitlement::{resolve, Decision, EntitlementInputs, EntitlementService, FeatureAccess};
pub use error::{EntitlementError, EntitlementResult};
pub use memory::InMemoryEntitlementStore;
pub use overrides::OverrideService;
pub use postgres::PgEntitlementStore;
pub use reporting::{TrialReporting, TrialStats};
pub use store::{CatalogSnapshot, EntitlementStore, FeatureTrialCounts};
pub use sweep::{SweepReport, TrialSweeper, DEFAULT_SWEEP_BATCH_SIZE};
pub use trials::{StartedTrial, TrialManager};

/// All engine services wired against one store, one billing collaborator and one audit sink
#[derive(Clone)]
pub struct EntitlementEngine {
    pub catalog: Arc<CatalogCache>,
    pub entitlements: Arc<EntitlementService>,
    pub trials: Arc<TrialManager>,
    pub sweeper: Arc<TrialSweeper>,
    pub overrides: Arc<OverrideService>,
    pub reporting: Arc<TrialReporting>,
}

impl EntitlementEngine {
    /// Load the catalog and build every service
    pub async fn new(
        store: Arc<dyn EntitlementStore>,
        billing: Arc<dyn BillingCollaborator>,
        audit: Arc<dyn AuditSink>,
        sweep_batch_size: i64,
    ) -> EntitlementResult<Self> {
        let catalog = Arc::new(CatalogCache::load(store.clone(), audit.clone()).await?);
        let entitlements = Arc::new(EntitlementService::new(
            store.clone(),
            catalog.clone(),
            billing.clone(),
        ));
        let trials = Arc::new(TrialManager::new(
            store.clone(),
            catalog.clone(),
            audit.clone(),
            entitlements.clone(),
        ));
        let sweeper = Arc::new(
            TrialSweeper::new(store.clone(), billing.clone(), audit.clone())
                .with_batch_size(sweep_batch_size),
        );
        let overrides = Arc::new(OverrideService::new(store.clone(), catalog.clone(), audit));
        let reporting = Arc::new(TrialReporting::new(store, billing));

        Ok(Self {
            catalog,
            entitlements,
            trials,
            sweeper,
            overrides,
            reporting,
        })
    }

    /// Engine backed by Postgres for storage, add-ons and audit
    pub async fn postgres(pool: PgPool, sweep_batch_size: i64) -> EntitlementResult<Self> {
        Self::new(
            Arc::new(PgEntitlementStore::new(pool.clone())),
            Arc::new(PgAddonLedger::new(pool.clone())),
            Arc::new(PgAuditSink::new(pool)),
            sweep_batch_size,
        )
        .await
    }

    /// Tear down process-wide state (the catalog cache)
    pub async fn shutdown(&self) {
        self.catalog.shutdown().await;
    }
}
