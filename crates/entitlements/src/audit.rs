//! Audit facts for entitlement state changes
//!
//! Every trial transition and every override/plan edit produces one fact.
//! Fact types are constants so the audit table never sees typos.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Mutex;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{EntitlementError, EntitlementResult};

/// Fact types written to the audit table
pub mod fact_type {
    /// A dojo started a feature trial
    pub const TRIAL_STARTED: &str = "trial_started";

    /// A trial was cancelled before it ran out
    pub const TRIAL_CANCELLED: &str = "trial_cancelled";

    /// The sweep closed a trial without a paid follow-up
    pub const TRIAL_EXPIRED: &str = "trial_expired";

    /// The sweep closed a trial whose feature is now paid for
    pub const TRIAL_CONVERTED: &str = "trial_converted";

    /// An admin set an explicit allow/deny for a feature
    pub const OVERRIDE_SET: &str = "override_set";

    /// An admin removed an override
    pub const OVERRIDE_CLEARED: &str = "override_cleared";

    /// An admin redefined the feature set of a plan
    pub const PLAN_FEATURES_CHANGED: &str = "plan_features_changed";

    /// A new feature key was added to the registry
    pub const FEATURE_REGISTERED: &str = "feature_registered";
}

/// One append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditFact {
    pub id: Uuid,
    /// `None` for catalog-wide facts (plan and feature edits)
    pub tenant_id: Option<Uuid>,
    pub fact_type: String,
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl AuditFact {
    pub fn new(
        tenant_id: Option<Uuid>,
        fact_type: &str,
        payload: Value,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            fact_type: fact_type.to_string(),
            payload,
            created_at,
        }
    }
}

/// Receives a fact for every state change
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, fact: AuditFact) -> EntitlementResult<()>;
}

/// Record a fact, logging instead of failing when the sink rejects it.
/// The state change has already committed by the time this runs.
pub async fn record_best_effort(sink: &dyn AuditSink, fact: AuditFact) {
    let fact_type = fact.fact_type.clone();
    let tenant_id = fact.tenant_id;
    if let Err(e) = sink.record(fact).await {
        tracing::warn!(
            fact_type = %fact_type,
            tenant_id = ?tenant_id,
            error = %e,
            error_code = e.code(),
            "Failed to record audit fact"
        );
    }
}

/// Writes facts to `feature_audit_log`
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, fact: AuditFact) -> EntitlementResult<()> {
        sqlx::query(
            r#"
            INSERT INTO feature_audit_log (id, dojo_id, fact_type, payload_json, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(fact.id)
        .bind(fact.tenant_id)
        .bind(&fact.fact_type)
        .bind(sqlx::types::Json(&fact.payload))
        .bind(fact.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Keeps facts in memory; used by tests and local development
#[derive(Default)]
pub struct InMemoryAuditSink {
    facts: Mutex<Vec<AuditFact>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn facts(&self) -> Vec<AuditFact> {
        self.facts.lock().map(|f| f.clone()).unwrap_or_default()
    }

    pub fn facts_of_type(&self, fact_type: &str) -> Vec<AuditFact> {
        self.facts()
            .into_iter()
            .filter(|f| f.fact_type == fact_type)
            .collect()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, fact: AuditFact) -> EntitlementResult<()> {
        self.facts
            .lock()
            .map_err(|_| EntitlementError::Unavailable("audit sink lock poisoned".to_string()))?
            .push(fact);
        Ok(())
    }
}
