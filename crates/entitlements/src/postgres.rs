//! Postgres implementation of [`EntitlementStore`]

use async_trait::async_trait;
use dojogate_shared::{
    Feature, FeatureTrial, Plan, SubscriptionStatus, TenantSubscription, TrialStatus,
};
use sqlx::{pool::PoolConnection, PgPool, Postgres};
use std::collections::{BTreeMap, BTreeSet};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{EntitlementError, EntitlementResult};
use crate::store::{CatalogSnapshot, EntitlementStore, FeatureTrialCounts};

/// Advisory lock key held by the running sweep ("DOJOSWEP")
const SWEEP_LOCK_KEY: i64 = 0x444F_4A4F_5357_4550;

const TRIAL_COLUMNS: &str =
    "id, dojo_id, feature_key, started_at, expires_at, status, ended_at, cancel_reason";

pub struct PgEntitlementStore {
    pool: PgPool,
    /// Session-level advisory locks belong to one connection, so the sweep
    /// pins the connection it locked on until it unlocks.
    sweep_conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgEntitlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            sweep_conn: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_plan(&self, plan_name: &str) -> EntitlementResult<Option<Plan>> {
        let row: Option<(String, String, i64, i64, bool)> = sqlx::query_as(
            r#"
            SELECT name, display_name, price_monthly_cents, price_yearly_cents, visible
            FROM subscription_plans
            WHERE name = $1
            "#,
        )
        .bind(plan_name)
        .fetch_optional(&self.pool)
        .await?;

        let Some((name, display_name, price_monthly_cents, price_yearly_cents, visible)) = row
        else {
            return Ok(None);
        };

        let keys: Vec<(String,)> =
            sqlx::query_as("SELECT feature_key FROM plan_features WHERE plan_name = $1")
                .bind(plan_name)
                .fetch_all(&self.pool)
                .await?;

        Ok(Some(Plan {
            name,
            display_name,
            included_features: keys.into_iter().map(|(k,)| k).collect(),
            price_monthly_cents,
            price_yearly_cents,
            visible,
        }))
    }
}

fn parse_status(raw: &str) -> EntitlementResult<SubscriptionStatus> {
    raw.parse()
        .map_err(|e: dojogate_shared::DomainError| EntitlementError::Unavailable(e.to_string()))
}

#[async_trait]
impl EntitlementStore for PgEntitlementStore {
    async fn load_catalog(&self) -> EntitlementResult<CatalogSnapshot> {
        // Version first: rows read afterwards are at least this new
        let version = self.catalog_version().await?;

        let features: Vec<Feature> = sqlx::query_as(
            r#"
            SELECT key, display_name, description, trialable, addon_sellable, trial_days
            FROM features
            ORDER BY key
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let plan_rows: Vec<(String, String, i64, i64, bool)> = sqlx::query_as(
            r#"
            SELECT name, display_name, price_monthly_cents, price_yearly_cents, visible
            FROM subscription_plans
            ORDER BY price_monthly_cents, name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mappings: Vec<(String, String)> =
            sqlx::query_as("SELECT plan_name, feature_key FROM plan_features")
                .fetch_all(&self.pool)
                .await?;

        let mut included: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (plan_name, feature_key) in mappings {
            included.entry(plan_name).or_default().insert(feature_key);
        }

        let plans = plan_rows
            .into_iter()
            .map(
                |(name, display_name, price_monthly_cents, price_yearly_cents, visible)| Plan {
                    included_features: included.remove(&name).unwrap_or_default(),
                    name,
                    display_name,
                    price_monthly_cents,
                    price_yearly_cents,
                    visible,
                },
            )
            .collect();

        Ok(CatalogSnapshot {
            version,
            features,
            plans,
        })
    }

    async fn catalog_version(&self) -> EntitlementResult<i64> {
        let (version,): (i64,) = sqlx::query_as("SELECT version FROM catalog_version WHERE id")
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }

    async fn plan_includes(&self, plan_name: &str, feature_key: &str) -> EntitlementResult<bool> {
        let (included,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM plan_features WHERE plan_name = $1 AND feature_key = $2
            )
            "#,
        )
        .bind(plan_name)
        .bind(feature_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(included)
    }

    async fn insert_feature(&self, feature: &Feature) -> EntitlementResult<()> {
        sqlx::query(
            r#"
            INSERT INTO features (key, display_name, description, trialable, addon_sellable, trial_days)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&feature.key)
        .bind(&feature.display_name)
        .bind(&feature.description)
        .bind(feature.trialable)
        .bind(feature.addon_sellable)
        .bind(feature.trial_days)
        .execute(&self.pool)
        .await
        .map_err(|e| match EntitlementError::from(e) {
            EntitlementError::Conflict(_) => {
                EntitlementError::Conflict(format!("Feature '{}' already exists", feature.key))
            }
            other => other,
        })?;

        Ok(())
    }

    async fn upsert_plan(&self, plan: &Plan) -> EntitlementResult<Plan> {
        let keys: Vec<String> = plan.included_features.iter().cloned().collect();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO subscription_plans (name, display_name, price_monthly_cents, price_yearly_cents, visible)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                price_monthly_cents = EXCLUDED.price_monthly_cents,
                price_yearly_cents = EXCLUDED.price_yearly_cents,
                visible = EXCLUDED.visible,
                updated_at = NOW()
            "#,
        )
        .bind(&plan.name)
        .bind(&plan.display_name)
        .bind(plan.price_monthly_cents)
        .bind(plan.price_yearly_cents)
        .bind(plan.visible)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM plan_features WHERE plan_name = $1")
            .bind(&plan.name)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO plan_features (plan_name, feature_key) SELECT $1, UNNEST($2::TEXT[])",
        )
        .bind(&plan.name)
        .bind(&keys)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.load_plan(&plan.name)
            .await?
            .ok_or_else(|| EntitlementError::NotFound(format!("Plan '{}' not found", plan.name)))
    }

    async fn set_plan_features(
        &self,
        plan_name: &str,
        features: &BTreeSet<String>,
    ) -> EntitlementResult<Plan> {
        let keys: Vec<String> = features.iter().cloned().collect();
        let mut tx = self.pool.begin().await?;

        // Serialise concurrent edits of the same plan
        let exists: Option<(String,)> =
            sqlx::query_as("SELECT name FROM subscription_plans WHERE name = $1 FOR UPDATE")
                .bind(plan_name)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(EntitlementError::NotFound(format!(
                "Plan '{}' not found",
                plan_name
            )));
        }

        sqlx::query("DELETE FROM plan_features WHERE plan_name = $1")
            .bind(plan_name)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO plan_features (plan_name, feature_key) SELECT $1, UNNEST($2::TEXT[])",
        )
        .bind(plan_name)
        .bind(&keys)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE subscription_plans SET updated_at = NOW() WHERE name = $1")
            .bind(plan_name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        self.load_plan(plan_name)
            .await?
            .ok_or_else(|| EntitlementError::NotFound(format!("Plan '{}' not found", plan_name)))
    }

    async fn subscription(&self, tenant_id: Uuid) -> EntitlementResult<Option<TenantSubscription>> {
        let row: Option<(Uuid, String, String, Option<OffsetDateTime>)> = sqlx::query_as(
            r#"
            SELECT dojo_id, plan_name, status, plan_trial_ends_at
            FROM dojo_subscriptions
            WHERE dojo_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((tenant_id, plan_name, status, plan_trial_ends_at)) = row else {
            return Ok(None);
        };

        let overrides: Vec<(String, bool)> = sqlx::query_as(
            "SELECT feature_key, allowed FROM dojo_feature_overrides WHERE dojo_id = $1",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(TenantSubscription {
            tenant_id,
            plan_name,
            status: parse_status(&status)?,
            plan_trial_ends_at,
            feature_overrides: overrides.into_iter().collect(),
        }))
    }

    async fn set_overrides(
        &self,
        tenant_id: Uuid,
        changes: &BTreeMap<String, Option<bool>>,
    ) -> EntitlementResult<TenantSubscription> {
        let mut tx = self.pool.begin().await?;

        // Row lock serialises concurrent batches for the same dojo
        let exists: Option<(Uuid,)> = sqlx::query_as(
            "SELECT dojo_id FROM dojo_subscriptions WHERE dojo_id = $1 FOR UPDATE",
        )
        .bind(tenant_id)
        .fetch_optional(&mut *tx)
        .await?;
        if exists.is_none() {
            return Err(EntitlementError::NotFound(format!(
                "Dojo {} not found",
                tenant_id
            )));
        }

        for (feature_key, allow) in changes {
            match allow {
                Some(allowed) => {
                    sqlx::query(
                        r#"
                        INSERT INTO dojo_feature_overrides (dojo_id, feature_key, allowed)
                        VALUES ($1, $2, $3)
                        ON CONFLICT (dojo_id, feature_key)
                        DO UPDATE SET allowed = EXCLUDED.allowed, updated_at = NOW()
                        "#,
                    )
                    .bind(tenant_id)
                    .bind(feature_key)
                    .bind(allowed)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query(
                        "DELETE FROM dojo_feature_overrides WHERE dojo_id = $1 AND feature_key = $2",
                    )
                    .bind(tenant_id)
                    .bind(feature_key)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;

        self.subscription(tenant_id)
            .await?
            .ok_or_else(|| EntitlementError::NotFound(format!("Dojo {} not found", tenant_id)))
    }

    async fn trial(&self, trial_id: Uuid) -> EntitlementResult<Option<FeatureTrial>> {
        let trial: Option<FeatureTrial> =
            sqlx::query_as(&format!("SELECT {TRIAL_COLUMNS} FROM feature_trials WHERE id = $1"))
                .bind(trial_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(trial)
    }

    async fn trial_for(
        &self,
        tenant_id: Uuid,
        feature_key: &str,
    ) -> EntitlementResult<Option<FeatureTrial>> {
        let trial: Option<FeatureTrial> = sqlx::query_as(&format!(
            "SELECT {TRIAL_COLUMNS} FROM feature_trials WHERE dojo_id = $1 AND feature_key = $2"
        ))
        .bind(tenant_id)
        .bind(feature_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(trial)
    }

    async fn trials_for_tenant(&self, tenant_id: Uuid) -> EntitlementResult<Vec<FeatureTrial>> {
        let trials: Vec<FeatureTrial> = sqlx::query_as(&format!(
            "SELECT {TRIAL_COLUMNS} FROM feature_trials WHERE dojo_id = $1 ORDER BY started_at DESC"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(trials)
    }

    async fn insert_trial(&self, trial: &FeatureTrial) -> EntitlementResult<()> {
        // UNIQUE (dojo_id, feature_key) decides races: the loser gets 23505.
        sqlx::query(
            r#"
            INSERT INTO feature_trials (id, dojo_id, feature_key, started_at, expires_at, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(trial.id)
        .bind(trial.tenant_id)
        .bind(&trial.feature_key)
        .bind(trial.started_at)
        .bind(trial.expires_at)
        .bind(trial.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| match EntitlementError::from(e) {
            EntitlementError::Conflict(_) => EntitlementError::Conflict(format!(
                "Dojo {} already had a trial of '{}'",
                trial.tenant_id, trial.feature_key
            )),
            other => other,
        })?;

        Ok(())
    }

    async fn close_trial(
        &self,
        trial_id: Uuid,
        status: TrialStatus,
        ended_at: OffsetDateTime,
        cancel_reason: Option<&str>,
    ) -> EntitlementResult<Option<FeatureTrial>> {
        let closed: Option<FeatureTrial> = sqlx::query_as(&format!(
            r#"
            UPDATE feature_trials
            SET status = $2, ended_at = $3, cancel_reason = $4
            WHERE id = $1 AND status = 'active'
            RETURNING {TRIAL_COLUMNS}
            "#
        ))
        .bind(trial_id)
        .bind(status.as_str())
        .bind(ended_at)
        .bind(cancel_reason)
        .fetch_optional(&self.pool)
        .await?;
        Ok(closed)
    }

    async fn due_trials(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> EntitlementResult<Vec<FeatureTrial>> {
        let trials: Vec<FeatureTrial> = sqlx::query_as(&format!(
            r#"
            SELECT {TRIAL_COLUMNS}
            FROM feature_trials
            WHERE status = 'active' AND expires_at <= $1
            ORDER BY expires_at ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(trials)
    }

    async fn trial_counts_by_feature(&self) -> EntitlementResult<Vec<FeatureTrialCounts>> {
        let rows: Vec<(String, i64, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT
                feature_key,
                COUNT(*) FILTER (WHERE status = 'active') AS active,
                COUNT(*) FILTER (WHERE status = 'expired') AS expired,
                COUNT(*) FILTER (WHERE status = 'converted') AS converted,
                COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled
            FROM feature_trials
            GROUP BY feature_key
            ORDER BY feature_key
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(feature_key, active, expired, converted, cancelled)| FeatureTrialCounts {
                    feature_key,
                    active,
                    expired,
                    converted,
                    cancelled,
                },
            )
            .collect())
    }

    async fn try_lock_sweep(&self) -> EntitlementResult<bool> {
        let mut slot = self.sweep_conn.lock().await;
        if slot.is_some() {
            return Ok(false);
        }

        let mut conn = self.pool.acquire().await?;
        let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .bind(SWEEP_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await?;

        if locked {
            *slot = Some(conn);
        }
        Ok(locked)
    }

    async fn unlock_sweep(&self) -> EntitlementResult<()> {
        let Some(mut conn) = self.sweep_conn.lock().await.take() else {
            return Ok(());
        };

        let unlocked = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(SWEEP_LOCK_KEY)
            .execute(&mut *conn)
            .await;

        if let Err(e) = unlocked {
            // Closing the session releases the lock
            tracing::warn!(error = %e, "Failed to release sweep lock, closing connection");
            drop(conn.detach());
            return Err(e.into());
        }
        Ok(())
    }
}
