//! Platform admin routes: overrides, plan feature sets, the operator sweep and reporting

use axum::{
    extract::{Path, State},
    Json,
};
use dojogate_entitlements::{SweepReport, TrialStats};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{error::ApiError, state::AppState};

use super::catalog::PlanResponse;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessExpiredTrialsResponse {
    pub processed: usize,
    #[serde(flatten)]
    pub report: SweepReport,
}

/// POST /api/v1/process-expired-trials
pub async fn process_expired_trials(
    State(state): State<AppState>,
) -> Result<Json<ProcessExpiredTrialsResponse>, ApiError> {
    if !state.config.enable_sweep_endpoint {
        return Err(ApiError::NotFound("Sweep endpoint is disabled".to_string()));
    }

    let report = state.engine.sweeper.run(OffsetDateTime::now_utc()).await?;
    tracing::info!(
        processed = report.processed(),
        failed = report.failed,
        lock_held = report.lock_held,
        "Operator-triggered trial sweep"
    );

    Ok(Json(ProcessExpiredTrialsResponse {
        processed: report.processed(),
        report,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DojoFeaturesResponse {
    pub dojo_id: Uuid,
    pub overrides: BTreeMap<String, bool>,
}

/// PUT /api/v1/dojos/:dojo_id/features
///
/// Body maps feature keys to `true`/`false`, or `null` to remove the override.
pub async fn set_dojo_features(
    State(state): State<AppState>,
    Path(dojo_id): Path<Uuid>,
    Json(changes): Json<BTreeMap<String, Option<bool>>>,
) -> Result<Json<DojoFeaturesResponse>, ApiError> {
    if changes.is_empty() {
        return Err(ApiError::BadRequest("No feature overrides given".to_string()));
    }

    let subscription = state
        .engine
        .overrides
        .set_overrides(dojo_id, &changes, OffsetDateTime::now_utc())
        .await?;

    Ok(Json(DojoFeaturesResponse {
        dojo_id,
        overrides: subscription.feature_overrides,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SetPlanFeaturesRequest {
    pub features: BTreeSet<String>,
}

/// PUT /api/v1/subscription-plans/:plan_name/features
pub async fn set_plan_features(
    State(state): State<AppState>,
    Path(plan_name): Path<String>,
    Json(req): Json<SetPlanFeaturesRequest>,
) -> Result<Json<PlanResponse>, ApiError> {
    let plan = state
        .engine
        .catalog
        .set_plan_features(&plan_name, req.features, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(plan.into()))
}

/// GET /api/v1/admin/feature-trials/stats
pub async fn trial_stats(State(state): State<AppState>) -> Result<Json<TrialStats>, ApiError> {
    Ok(Json(state.engine.reporting.stats().await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadCatalogResponse {
    pub features: usize,
    pub plans: usize,
}

/// POST /api/v1/admin/catalog/reload
pub async fn reload_catalog(
    State(state): State<AppState>,
) -> Result<Json<ReloadCatalogResponse>, ApiError> {
    state.engine.catalog.reload().await?;
    Ok(Json(ReloadCatalogResponse {
        features: state.engine.catalog.features().await?.len(),
        plans: state.engine.catalog.plans().await?.len(),
    }))
}
