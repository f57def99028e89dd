//! Feature registry and plan catalog routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use dojogate_shared::{Feature, Plan};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use time::OffsetDateTime;

use crate::{error::ApiError, state::AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureResponse {
    pub key: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub trialable: bool,
    pub addon_sellable: bool,
    pub trial_days: i32,
}

impl From<Feature> for FeatureResponse {
    fn from(f: Feature) -> Self {
        Self {
            key: f.key,
            display_name: f.display_name,
            description: f.description,
            trialable: f.trialable,
            addon_sellable: f.addon_sellable,
            trial_days: f.trial_days,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResponse {
    pub name: String,
    pub display_name: String,
    pub features: BTreeSet<String>,
    pub price_monthly_cents: i64,
    pub price_yearly_cents: i64,
    pub visible: bool,
}

impl From<Plan> for PlanResponse {
    fn from(p: Plan) -> Self {
        Self {
            name: p.name,
            display_name: p.display_name,
            features: p.included_features,
            price_monthly_cents: p.price_monthly_cents,
            price_yearly_cents: p.price_yearly_cents,
            visible: p.visible,
        }
    }
}

/// GET /api/v1/features
pub async fn list_features(
    State(state): State<AppState>,
) -> Result<Json<Vec<FeatureResponse>>, ApiError> {
    let features = state.engine.catalog.features().await?;
    Ok(Json(features.into_iter().map(Into::into).collect()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterFeatureRequest {
    pub key: String,
    pub display_name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub trialable: bool,
    #[serde(default)]
    pub addon_sellable: bool,
    pub trial_days: Option<i32>,
}

/// POST /api/v1/features (platform admin)
pub async fn register_feature(
    State(state): State<AppState>,
    Json(req): Json<RegisterFeatureRequest>,
) -> Result<(StatusCode, Json<FeatureResponse>), ApiError> {
    let feature = Feature {
        key: req.key.trim().to_string(),
        display_name: req.display_name.trim().to_string(),
        description: req.description.filter(|d| !d.trim().is_empty()),
        trialable: req.trialable,
        addon_sellable: req.addon_sellable,
        trial_days: req.trial_days.unwrap_or(state.config.default_trial_days),
    };

    let feature = state
        .engine
        .catalog
        .register_feature(feature, OffsetDateTime::now_utc())
        .await?;
    Ok((StatusCode::CREATED, Json(feature.into())))
}

/// GET /api/v1/subscription-plans
pub async fn list_plans(State(state): State<AppState>) -> Result<Json<Vec<PlanResponse>>, ApiError> {
    let plans = state.engine.catalog.plans().await?;
    Ok(Json(plans.into_iter().map(Into::into).collect()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertPlanRequest {
    pub display_name: String,
    #[serde(default)]
    pub features: BTreeSet<String>,
    pub price_monthly_cents: i64,
    pub price_yearly_cents: i64,
    #[serde(default = "default_visible")]
    pub visible: bool,
}

fn default_visible() -> bool {
    true
}

/// PUT /api/v1/subscription-plans/:plan_name (platform admin)
pub async fn upsert_plan(
    State(state): State<AppState>,
    Path(plan_name): Path<String>,
    Json(req): Json<UpsertPlanRequest>,
) -> Result<Json<PlanResponse>, ApiError> {
    let plan = Plan {
        name: plan_name,
        display_name: req.display_name,
        included_features: req.features,
        price_monthly_cents: req.price_monthly_cents,
        price_yearly_cents: req.price_yearly_cents,
        visible: req.visible,
    };

    let plan = state
        .engine
        .catalog
        .upsert_plan(plan, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(plan.into()))
}
