//! Feature trial routes for the calling dojo

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use dojogate_entitlements::EntitlementError;
use dojogate_shared::{AccessSource, FeatureTrial, TrialStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTrialRequest {
    /// Feature key to trial
    pub feature_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelTrialRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialSummary {
    pub id: Uuid,
    pub feature_key: String,
    pub status: TrialStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub days_remaining: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

impl TrialSummary {
    fn at(trial: FeatureTrial, now: OffsetDateTime) -> Self {
        let days_remaining = if trial.is_running(now) {
            trial.days_remaining(now)
        } else {
            0
        };
        Self {
            id: trial.id,
            feature_key: trial.feature_key,
            status: trial.status,
            started_at: trial.started_at,
            expires_at: trial.expires_at,
            ended_at: trial.ended_at,
            days_remaining,
            cancel_reason: trial.cancel_reason,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTrialResponse {
    pub trial: TrialSummary,
    pub granted: bool,
    pub access_type: AccessSource,
}

/// POST /api/v1/feature-trial/start
pub async fn start_trial(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<StartTrialRequest>,
) -> Result<(StatusCode, Json<StartTrialResponse>), ApiError> {
    let feature_key = req.feature_id.trim();
    if feature_key.is_empty() {
        return Err(ApiError::BadRequest("featureId is required".to_string()));
    }

    let now = OffsetDateTime::now_utc();
    let started = state
        .engine
        .trials
        .start_trial(auth_user.dojo_id, feature_key, now)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(StartTrialResponse {
            granted: started.decision.granted,
            access_type: started.decision.source,
            trial: TrialSummary::at(started.trial, now),
        }),
    ))
}

/// DELETE /api/v1/feature-trial/:trial_id
///
/// A trial that is unknown, owned by another dojo, or no longer active is a 404.
pub async fn cancel_trial(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(trial_id): Path<Uuid>,
    body: Option<Json<CancelTrialRequest>>,
) -> Result<Json<TrialSummary>, ApiError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let now = OffsetDateTime::now_utc();

    let cancelled = state
        .engine
        .trials
        .cancel_trial_for_tenant(auth_user.dojo_id, trial_id, req.reason.as_deref(), now)
        .await
        .map_err(|e| match e {
            EntitlementError::Conflict(msg) => ApiError::NotFound(msg),
            other => other.into(),
        })?;

    Ok(Json(TrialSummary::at(cancelled, now)))
}

#[derive(Debug, Serialize)]
pub struct TrialListResponse {
    pub trials: Vec<TrialSummary>,
}

/// GET /api/v1/feature-trials
pub async fn list_trials(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<TrialListResponse>, ApiError> {
    let now = OffsetDateTime::now_utc();
    let trials = state.engine.trials.list_trials(auth_user.dojo_id).await?;

    Ok(Json(TrialListResponse {
        trials: trials.into_iter().map(|t| TrialSummary::at(t, now)).collect(),
    }))
}
