//! Feature access checks for the calling dojo
//!
//! The gated UI uses these to render either the feature or a locked state
//! with a trial / upgrade call-to-action. A storage outage never grants
//! access: the response degrades to `granted: false` instead of an error.

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use dojogate_entitlements::FeatureAccess;
use dojogate_shared::AccessSource;
use serde::Serialize;
use time::OffsetDateTime;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureAccessResponse {
    pub feature_key: String,
    pub granted: bool,
    pub access_type: AccessSource,
    pub reason: String,
    pub details: AccessDetails,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_remaining: Option<i64>,
    pub current_plan: Option<String>,
    pub can_start_trial: bool,
    pub had_trial_before: bool,
    /// Monthly add-on price in cents
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addon_price: Option<i64>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub trial_ends_at: Option<OffsetDateTime>,
    /// Set when the decision could not be computed and access was denied by default
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

impl From<FeatureAccess> for FeatureAccessResponse {
    fn from(access: FeatureAccess) -> Self {
        let decision = access.decision;
        Self {
            feature_key: access.feature_key,
            granted: decision.granted,
            access_type: decision.source,
            reason: decision.reason,
            details: AccessDetails {
                days_remaining: decision.days_remaining,
                current_plan: Some(access.current_plan),
                can_start_trial: access.can_start_trial,
                had_trial_before: access.had_trial_before,
                addon_price: access.addon_price_cents,
                trial_ends_at: decision.trial_expires_at,
                degraded: false,
            },
        }
    }
}

impl FeatureAccessResponse {
    fn fail_closed(feature_key: String) -> Self {
        Self {
            feature_key,
            granted: false,
            access_type: AccessSource::None,
            reason: "Access could not be verified".to_string(),
            details: AccessDetails {
                degraded: true,
                ..AccessDetails::default()
            },
        }
    }
}

/// GET /api/v1/feature-access/:feature_key
pub async fn get_feature_access(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(feature_key): Path<String>,
) -> Result<Json<FeatureAccessResponse>, ApiError> {
    match state
        .engine
        .entitlements
        .check_access(auth_user.dojo_id, &feature_key, OffsetDateTime::now_utc())
        .await
    {
        Ok(access) => Ok(Json(access.into())),
        Err(e) if e.is_unavailable() => {
            tracing::warn!(
                dojo_id = %auth_user.dojo_id,
                feature_key = %feature_key,
                error = %e,
                "Feature access check failed, denying"
            );
            Ok(Json(FeatureAccessResponse::fail_closed(feature_key)))
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Serialize)]
pub struct FeatureAccessListResponse {
    pub features: Vec<FeatureAccessResponse>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

/// GET /api/v1/feature-access
pub async fn list_feature_access(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<FeatureAccessListResponse>, ApiError> {
    match state
        .engine
        .entitlements
        .list_access(auth_user.dojo_id, OffsetDateTime::now_utc())
        .await
    {
        Ok(access) => Ok(Json(FeatureAccessListResponse {
            features: access.into_iter().map(Into::into).collect(),
            degraded: false,
        })),
        Err(e) if e.is_unavailable() => {
            tracing::warn!(
                dojo_id = %auth_user.dojo_id,
                error = %e,
                "Feature access listing failed, denying every feature"
            );
            let features = state
                .engine
                .catalog
                .cached_features()
                .await
                .into_iter()
                .map(|f| FeatureAccessResponse::fail_closed(f.key))
                .collect();
            Ok(Json(FeatureAccessListResponse {
                features,
                degraded: true,
            }))
        }
        Err(e) => Err(e.into()),
    }
}
