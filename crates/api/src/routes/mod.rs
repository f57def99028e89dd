//! API routes

pub mod admin;
pub mod catalog;
pub mod feature_access;
pub mod feature_trials;
pub mod health;

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{
    auth::{require_dojo, require_platform_admin},
    state::AppState,
};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Any dojo member
    let dojo_routes = Router::new()
        .route("/feature-access", get(feature_access::list_feature_access))
        .route("/feature-access/:feature_key", get(feature_access::get_feature_access))
        .route("/feature-trial/start", post(feature_trials::start_trial))
        .route("/feature-trial/:trial_id", delete(feature_trials::cancel_trial))
        .route("/feature-trials", get(feature_trials::list_trials))
        .route("/features", get(catalog::list_features))
        .route("/subscription-plans", get(catalog::list_plans));

    // Platform admin only
    let admin_routes = Router::new()
        .route("/process-expired-trials", post(admin::process_expired_trials))
        .route("/dojos/:dojo_id/features", put(admin::set_dojo_features))
        .route("/subscription-plans/:plan_name", put(catalog::upsert_plan))
        .route(
            "/subscription-plans/:plan_name/features",
            put(admin::set_plan_features),
        )
        .route("/features", post(catalog::register_feature))
        .route("/admin/feature-trials/stats", get(admin::trial_stats))
        .route("/admin/catalog/reload", post(admin::reload_catalog))
        .route_layer(middleware::from_fn(require_platform_admin));

    let api_routes = dojo_routes
        .merge(admin_routes)
        .route_layer(middleware::from_fn(require_dojo));

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
