//! DojoGate API Library
//!
//! HTTP surface of the entitlement engine: feature access checks, trial
//! start/cancel, and the platform admin endpoints.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod telemetry;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
