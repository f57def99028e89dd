//! Shared application state

use dojogate_entitlements::EntitlementEngine;
use sqlx::PgPool;
use std::sync::Arc;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub engine: EntitlementEngine,
    /// `None` when running on the in-memory store
    pub pool: Option<PgPool>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(engine: EntitlementEngine, pool: Option<PgPool>, config: Config) -> Self {
        Self {
            engine,
            pool,
            config: Arc::new(config),
        }
    }
}
