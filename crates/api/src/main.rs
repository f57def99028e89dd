use anyhow::Context;
use dojogate_api::{create_router, telemetry, AppState, Config};
use dojogate_entitlements::EntitlementEngine;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;
    telemetry::init_tracing(config.log_format, "dojogate_api=info,dojogate_entitlements=info,tower_http=info");

    tracing::info!(bind_address = %config.bind_address, "Starting DojoGate API");

    let pool = dojogate_shared::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;

    if config.run_migrations {
        let migration_pool = dojogate_shared::create_migration_pool(&config.database_url)
            .await
            .context("Failed to connect for migrations")?;
        dojogate_shared::run_migrations(&migration_pool)
            .await
            .context("Failed to run migrations")?;
        migration_pool.close().await;
        tracing::info!("Database migrations applied");
    }

    let engine = EntitlementEngine::postgres(pool.clone(), config.sweep_batch_size)
        .await
        .context("Failed to initialise entitlement engine")?;

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;

    let state = AppState::new(engine.clone(), Some(pool.clone()), config);
    let app = create_router(state);

    tracing::info!("API server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    engine.shutdown().await;
    pool.close().await;
    tracing::info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
