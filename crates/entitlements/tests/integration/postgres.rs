//! Postgres-backed checks of the storage guarantees

use dojogate_entitlements::{EntitlementEngine, EntitlementError, EntitlementStore, PgEntitlementStore};
use dojogate_shared::TrialStatus;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

async fn setup() -> PgPool {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    let pool = dojogate_shared::create_pool(&database_url, 10)
        .await
        .expect("Failed to connect to test database");
    dojogate_shared::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

async fn create_test_dojo(pool: &PgPool) -> Uuid {
    let dojo_id = Uuid::new_v4();
    sqlx::query("INSERT INTO dojo_subscriptions (dojo_id, plan_name, status) VALUES ($1, 'starter', 'active')")
        .bind(dojo_id)
        .execute(pool)
        .await
        .expect("Failed to create test dojo");
    dojo_id
}

async fn cleanup_test_data(pool: &PgPool, dojo_id: Uuid) {
    let _ = sqlx::query("DELETE FROM feature_trials WHERE dojo_id = $1")
        .bind(dojo_id)
        .execute(pool)
        .await;
    let _ = sqlx::query("DELETE FROM dojo_feature_overrides WHERE dojo_id = $1")
        .bind(dojo_id)
        .execute(pool)
        .await;
    let _ = sqlx::query("DELETE FROM feature_audit_log WHERE dojo_id = $1")
        .bind(dojo_id)
        .execute(pool)
        .await;
    let _ = sqlx::query("DELETE FROM dojo_subscriptions WHERE dojo_id = $1")
        .bind(dojo_id)
        .execute(pool)
        .await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_pg_concurrent_starts_one_wins() {
    let pool = setup().await;
    let dojo = create_test_dojo(&pool).await;
    let engine = EntitlementEngine::postgres(pool.clone(), 500).await.unwrap();
    let now = OffsetDateTime::now_utc();

    let (a, b) = tokio::join!(
        engine.trials.start_trial(dojo, "sepa", now),
        engine.trials.start_trial(dojo, "sepa", now),
    );
    let conflicts = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Err(EntitlementError::Conflict(_))))
        .count();
    assert_eq!(conflicts, 1, "a: {a:?}, b: {b:?}");
    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);

    cleanup_test_data(&pool, dojo).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_pg_close_is_conditional_and_lock_is_exclusive() {
    let pool = setup().await;
    let dojo = create_test_dojo(&pool).await;
    let engine = EntitlementEngine::postgres(pool.clone(), 500).await.unwrap();
    let now = OffsetDateTime::now_utc();

    let started = engine.trials.start_trial(dojo, "sepa", now).await.unwrap();
    let store = PgEntitlementStore::new(pool.clone());
    let closed = store
        .close_trial(started.trial.id, TrialStatus::Expired, now, None)
        .await
        .unwrap();
    assert!(closed.is_some());
    let again = store
        .close_trial(started.trial.id, TrialStatus::Converted, now, None)
        .await
        .unwrap();
    assert!(again.is_none());

    let other = Arc::new(PgEntitlementStore::new(pool.clone()));
    assert!(store.try_lock_sweep().await.unwrap());
    assert!(!other.try_lock_sweep().await.unwrap());
    store.unlock_sweep().await.unwrap();
    assert!(other.try_lock_sweep().await.unwrap());
    other.unlock_sweep().await.unwrap();

    cleanup_test_data(&pool, dojo).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_pg_override_batch_rolls_back_on_failure() {
    let pool = setup().await;
    let dojo = create_test_dojo(&pool).await;
    let store = PgEntitlementStore::new(pool.clone());

    // The unregistered key violates the foreign key after "exams" was written
    let changes = BTreeMap::from([
        ("exams".to_string(), Some(true)),
        ("zz_unregistered".to_string(), Some(true)),
    ]);
    assert!(store.set_overrides(dojo, &changes).await.is_err());
    let sub = store.subscription(dojo).await.unwrap().unwrap();
    assert!(sub.feature_overrides.is_empty());

    let changes = BTreeMap::from([("exams".to_string(), Some(true))]);
    let sub = store.set_overrides(dojo, &changes).await.unwrap();
    assert_eq!(sub.override_for("exams"), Some(true));

    cleanup_test_data(&pool, dojo).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_pg_catalog_version_tracks_direct_edits() {
    let pool = setup().await;
    let store = PgEntitlementStore::new(pool.clone());
    let before = store.catalog_version().await.unwrap();

    sqlx::query("UPDATE subscription_plans SET visible = visible WHERE name = 'starter'")
        .execute(&pool)
        .await
        .unwrap();
    assert!(store.catalog_version().await.unwrap() > before);

    assert!(store.plan_includes("enterprise", "calendar").await.unwrap());
    assert!(!store.plan_includes("starter", "no_such_feature").await.unwrap());
}
