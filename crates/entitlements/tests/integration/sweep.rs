use async_trait::async_trait;
use dojogate_entitlements::audit::fact_type;
use dojogate_entitlements::{
    BillingCollaborator, EntitlementEngine, EntitlementResult, EntitlementStore,
    InMemoryAddonLedger,
};
use dojogate_shared::{SubscriptionStatus, TrialStatus};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use time::Duration;
use uuid::Uuid;

use crate::common::{Harness, T0};

/// Add-on ledger that answers after a delay
struct SlowLedger {
    inner: Arc<InMemoryAddonLedger>,
    delay: StdDuration,
}

#[async_trait]
impl BillingCollaborator for SlowLedger {
    async fn is_addon_active(&self, tenant_id: Uuid, feature_key: &str) -> EntitlementResult<bool> {
        tokio::time::sleep(self.delay).await;
        self.inner.is_addon_active(tenant_id, feature_key).await
    }

    async fn addon_price(&self, feature_key: &str) -> EntitlementResult<Option<i64>> {
        self.inner.addon_price(feature_key).await
    }

    async fn monthly_addon_revenue(&self) -> EntitlementResult<i64> {
        self.inner.monthly_addon_revenue().await
    }
}

#[tokio::test]
async fn test_sweep_is_idempotent() {
    let h = Harness::new().await;
    let dojo = h.onboard("starter", SubscriptionStatus::Active);
    h.engine.trials.start_trial(dojo, "sepa", T0).await.unwrap();
    h.engine.trials.start_trial(dojo, "exams", T0).await.unwrap();

    let later = T0 + Duration::days(20);
    let first = h.engine.sweeper.run(later).await.unwrap();
    assert_eq!(first.processed(), 2);

    let second = h.engine.sweeper.run(later + Duration::minutes(15)).await.unwrap();
    assert_eq!(second.examined, 0);
    assert_eq!(second.processed(), 0);

    let trials = h.engine.trials.list_trials(dojo).await.unwrap();
    assert!(trials.iter().all(|t| t.ended_at == Some(later)));
    assert_eq!(h.audit.facts_of_type(fact_type::TRIAL_EXPIRED).len(), 2);
}

#[tokio::test]
async fn test_sweep_leaves_running_trials_alone() {
    let h = Harness::new().await;
    let dojo = h.onboard("starter", SubscriptionStatus::Active);
    h.engine.trials.start_trial(dojo, "sepa", T0).await.unwrap();

    // Exactly at expires_at the trial is due
    let report = h.engine.sweeper.run(T0 + Duration::days(14) - Duration::seconds(1)).await.unwrap();
    assert_eq!(report.examined, 0);
    let report = h.engine.sweeper.run(T0 + Duration::days(14)).await.unwrap();
    assert_eq!(report.expired, 1);
}

#[tokio::test]
async fn test_sweep_converts_when_addon_or_plan_grants() {
    let h = Harness::new().await;
    let via_addon = h.onboard("starter", SubscriptionStatus::Active);
    let via_upgrade = h.onboard("starter", SubscriptionStatus::Active);
    h.engine.trials.start_trial(via_addon, "sepa", T0).await.unwrap();
    h.engine.trials.start_trial(via_upgrade, "sepa", T0).await.unwrap();

    h.billing.activate(via_addon, "sepa");
    h.store.change_plan(via_upgrade, "professional").unwrap();

    let report = h.engine.sweeper.run(T0 + Duration::days(15)).await.unwrap();
    assert_eq!(report.converted, 2);
    assert_eq!(report.expired, 0);

    for dojo in [via_addon, via_upgrade] {
        let trials = h.engine.trials.list_trials(dojo).await.unwrap();
        assert_eq!(trials[0].status, TrialStatus::Converted);
    }
    assert_eq!(h.audit.facts_of_type(fact_type::TRIAL_CONVERTED).len(), 2);
}

#[tokio::test]
async fn test_sweep_tolerates_partial_failure() {
    let h = Harness::new().await;
    let mut ids = Vec::new();
    for offset in 0..3 {
        let dojo = h.onboard("starter", SubscriptionStatus::Active);
        let started = h
            .engine
            .trials
            .start_trial(dojo, "sepa", T0 + Duration::hours(offset))
            .await
            .unwrap();
        ids.push(started.trial.id);
    }

    // The middle trial fails to close
    h.store.fail_closes_for(ids[1], true);
    let later = T0 + Duration::days(15);
    let report = h.engine.sweeper.run(later).await.unwrap();
    assert_eq!(report.examined, 3);
    assert_eq!(report.expired, 2);
    assert_eq!(report.failed, 1);

    for (i, id) in ids.iter().enumerate() {
        let trial = h.store.trial(*id).await.unwrap().unwrap();
        let expected = if i == 1 { TrialStatus::Active } else { TrialStatus::Expired };
        assert_eq!(trial.status, expected);
    }

    // Retried on the next tick
    h.store.fail_closes_for(ids[1], false);
    let report = h.engine.sweeper.run(later + Duration::minutes(15)).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.expired, 1);
}

#[tokio::test]
async fn test_sweep_respects_batch_size() {
    let h = Harness::with_batch_size(2).await;
    for _ in 0..5 {
        let dojo = h.onboard("starter", SubscriptionStatus::Active);
        h.engine.trials.start_trial(dojo, "sepa", T0).await.unwrap();
    }

    let later = T0 + Duration::days(15);
    let mut ticks = Vec::new();
    loop {
        let report = h.engine.sweeper.run(later).await.unwrap();
        if report.examined == 0 {
            break;
        }
        ticks.push(report.processed());
    }
    assert_eq!(ticks, vec![2, 2, 1]);
}

#[tokio::test]
async fn test_sweep_skips_when_lock_is_held() {
    let h = Harness::new().await;
    let dojo = h.onboard("starter", SubscriptionStatus::Active);
    h.engine.trials.start_trial(dojo, "sepa", T0).await.unwrap();

    assert!(h.store.try_lock_sweep().await.unwrap());
    let report = h.engine.sweeper.run(T0 + Duration::days(15)).await.unwrap();
    assert!(report.lock_held);
    assert_eq!(report.examined, 0);

    h.store.unlock_sweep().await.unwrap();
    let report = h.engine.sweeper.run(T0 + Duration::days(15)).await.unwrap();
    assert!(!report.lock_held);
    assert_eq!(report.expired, 1);
}

#[tokio::test]
async fn test_stats_after_sweep() {
    let h = Harness::new().await;
    let a = h.onboard("starter", SubscriptionStatus::Active);
    let b = h.onboard("starter", SubscriptionStatus::Active);
    h.engine.trials.start_trial(a, "sepa", T0).await.unwrap();
    h.engine.trials.start_trial(b, "sepa", T0).await.unwrap();
    h.engine.trials.start_trial(b, "exams", T0).await.unwrap();
    h.billing.activate(a, "sepa");

    h.engine.sweeper.run(T0 + Duration::days(15)).await.unwrap();

    let stats = h.engine.reporting.stats().await.unwrap();
    assert_eq!(stats.converted, 1);
    assert_eq!(stats.expired, 2);
    assert!((stats.conversion_rate - 1.0 / 3.0).abs() < 1e-9);
    assert_eq!(stats.top_feature.as_deref(), Some("sepa"));
    assert_eq!(stats.addon_mrr_cents, 900);
}

#[tokio::test]
async fn test_abandoned_sweep_still_releases_lock() {
    let h = Harness::new().await;
    let dojo = h.onboard("starter", SubscriptionStatus::Active);
    h.engine.trials.start_trial(dojo, "sepa", T0).await.unwrap();

    let slow = Arc::new(SlowLedger {
        inner: h.billing.clone(),
        delay: StdDuration::from_millis(200),
    });
    let engine = EntitlementEngine::new(h.store.clone(), slow, h.audit.clone(), 500)
        .await
        .unwrap();

    // The caller gives up while the run is mid-batch
    let later = T0 + Duration::days(15);
    let abandoned =
        tokio::time::timeout(StdDuration::from_millis(50), engine.sweeper.run(later)).await;
    assert!(abandoned.is_err());

    tokio::time::sleep(StdDuration::from_millis(500)).await;
    let report = engine.sweeper.run(later).await.unwrap();
    assert!(!report.lock_held);
    assert_eq!(report.examined, 0);

    let trials = h.engine.trials.list_trials(dojo).await.unwrap();
    assert_eq!(trials[0].status, TrialStatus::Expired);
    assert!(h.store.try_lock_sweep().await.unwrap());
}

#[tokio::test]
async fn test_sweep_sees_plan_edit_made_by_another_engine() {
    let h = Harness::new().await;
    let worker = h.second_engine().await;
    let dojo = h.onboard("starter", SubscriptionStatus::Active);
    h.engine.trials.start_trial(dojo, "sepa", T0).await.unwrap();

    let features: BTreeSet<String> = ["calendar", "sepa"].iter().map(|s| s.to_string()).collect();
    h.engine
        .catalog
        .set_plan_features("starter", features, T0 + Duration::days(2))
        .await
        .unwrap();

    let later = T0 + Duration::days(15);
    let decision = worker.entitlements.resolve(dojo, "sepa", later).await.unwrap();
    assert!(decision.granted);

    let report = worker.sweeper.run(later).await.unwrap();
    assert_eq!(report.converted, 1);
    assert_eq!(report.expired, 0);
    let trials = h.engine.trials.list_trials(dojo).await.unwrap();
    assert_eq!(trials[0].status, TrialStatus::Converted);
}
