use dojogate_entitlements::audit::fact_type;
use dojogate_entitlements::EntitlementError;
use dojogate_shared::{AccessSource, SubscriptionStatus, TrialStatus};
use std::sync::Arc;
use time::Duration;

use crate::common::{Harness, T0};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_create_exactly_one_trial() {
    let h = Arc::new(Harness::new().await);
    let dojo = h.onboard("starter", SubscriptionStatus::Active);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            h.engine.trials.start_trial(dojo, "sepa", T0).await
        }));
    }

    let mut ok = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EntitlementError::Conflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 7);

    let trials = h.engine.trials.list_trials(dojo).await.unwrap();
    assert_eq!(trials.len(), 1);
    assert_eq!(h.audit.facts_of_type(fact_type::TRIAL_STARTED).len(), 1);
}

#[tokio::test]
async fn test_start_trial_preconditions() {
    let h = Harness::new().await;
    let starter = h.onboard("starter", SubscriptionStatus::Active);
    let pro = h.onboard("professional", SubscriptionStatus::Active);

    let err = h.engine.trials.start_trial(starter, "calendar", T0).await.unwrap_err();
    assert!(matches!(err, EntitlementError::InvalidState(_)));

    let err = h.engine.trials.start_trial(pro, "sepa", T0).await.unwrap_err();
    assert!(matches!(err, EntitlementError::InvalidState(_)), "already in plan");

    let err = h.engine.trials.start_trial(starter, "teleport", T0).await.unwrap_err();
    assert!(matches!(err, EntitlementError::NotFound(_)));

    let err = h
        .engine
        .trials
        .start_trial(uuid::Uuid::new_v4(), "sepa", T0)
        .await
        .unwrap_err();
    assert!(matches!(err, EntitlementError::NotFound(_)));

    h.engine
        .overrides
        .set_override(starter, "exams", Some(true), T0)
        .await
        .unwrap();
    let err = h.engine.trials.start_trial(starter, "exams", T0).await.unwrap_err();
    assert!(matches!(err, EntitlementError::InvalidState(_)), "already overridden");
}

#[tokio::test]
async fn test_cancel_trial_is_terminal() {
    let h = Harness::new().await;
    let dojo = h.onboard("starter", SubscriptionStatus::Active);
    let started = h.engine.trials.start_trial(dojo, "sepa", T0).await.unwrap();

    let at = T0 + Duration::days(2);
    let cancelled = h
        .engine
        .trials
        .cancel_trial(started.trial.id, Some("  Not needed  "), at)
        .await
        .unwrap();
    assert_eq!(cancelled.status, TrialStatus::Cancelled);
    assert_eq!(cancelled.ended_at, Some(at));
    assert_eq!(cancelled.cancel_reason.as_deref(), Some("Not needed"));

    let err = h
        .engine
        .trials
        .cancel_trial(started.trial.id, None, at)
        .await
        .unwrap_err();
    assert!(matches!(err, EntitlementError::Conflict(_)));

    // The sweep never touches a cancelled trial
    let report = h.engine.sweeper.run(T0 + Duration::days(30)).await.unwrap();
    assert_eq!(report.examined, 0);
    let trials = h.engine.trials.list_trials(dojo).await.unwrap();
    assert_eq!(trials[0].status, TrialStatus::Cancelled);
    assert_eq!(trials[0].ended_at, Some(at));

    let facts = h.audit.facts_of_type(fact_type::TRIAL_CANCELLED);
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].payload["reason"], "Not needed");
}

#[tokio::test]
async fn test_cancel_is_scoped_to_owner() {
    let h = Harness::new().await;
    let owner = h.onboard("starter", SubscriptionStatus::Active);
    let stranger = h.onboard("starter", SubscriptionStatus::Active);
    let started = h.engine.trials.start_trial(owner, "sepa", T0).await.unwrap();

    let err = h
        .engine
        .trials
        .cancel_trial_for_tenant(stranger, started.trial.id, None, T0)
        .await
        .unwrap_err();
    assert!(matches!(err, EntitlementError::NotFound(_)));

    h.engine
        .trials
        .cancel_trial_for_tenant(owner, started.trial.id, None, T0)
        .await
        .unwrap();

    let err = h
        .engine
        .trials
        .cancel_trial(uuid::Uuid::new_v4(), None, T0)
        .await
        .unwrap_err();
    assert!(matches!(err, EntitlementError::NotFound(_)));
}

#[tokio::test]
async fn test_check_access_reports_locked_state_details() {
    let h = Harness::new().await;
    let dojo = h.onboard("starter", SubscriptionStatus::Active);

    let access = h.engine.entitlements.check_access(dojo, "sepa", T0).await.unwrap();
    assert!(!access.decision.granted);
    assert_eq!(access.current_plan, "starter");
    assert!(access.can_start_trial);
    assert!(!access.had_trial_before);
    assert_eq!(access.addon_price_cents, Some(900));

    h.engine.trials.start_trial(dojo, "sepa", T0).await.unwrap();
    let access = h.engine.entitlements.check_access(dojo, "sepa", T0).await.unwrap();
    assert_eq!(access.decision.source, AccessSource::Trial);
    assert!(!access.can_start_trial);
    assert!(access.had_trial_before);

    let all = h.engine.entitlements.list_access(dojo, T0).await.unwrap();
    let keys: Vec<&str> = all.iter().map(|a| a.feature_key.as_str()).collect();
    assert_eq!(keys, vec!["calendar", "exams", "sepa"]);
    assert!(all[0].decision.granted);
}

#[tokio::test]
async fn test_addon_outranks_trial_and_lapsed_plan_fails_closed() {
    let h = Harness::new().await;
    let dojo = h.onboard("professional", SubscriptionStatus::Active);

    let d = h.engine.entitlements.resolve(dojo, "sepa", T0).await.unwrap();
    assert_eq!(d.source, AccessSource::Plan);

    h.store.set_status(dojo, SubscriptionStatus::Cancelled).unwrap();
    for key in ["calendar", "sepa", "exams"] {
        let d = h.engine.entitlements.resolve(dojo, key, T0).await.unwrap();
        assert!(!d.granted, "{key} must be denied for a cancelled dojo");
    }

    h.billing.activate(dojo, "exams");
    let d = h.engine.entitlements.resolve(dojo, "exams", T0).await.unwrap();
    assert!(d.granted);
    assert_eq!(d.source, AccessSource::Addon);
}

#[tokio::test]
async fn test_unavailable_store_surfaces_as_unavailable() {
    let h = Harness::new().await;
    let dojo = h.onboard("starter", SubscriptionStatus::Active);

    h.store.set_unavailable(true);
    let err = h.engine.entitlements.resolve(dojo, "sepa", T0).await.unwrap_err();
    assert!(err.is_unavailable());
    h.store.set_unavailable(false);

    h.billing.set_unavailable(true);
    let err = h.engine.entitlements.resolve(dojo, "sepa", T0).await.unwrap_err();
    assert!(err.is_unavailable());
}
